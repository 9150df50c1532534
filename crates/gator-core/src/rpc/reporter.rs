//! Worker-side status reporting over the RPC bus.
//!
//! Report calls are fire-and-forget: failures are logged and swallowed,
//! matching the best-effort `insert_agent_event` precedent in
//! [`crate::lifecycle`] -- a dropped status update should never abort a
//! running agent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use super::Bus;

pub struct StatusReporter {
    client: Arc<Bus>,
    worker_id: String,
}

impl StatusReporter {
    pub fn new(client: Arc<Bus>, worker_id: impl Into<String>) -> Self {
        Self {
            client,
            worker_id: worker_id.into(),
        }
    }

    pub async fn report_ready(&self) {
        self.client.emit("worker:ready", &self.worker_id, None, json!({})).await;
    }

    pub async fn report_task_started(&self, task_id: &str) {
        self.client
            .emit("worker:task_started", &self.worker_id, Some(task_id), json!({}))
            .await;
    }

    pub async fn report_progress(&self, task_id: &str, percent: u8, message: &str) {
        self.client
            .emit(
                "worker:task_progress",
                &self.worker_id,
                Some(task_id),
                json!({"percent": percent, "message": message}),
            )
            .await;
    }

    pub async fn report_task_completed(&self, task_id: &str, result: serde_json::Value) {
        self.client
            .emit("worker:task_completed", &self.worker_id, Some(task_id), result)
            .await;
    }

    pub async fn report_task_failed(&self, task_id: &str, error: &str) {
        self.client
            .emit(
                "worker:task_failed",
                &self.worker_id,
                Some(task_id),
                json!({"error": error}),
            )
            .await;
    }

    pub async fn report_log(&self, level: &str, message: &str, data: serde_json::Value) {
        self.client
            .emit(
                "worker:log",
                &self.worker_id,
                None,
                json!({"level": level, "message": message, "data": data}),
            )
            .await;
    }

    /// Spawn a loop that emits a heartbeat immediately then every
    /// `interval`. Dropping the returned handle (or calling `.abort()`)
    /// stops it.
    pub fn start_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                client.heartbeat(&worker_id).await;
            }
        })
    }
}
