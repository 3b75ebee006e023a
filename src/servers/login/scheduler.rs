//! Named timer registry.
//!
//! Callbacks are registered by name before they can be scheduled — this
//! indirection exists so a reload or a log line can refer to a job by a
//! stable string instead of a raw closure/fd.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub type TimerCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct Scheduler {
    callbacks: Mutex<HashMap<String, TimerCallback>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub async fn register(&self, name: &str, callback: TimerCallback) {
        self.callbacks.lock().await.insert(name.to_string(), callback);
    }

    /// Runs the named callback once, after `delay`.
    pub async fn schedule_once(&self, name: &str, delay: Duration) -> Result<()> {
        let cb = self.lookup(name).await?;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cb().await;
        });
        self.handles.lock().await.insert(name.to_string(), handle);
        Ok(())
    }

    /// Runs the named callback after `first`, then every `period`.
    pub async fn schedule_interval(&self, name: &str, first: Duration, period: Duration) -> Result<()> {
        let cb = self.lookup(name).await?;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(first).await;
            let mut ticker = tokio::time::interval(period);
            loop {
                cb().await;
                ticker.tick().await;
            }
        });
        self.handles.lock().await.insert(name.to_string(), handle);
        Ok(())
    }

    /// Aborts and forgets the named job's running task, if any.
    pub async fn cancel(&self, name: &str) -> bool {
        if let Some(handle) = self.handles.lock().await.remove(name) {
            handle.abort();
            true
        } else {
            false
        }
    }

    async fn lookup(&self, name: &str) -> Result<TimerCallback> {
        self.callbacks
            .lock()
            .await
            .get(name)
            .cloned()
            .with_context(|| format!("timer {:?} scheduled before it was registered", name))
    }
}
