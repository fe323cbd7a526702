use crate::config::RunFlags;
use crate::env::Environment;
use crate::inventory::{Inventory, InventoryHandle};
use crate::log::RunLogger;
use crate::types::HostOperationError;
use crate::ui::{NoopSpinner, Prompt, Spinner, TerminalPrompt};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// 最近一次活动时间，供无活动看门狗使用
#[derive(Debug)]
pub struct ActivityTracker {
    last_activity_ms: AtomicI64,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self {
            last_activity_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }
}

impl ActivityTracker {
    pub fn touch(&self) {
        self.last_activity_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let elapsed =
            chrono::Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// 超过 `timeout` 没有活动时返回
    pub async fn watchdog(&self, timeout: Duration, check_every: Duration) {
        let mut interval = tokio::time::interval(check_every);
        loop {
            interval.tick().await;
            if self.idle_for() >= timeout {
                return;
            }
        }
    }
}

/// 一次运行的共享状态
pub struct RunContext {
    pub flags: RunFlags,
    pub inventory: Option<InventoryHandle>,
    pub spinner: Arc<dyn Spinner>,
    pub prompt: Arc<dyn Prompt>,
    pub logger: RunLogger,
    pub activity: ActivityTracker,
    registered: Mutex<Environment>,
    changes: Mutex<BTreeMap<String, i64>>,
    resume: Mutex<Vec<HostOperationError>>,
    canceled: AtomicBool,
}

impl RunContext {
    pub fn new(flags: RunFlags, logger: RunLogger) -> Self {
        Self {
            flags,
            inventory: None,
            spinner: Arc::new(NoopSpinner),
            prompt: Arc::new(TerminalPrompt),
            logger,
            activity: ActivityTracker::default(),
            registered: Mutex::new(Environment::new()),
            changes: Mutex::new(BTreeMap::new()),
            resume: Mutex::new(Vec::new()),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn with_inventory(mut self, inventory: Option<InventoryHandle>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_spinner(mut self, spinner: Arc<dyn Spinner>) -> Self {
        self.spinner = spinner;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn inventory_snapshot(&self) -> Result<Option<Arc<Inventory>>> {
        self.inventory.as_ref().map(|h| h.snapshot()).transpose()
    }

    pub fn register(&self, name: &str, value: String) {
        lock(&self.registered).insert(name.to_string(), value);
    }

    pub fn registered(&self) -> Environment {
        lock(&self.registered).clone()
    }

    pub fn add_changes(&self, host: &str, count: i64) {
        *lock(&self.changes).entry(host.to_string()).or_insert(0) += count;
    }

    pub fn changes_for(&self, host: &str) -> i64 {
        lock(&self.changes).get(host).copied().unwrap_or(0)
    }

    pub fn record_failure(&self, host: &str, error: &str) {
        lock(&self.resume).push(HostOperationError {
            host: host.to_string(),
            operation_error: Some(error.to_string()),
        });
    }

    pub fn failures(&self) -> Vec<HostOperationError> {
        lock(&self.resume).clone()
    }

    pub fn mark_canceled(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }
}

/// 锁中毒时继续使用内部数据
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_last_writer_wins() {
        let ctx = RunContext::new(RunFlags::silent(), RunLogger::disabled());
        ctx.register("X", "1".to_string());
        ctx.register("X", "2".to_string());
        assert_eq!(ctx.registered().get("X").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_change_counters() {
        let ctx = RunContext::new(RunFlags::silent(), RunLogger::disabled());
        ctx.add_changes("h1", 2);
        ctx.add_changes("h1", 3);
        assert_eq!(ctx.changes_for("h1"), 5);
        assert_eq!(ctx.changes_for("h2"), 0);
    }

    #[tokio::test]
    async fn test_watchdog_fires_when_idle() {
        let tracker = ActivityTracker::default();
        tokio::time::timeout(
            Duration::from_secs(2),
            tracker.watchdog(Duration::from_millis(50), Duration::from_millis(10)),
        )
        .await
        .expect("watchdog should fire");
    }
}
