//! Tracking of per-proxy listener tasks
//!
//! Each TCP proxy owns a public accept-loop task; the tracker aborts it on
//! CloseProxy and sweeps everything when the owning session tears down.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks public listener tasks keyed by proxy name
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register the listener task for a proxy, aborting any stale one
    pub fn register(&self, proxy_name: String, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old) = tasks.remove(&proxy_name) {
                old.abort();
            }
            tasks.insert(proxy_name, handle);
        }
    }

    /// Abort and forget the listener task for a proxy
    pub fn unregister(&self, proxy_name: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(proxy_name) {
                handle.abort();
            }
        }
    }

    /// Abort every tracked task (session teardown)
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let tracker = TaskTracker::new();

        let handle =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register("web".to_string(), handle);
        assert_eq!(tracker.len(), 1);

        tracker.unregister("web");
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_stale_task() {
        let tracker = TaskTracker::new();

        let first =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register("web".to_string(), first);

        let second =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register("web".to_string(), second);

        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_all() {
        let tracker = TaskTracker::new();
        for name in ["web", "api", "db"] {
            let handle = tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await
            });
            tracker.register(name.to_string(), handle);
        }

        tracker.abort_all();
        assert!(tracker.is_empty());
    }
}
