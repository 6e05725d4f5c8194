use std::collections::HashMap;

use tokio::sync::Mutex;

/// Named build counters.
///
/// Counts only ever grow while the process lives. Reading an unknown trigger
/// stores a zero so that "never seen" and "seen at zero" look the same.
#[derive(Default)]
pub struct TriggerStore {
    counts: Mutex<HashMap<String, u64>>,
}

impl TriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, trigger: &str) -> u64 {
        let mut guard = self.counts.lock().await;
        *guard.entry(trigger.to_string()).or_insert(0)
    }

    pub async fn increment(&self, trigger: &str) -> u64 {
        let mut guard = self.counts.lock().await;
        let count = guard.entry(trigger.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Current value without creating the entry.
    pub async fn peek(&self, trigger: &str) -> Option<u64> {
        self.counts.lock().await.get(trigger).copied()
    }

    pub async fn len(&self) -> usize {
        self.counts.lock().await.len()
    }
}
