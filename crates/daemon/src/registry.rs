//! Asynchronous execution registry
//!
//! Tracks runs submitted without waiting so callers can poll for the
//! outcome. Holds at most `capacity` entries; the oldest finished entries are
//! evicted first and runs still in progress are never evicted.

use agenticqa_common::ExecutionReport;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Where a submitted run stands
#[derive(Debug, Clone)]
pub enum ExecutionEntry {
    InProgress { test_id: String },
    Completed(Box<ExecutionReport>),
    Failed { test_id: String, error: String },
}

impl ExecutionEntry {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionEntry::InProgress { .. })
    }

    /// Polling response body.
    pub fn to_json(&self, execution_id: &str) -> serde_json::Value {
        match self {
            ExecutionEntry::InProgress { test_id } => json!({
                "executionId": execution_id,
                "testId": test_id,
                "status": "in_progress",
            }),
            ExecutionEntry::Completed(report) => {
                let mut body = serde_json::to_value(report.as_ref()).unwrap_or_else(|_| json!({}));
                if let Some(map) = body.as_object_mut() {
                    map.insert("executionId".to_string(), json!(execution_id));
                }
                body
            }
            ExecutionEntry::Failed { test_id, error } => json!({
                "executionId": execution_id,
                "testId": test_id,
                "status": "failed",
                "error": error,
            }),
        }
    }
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, ExecutionEntry>,
    order: VecDeque<String>,
}

pub struct ExecutionRegistry {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl ExecutionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record a new in-progress run and return its execution id.
    pub fn submit(&self, test_id: &str) -> String {
        let execution_id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock();
        entries.by_id.insert(
            execution_id.clone(),
            ExecutionEntry::InProgress {
                test_id: test_id.to_string(),
            },
        );
        entries.order.push_back(execution_id.clone());
        Self::evict(&mut entries, self.capacity);
        execution_id
    }

    pub fn complete(&self, execution_id: &str, report: ExecutionReport) {
        self.finish(execution_id, ExecutionEntry::Completed(Box::new(report)));
    }

    pub fn fail(&self, execution_id: &str, test_id: &str, error: impl ToString) {
        self.finish(
            execution_id,
            ExecutionEntry::Failed {
                test_id: test_id.to_string(),
                error: error.to_string(),
            },
        );
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionEntry> {
        self.entries.lock().by_id.get(execution_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, execution_id: &str, entry: ExecutionEntry) {
        let mut entries = self.entries.lock();
        match entries.by_id.get_mut(execution_id) {
            Some(slot) => *slot = entry,
            None => debug!(execution_id, "finished execution was already evicted"),
        }
        Self::evict(&mut entries, self.capacity);
    }

    fn evict(entries: &mut Entries, capacity: usize) {
        while entries.by_id.len() > capacity {
            let position = entries.order.iter().position(|id| {
                entries
                    .by_id
                    .get(id)
                    .map(ExecutionEntry::is_finished)
                    .unwrap_or(true)
            });
            let Some(position) = position else {
                break;
            };
            if let Some(id) = entries.order.remove(position) {
                entries.by_id.remove(&id);
                debug!(execution_id = %id, "evicted finished execution");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenticqa_common::ExecutionResult;

    fn report(test_id: &str) -> ExecutionReport {
        ExecutionReport::new(test_id, ExecutionResult::assemble(vec![], vec![], None, None, 3))
    }

    #[test]
    fn test_lifecycle_and_polling_bodies() {
        let registry = ExecutionRegistry::new(8);
        let id = registry.submit("t-1");

        let body = registry.get(&id).unwrap().to_json(&id);
        assert_eq!(body["status"], "in_progress");
        assert_eq!(body["testId"], "t-1");

        registry.complete(&id, report("t-1"));
        let body = registry.get(&id).unwrap().to_json(&id);
        assert_eq!(body["executionId"], id.as_str());
        assert_eq!(body["status"], "passed");
        assert_eq!(body["duration"], 3);

        let other = registry.submit("t-2");
        registry.fail(&other, "t-2", "agent unavailable");
        let body = registry.get(&other).unwrap().to_json(&other);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "agent unavailable");

        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_evicts_oldest_finished_first() {
        let registry = ExecutionRegistry::new(2);
        let running = registry.submit("a");
        let done = registry.submit("b");
        registry.complete(&done, report("b"));

        let newest = registry.submit("c");
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&running).is_some());
        assert!(registry.get(&done).is_none());
        assert!(registry.get(&newest).is_some());
    }

    #[test]
    fn test_running_entries_are_never_evicted() {
        let registry = ExecutionRegistry::new(1);
        let a = registry.submit("a");
        let b = registry.submit("b");
        assert_eq!(registry.len(), 2);

        registry.complete(&a, report("a"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&b).is_some());
    }
}
