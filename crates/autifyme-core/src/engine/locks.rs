//! Per-workflow critical sections and in-flight markers.
//!
//! Distinct workflows never contend: each workflow id gets its own mutex,
//! created on demand and dropped again once nobody holds or waits on it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::EngineError;

#[derive(Default)]
pub(crate) struct WorkflowLocks {
    sections: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    in_flight: Mutex<HashSet<String>>,
}

impl WorkflowLocks {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the workflow as having an `advance`/`resume` in progress.
    ///
    /// Fails fast with `ConcurrentModification` when another one already is.
    pub(crate) fn begin(self: &Arc<Self>, workflow_id: &str) -> Result<InFlight, EngineError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(workflow_id.to_string()) {
            return Err(EngineError::ConcurrentModification(format!(
                "workflow {} already has a step in flight",
                workflow_id
            )));
        }
        Ok(InFlight {
            locks: Arc::clone(self),
            workflow_id: workflow_id.to_string(),
        })
    }

    /// Enter the workflow's critical section.
    pub(crate) async fn section(self: &Arc<Self>, workflow_id: &str) -> Section {
        let mutex = {
            let mut sections = self.sections.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                sections
                    .entry(workflow_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = mutex.lock_owned().await;
        Section {
            locks: Arc::clone(self),
            workflow_id: workflow_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_sections(&self) -> usize {
        self.sections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub(crate) struct InFlight {
    locks: Arc<WorkflowLocks>,
    workflow_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut in_flight = self.locks.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.workflow_id);
    }
}

pub(crate) struct Section {
    locks: Arc<WorkflowLocks>,
    workflow_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Section {
    fn drop(&mut self) {
        let mut sections = self.locks.sections.lock().unwrap_or_else(|e| e.into_inner());
        // map + our guard: nobody else is waiting
        if let Some(mutex) = sections.get(&self.workflow_id) {
            if Arc::strong_count(mutex) == 2 {
                sections.remove(&self.workflow_id);
            }
        }
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_in_flight_rejects_second_caller() {
        let locks = WorkflowLocks::new();
        let first = locks.begin("wf-1").unwrap();
        assert!(matches!(locks.begin("wf-1"), Err(EngineError::ConcurrentModification(_))));
        // other workflows are unaffected
        let _other = locks.begin("wf-2").unwrap();
        drop(first);
        locks.begin("wf-1").unwrap();
    }

    #[tokio::test]
    async fn test_section_serializes_same_workflow() {
        let locks = WorkflowLocks::new();
        let held = locks.section("wf-1").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _s = locks2.section("wf-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // a different workflow does not wait
        let _other = locks.section("wf-2").await;

        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_sections_are_cleaned_up() {
        let locks = WorkflowLocks::new();
        {
            let _a = locks.section("wf-1").await;
            let _b = locks.section("wf-2").await;
            assert_eq!(locks.tracked_sections(), 2);
        }
        assert_eq!(locks.tracked_sections(), 0);
    }
}
