//! Keyed, cancellable async requests
//!
//! Each async boundary (fetching a version, polling an instance, fetching
//! tools) is spawned under a key. Spawning again for the same key aborts the
//! request still in flight, so a late reply can never overwrite a newer one.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;

use tokio::task::{AbortHandle, JoinHandle};

/// Keys used by the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// Fetch of one workflow version (`None` = latest)
    Workflow {
        workflow_id: String,
        version: Option<u32>,
    },
    /// Polling of one execution instance
    Execution(String),
    /// Fetch of the tool catalogue
    Tools,
    /// Fetch of a workflow exposed as a sub-workflow tool
    SubWorkflow(String),
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKey::Workflow {
                workflow_id,
                version: Some(version),
            } => write!(f, "workflow {}@{}", workflow_id, version),
            RequestKey::Workflow { workflow_id, .. } => {
                write!(f, "workflow {}@latest", workflow_id)
            }
            RequestKey::Execution(instance_id) => write!(f, "execution {}", instance_id),
            RequestKey::Tools => f.write_str("tools"),
            RequestKey::SubWorkflow(workflow_id) => write!(f, "sub-workflow {}", workflow_id),
        }
    }
}

/// Tracks spawned requests by key; dropping the tracker aborts them all
#[derive(Debug)]
pub struct RequestTracker<K> {
    handles: HashMap<K, AbortHandle>,
}

impl<K> Default for RequestTracker<K> {
    fn default() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Display> RequestTracker<K> {
    /// Tracker with no requests
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` under `key`, superseding any request for the same key
    pub fn spawn<F>(&mut self, key: K, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.prune();
        let handle = tokio::spawn(future);
        if let Some(previous) = self.handles.insert(key.clone(), handle.abort_handle()) {
            if !previous.is_finished() {
                log::debug!("Superseding in-flight request for {}", key);
                previous.abort();
            }
        }
        handle
    }

    /// Abort the request for `key`; returns whether one was in flight
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.handles.remove(key) {
            Some(handle) if !handle.is_finished() => {
                log::debug!("Cancelled request for {}", key);
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Abort every tracked request
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    /// A request under `key` has not finished
    pub fn is_pending(&self, key: &K) -> bool {
        self.handles
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of requests still in flight
    pub fn pending(&self) -> usize {
        self.handles
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn prune(&mut self) {
        self.handles.retain(|_, handle| !handle.is_finished());
    }
}

impl<K> Drop for RequestTracker<K> {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_supersedes() {
        let mut tracker = RequestTracker::new();
        let first = tracker.spawn(RequestKey::Tools, std::future::pending::<u32>());
        let second = tracker.spawn(RequestKey::Tools, async { 2u32 });

        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(second.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_side_by_side() {
        let mut tracker = RequestTracker::new();
        let a = tracker.spawn(RequestKey::Execution("a".into()), async { "a" });
        let b = tracker.spawn(RequestKey::Execution("b".into()), async { "b" });

        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_cancel_and_drop_abort() {
        let mut tracker = RequestTracker::new();
        let key = RequestKey::Workflow {
            workflow_id: "wf".into(),
            version: Some(2),
        };
        let handle = tracker.spawn(key.clone(), std::future::pending::<()>());
        assert!(tracker.is_pending(&key));
        assert!(tracker.cancel(&key));
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!tracker.cancel(&key));

        let handle = tracker.spawn(key, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        drop(tracker);
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_key_display() {
        let key = RequestKey::Workflow {
            workflow_id: "wf".into(),
            version: None,
        };
        assert_eq!(key.to_string(), "workflow wf@latest");
    }
}
