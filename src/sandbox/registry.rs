//! Bookkeeping of every live execution unit.
//!
//! Each executor invocation registers its container under the container
//! name before asking the runtime to create it, and unregisters it only
//! after kill and remove have returned. On shutdown the coordinator calls
//! [`InstanceRegistry::cleanup_all`] to destroy whatever is still listed.
//!
//! Claiming an entry is what grants the right to tear the container down:
//! whichever side claims it (its own invocation via
//! [`claim`](InstanceRegistry::claim) or the shutdown sweep) issues the kill
//! and remove, so each container is destroyed exactly once. A claimed entry
//! stays listed until its teardown finishes, and the sweep waits for those
//! before returning. The lock is only ever held for a map operation, never
//! across a runtime call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::RuntimeError;
use crate::sandbox::runtime::ContainerRuntime;

struct Entry {
    runtime: Arc<dyn ContainerRuntime>,
    language: String,
    registered_at: DateTime<Utc>,
    /// Someone is tearing this instance down.
    claimed: bool,
}

/// Snapshot of one registered instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub language: String,
    pub registered_at: DateTime<Utc>,
    pub claimed: bool,
}

/// Concurrency-safe map of instance name → the runtime that owns it.
pub struct InstanceRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    /// Number of registered entries, published on every change.
    live: watch::Sender<usize>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            live,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave the map half-updated
        // (every critical section is a single map call), so poisoning is
        // safe to ignore.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, instance_id: &str, runtime: Arc<dyn ContainerRuntime>, language: &str) {
        let mut entries = self.entries();
        let previous = entries.insert(
            instance_id.to_string(),
            Entry {
                runtime,
                language: language.to_string(),
                registered_at: Utc::now(),
                claimed: false,
            },
        );
        self.live.send_replace(entries.len());
        drop(entries);

        if previous.is_some() {
            tracing::warn!(instance_id = %instance_id, "Instance registered twice");
        }
        tracing::debug!(instance_id = %instance_id, "Registered instance");
    }

    /// Take the right to tear an instance down. Returns `false` if it is
    /// not registered or someone else already claimed it.
    pub fn claim(&self, instance_id: &str) -> bool {
        match self.entries().get_mut(instance_id) {
            Some(entry) if !entry.claimed => {
                entry.claimed = true;
                true
            }
            _ => false,
        }
    }

    /// Hand a claimed instance back so the sweep can take it.
    pub(crate) fn unclaim(&self, instance_id: &str) {
        if let Some(entry) = self.entries().get_mut(instance_id) {
            entry.claimed = false;
        }
    }

    /// Remove an instance. Returns `false` if it was not registered.
    pub fn unregister(&self, instance_id: &str) -> bool {
        let mut entries = self.entries();
        let removed = entries.remove(instance_id).is_some();
        self.live.send_replace(entries.len());
        drop(entries);

        if removed {
            tracing::debug!(instance_id = %instance_id, "Unregistered instance");
        }
        removed
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries().contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn list(&self) -> Vec<InstanceInfo> {
        self.entries()
            .iter()
            .map(|(id, entry)| InstanceInfo {
                instance_id: id.clone(),
                language: entry.language.clone(),
                registered_at: entry.registered_at,
                claimed: entry.claimed,
            })
            .collect()
    }

    /// Destroy every unclaimed instance, then wait for teardowns already
    /// in flight elsewhere to finish. Idempotent: a second call finds an
    /// empty map. Returns how many instances this sweep destroyed.
    pub async fn cleanup_all(&self, teardown_timeout: Duration) -> usize {
        let swept: Vec<(String, Arc<dyn ContainerRuntime>, String, DateTime<Utc>)> = self
            .entries()
            .iter_mut()
            .filter(|(_, entry)| !entry.claimed)
            .map(|(id, entry)| {
                entry.claimed = true;
                (
                    id.clone(),
                    Arc::clone(&entry.runtime),
                    entry.language.clone(),
                    entry.registered_at,
                )
            })
            .collect();

        let count = swept.len();
        if count > 0 {
            tracing::warn!(count, "Force-removing leftover instances");

            futures::future::join_all(swept.into_iter().map(
                |(id, runtime, language, registered_at)| async move {
                    let age = Utc::now() - registered_at;
                    tracing::info!(
                        instance_id = %id,
                        language = %language,
                        age_secs = age.num_seconds(),
                        "Cleaning up instance"
                    );
                    destroy_instance(runtime.as_ref(), &id, teardown_timeout).await;
                    self.unregister(&id);
                },
            ))
            .await;
        }

        // A destroy makes two calls, each bounded by the teardown timeout.
        self.settle(teardown_timeout * 2 + Duration::from_secs(1))
            .await;
        count
    }

    /// Wait up to `bound` for the registry to empty out.
    async fn settle(&self, bound: Duration) {
        let mut live = self.live.subscribe();
        let settled = tokio::time::timeout(bound, live.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !settled {
            tracing::warn!(
                remaining = self.len(),
                "Instances still registered after cleanup"
            );
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Kill and force-remove an instance, each call bounded by `timeout`.
///
/// Never fails: "already stopped" and "no such container" are expected
/// races and logged at debug, anything else at warn.
pub(crate) async fn destroy_instance(
    runtime: &dyn ContainerRuntime,
    instance_id: &str,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, runtime.kill(instance_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log_teardown_error("kill", instance_id, &e),
        Err(_) => {
            tracing::warn!(instance_id = %instance_id, ?timeout, "Kill timed out");
        }
    }

    match tokio::time::timeout(timeout, runtime.remove(instance_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log_teardown_error("remove", instance_id, &e),
        Err(_) => {
            tracing::warn!(
                instance_id = %instance_id,
                ?timeout,
                "Remove timed out (may require manual cleanup)"
            );
        }
    }
}

fn log_teardown_error(op: &str, instance_id: &str, err: &RuntimeError) {
    match err {
        RuntimeError::NotFound(_) => {
            tracing::debug!(instance_id = %instance_id, op, "Instance already gone");
        }
        other => {
            tracing::warn!(instance_id = %instance_id, op, error = %other, "Teardown call failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{Call, FakeRuntime};

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = InstanceRegistry::new();
        let runtime = Arc::new(FakeRuntime::new());

        registry.register("c1", runtime.clone(), "python");
        assert!(registry.contains("c1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].language, "python");

        assert!(registry.unregister("c1"));
        assert!(!registry.unregister("c1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_tears_down_each_instance_once() {
        let registry = InstanceRegistry::new();
        let runtime = Arc::new(FakeRuntime::new());

        for id in ["a", "b", "c"] {
            registry.register(id, runtime.clone(), "python");
        }
        // "b" cleaned itself up before the sweep.
        assert!(registry.unregister("b"));

        let swept = registry.cleanup_all(Duration::from_secs(1)).await;
        assert_eq!(swept, 2);
        assert!(registry.is_empty());

        for id in ["a", "c"] {
            assert_eq!(runtime.count(&Call::Kill(id.to_string())), 1);
            assert_eq!(runtime.count(&Call::Remove(id.to_string())), 1);
        }
        assert_eq!(runtime.count(&Call::Kill("b".to_string())), 0);

        // Idempotent.
        assert_eq!(registry.cleanup_all(Duration::from_secs(1)).await, 0);
        assert_eq!(runtime.count(&Call::Kill("a".to_string())), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = InstanceRegistry::new();
        registry.register("c1", Arc::new(FakeRuntime::new()), "go");

        assert!(registry.claim("c1"));
        assert!(!registry.claim("c1"));
        assert!(registry.list()[0].claimed);
        // Claimed instances stay listed until their teardown finishes.
        assert_eq!(registry.len(), 1);

        registry.unclaim("c1");
        assert!(registry.claim("c1"));
        assert!(!registry.claim("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_all_waits_for_claimed_teardown() {
        let registry = Arc::new(InstanceRegistry::new());
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(|s| s.teardown_delay = Some(Duration::from_millis(500)));
        registry.register("busy", runtime.clone(), "python");
        registry.register("idle", runtime.clone(), "python");

        // Another owner is part-way through destroying "busy".
        assert!(registry.claim("busy"));
        let owner = {
            let registry = Arc::clone(&registry);
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                destroy_instance(runtime.as_ref(), "busy", Duration::from_secs(1)).await;
                registry.unregister("busy");
            })
        };
        tokio::task::yield_now().await;

        let swept = registry.cleanup_all(Duration::from_secs(1)).await;
        assert_eq!(swept, 1);
        assert!(registry.is_empty());
        for id in ["busy", "idle"] {
            assert_eq!(runtime.count(&Call::Kill(id.to_string())), 1);
            assert_eq!(runtime.count(&Call::Remove(id.to_string())), 1);
        }
        owner.await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_instance_swallows_errors() {
        let runtime = FakeRuntime::new();
        runtime.script(|s| {
            s.kill_error = Some(RuntimeError::NotFound("gone".to_string()));
            s.remove_error = Some(RuntimeError::Api("daemon hiccup".to_string()));
        });

        // Twice on the same id: never errors the caller.
        destroy_instance(&runtime, "gone", Duration::from_secs(1)).await;
        destroy_instance(&runtime, "gone", Duration::from_secs(1)).await;
        assert_eq!(runtime.count(&Call::Remove("gone".to_string())), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_instance_bounded_by_timeout() {
        let runtime = FakeRuntime::new();
        runtime.script(|s| s.hang_teardown = true);

        let started = tokio::time::Instant::now();
        destroy_instance(&runtime, "stuck", Duration::from_millis(200)).await;
        // kill and remove each time out once
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
