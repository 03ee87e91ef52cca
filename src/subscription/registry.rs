//! Process-wide subscription directory
//!
//! Maps dialog id to lightweight metadata and keeps a per-tenant count so
//! admission control is O(1). A single mutex serializes access; it is only
//! touched at dialog create/terminate and for admin snapshots, so contention
//! is acceptable. Lookups return copies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use super::types::{SubLifecycle, SubscriptionType};

/// Metadata snapshot for one registered dialog
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub dialog_id: String,
    pub tenant_id: String,
    pub kind: SubscriptionType,
    pub lifecycle: SubLifecycle,
    pub last_activity: Instant,
    pub worker_index: usize,
}

#[derive(Default)]
struct RegistryInner {
    subscriptions: HashMap<String, SubscriptionInfo>,
    tenant_counts: HashMap<String, usize>,
}

/// Directory of all live dialogs across workers
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-registration updates in place without double-counting
    pub fn register(&self, info: SubscriptionInfo) {
        let mut inner = self.inner.lock().unwrap();
        match inner.subscriptions.insert(info.dialog_id.clone(), info.clone()) {
            Some(_) => {}
            None => {
                *inner.tenant_counts.entry(info.tenant_id).or_insert(0) += 1;
            }
        }
    }

    /// Idempotent; removes the tenant entry when its count reaches zero
    pub fn unregister(&self, dialog_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.subscriptions.remove(dialog_id) {
            if let Some(count) = inner.tenant_counts.get_mut(&info.tenant_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.tenant_counts.remove(&info.tenant_id);
                }
            }
        }
    }

    pub fn lookup(&self, dialog_id: &str) -> Option<SubscriptionInfo> {
        self.inner.lock().unwrap().subscriptions.get(dialog_id).cloned()
    }

    pub fn tenant_subscriptions(&self, tenant_id: &str) -> Vec<SubscriptionInfo> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|info| info.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<SubscriptionInfo> {
        self.inner.lock().unwrap().subscriptions.values().cloned().collect()
    }

    pub fn total_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }

    pub fn count_by_type(&self, kind: SubscriptionType) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|info| info.kind == kind)
            .count()
    }

    pub fn count_by_tenant(&self, tenant_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tenant_counts
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(dialog_id: &str, tenant_id: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            dialog_id: dialog_id.to_string(),
            tenant_id: tenant_id.to_string(),
            kind: SubscriptionType::Blf,
            lifecycle: SubLifecycle::Active,
            last_activity: Instant::now(),
            worker_index: 0,
        }
    }

    #[test]
    fn test_tenant_counter_tracks_registrations() {
        let registry = SubscriptionRegistry::new();
        registry.register(info("d1", "a.com"));
        registry.register(info("d2", "a.com"));
        registry.register(info("d3", "b.com"));
        assert_eq!(registry.count_by_tenant("a.com"), 2);
        assert_eq!(registry.count_by_tenant("b.com"), 1);

        registry.unregister("d1");
        assert_eq!(registry.count_by_tenant("a.com"), 1);
        registry.unregister("d2");
        assert_eq!(registry.count_by_tenant("a.com"), 0);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_reregistration_does_not_double_count() {
        let registry = SubscriptionRegistry::new();
        registry.register(info("d1", "a.com"));
        let mut updated = info("d1", "a.com");
        updated.lifecycle = SubLifecycle::Terminating;
        registry.register(updated);
        assert_eq!(registry.count_by_tenant("a.com"), 1);
        assert_eq!(
            registry.lookup("d1").unwrap().lifecycle,
            SubLifecycle::Terminating
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        registry.register(info("d1", "a.com"));
        registry.unregister("d1");
        registry.unregister("d1");
        registry.unregister("never-registered");
        assert_eq!(registry.count_by_tenant("a.com"), 0);
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_counter_matches_cardinality_under_mixed_ops() {
        let registry = SubscriptionRegistry::new();
        for i in 0..50 {
            let tenant = if i % 2 == 0 { "even.com" } else { "odd.com" };
            registry.register(info(&format!("d{i}"), tenant));
        }
        for i in (0..50).step_by(3) {
            registry.unregister(&format!("d{i}"));
        }
        for tenant in ["even.com", "odd.com"] {
            let actual = registry
                .all()
                .into_iter()
                .filter(|s| s.tenant_id == tenant)
                .count();
            assert_eq!(registry.count_by_tenant(tenant), actual);
        }
    }
}
