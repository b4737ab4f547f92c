//! Delete guards
//!
//! A logical cache delete sets a short-lived guard before removal. Any
//! atomic apply arriving while the guard is active is rejected, which
//! stops an in-flight (now-stale) deduction from resurrecting a deleted
//! entry.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::models::{CustomerId, OrgId};

#[derive(Default)]
pub struct GuardTable {
    guards: Mutex<FxHashMap<CustomerId, Instant>>,
}

impl GuardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, customer_id: &str, ttl: Duration) {
        let mut guards = self.guards.lock().unwrap();
        guards.insert(customer_id.to_string(), Instant::now() + ttl);
    }

    pub fn active(&self, customer_id: &str) -> bool {
        let mut guards = self.guards.lock().unwrap();
        match guards.get(customer_id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                guards.remove(customer_id);
                false
            }
            None => false,
        }
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.guards.lock().unwrap().retain(|_, expiry| *expiry > now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.guards.lock().unwrap().len()
    }
}

/// Group customers by org so each batch delete touches one partition:
/// all keys of one group hash to the same shard and the delete stays
/// atomic per partition.
pub fn group_by_org(pairs: &[(OrgId, CustomerId)]) -> FxHashMap<OrgId, Vec<CustomerId>> {
    let mut groups: FxHashMap<OrgId, Vec<CustomerId>> = FxHashMap::default();
    for (org_id, customer_id) in pairs {
        groups.entry(org_id.clone()).or_default().push(customer_id.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_active_until_ttl() {
        let guards = GuardTable::new();
        guards.set("cus_1", Duration::from_secs(60));

        assert!(guards.active("cus_1"));
        assert!(!guards.active("cus_2"));
    }

    #[test]
    fn test_guard_expires() {
        let guards = GuardTable::new();
        guards.set("cus_1", Duration::from_millis(0));

        std::thread::sleep(Duration::from_millis(5));
        assert!(!guards.active("cus_1"));
        // Expired entry was removed on the active() check.
        assert_eq!(guards.len(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let guards = GuardTable::new();
        guards.set("cus_1", Duration::from_millis(0));
        guards.set("cus_2", Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(5));
        guards.purge_expired();
        assert_eq!(guards.len(), 1);
        assert!(guards.active("cus_2"));
    }

    #[test]
    fn test_group_by_org() {
        let pairs = vec![
            ("org_a".to_string(), "cus_1".to_string()),
            ("org_b".to_string(), "cus_2".to_string()),
            ("org_a".to_string(), "cus_3".to_string()),
        ];
        let groups = group_by_org(&pairs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["org_a"].len(), 2);
        assert_eq!(groups["org_b"], vec!["cus_2".to_string()]);
    }
}
