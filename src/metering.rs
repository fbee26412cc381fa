//! Per-tenant AI-token accounting against an optional quota.

use dashmap::DashMap;
use tracing::debug;

/// Increments are additive; there is no internal dedup. Callers must invoke
/// [`UsageMeter::record_usage`] exactly once per completed AI request.
/// A quota of 0 (or no quota at all) means unlimited.
#[derive(Debug, Default)]
pub struct UsageMeter {
    used: DashMap<String, u64>,
    quotas: DashMap<String, u64>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quota(&self, tenant_id: &str, tokens: u64) {
        self.quotas.insert(tenant_id.to_string(), tokens);
    }

    pub fn record_usage(&self, tenant_id: &str, tokens: u64, session_id: Option<&str>) {
        let mut entry = self.used.entry(tenant_id.to_string()).or_insert(0);
        *entry += tokens;
        debug!(
            tenant = %tenant_id,
            session = session_id.unwrap_or("-"),
            tokens,
            total = *entry,
            "recorded AI token usage"
        );
    }

    pub fn used(&self, tenant_id: &str) -> u64 {
        self.used.get(tenant_id).map(|v| *v).unwrap_or(0)
    }

    pub fn has_quota(&self, tenant_id: &str) -> bool {
        match self.quotas.get(tenant_id) {
            Some(quota) if *quota > 0 => self.used(tenant_id) < *quota,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_additive() {
        let meter = UsageMeter::new();
        meter.record_usage("t1", 120, Some("s1"));
        meter.record_usage("t1", 30, None);
        assert_eq!(meter.used("t1"), 150);
        assert_eq!(meter.used("t2"), 0);
    }

    #[test]
    fn absent_or_zero_quota_is_unlimited() {
        let meter = UsageMeter::new();
        meter.record_usage("t1", 1_000_000, None);
        assert!(meter.has_quota("t1"));

        meter.set_quota("t1", 0);
        assert!(meter.has_quota("t1"));
    }

    #[test]
    fn quota_is_enforced_once_reached() {
        let meter = UsageMeter::new();
        meter.set_quota("t1", 100);
        assert!(meter.has_quota("t1"));

        meter.record_usage("t1", 99, None);
        assert!(meter.has_quota("t1"));

        meter.record_usage("t1", 1, None);
        assert!(!meter.has_quota("t1"));
    }
}
