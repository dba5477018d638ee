//! Resource-limit plan: computed in the keeper, applied in the child.

use crate::config::types::{KeeperError, ResourceLimits, Result};
use nix::sys::resource::{setrlimit, Resource};

pub const RLIM_INFINITY: u64 = libc::RLIM_INFINITY as u64;

/// One limit, applied as both soft and hard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitEntry {
    pub resource: Resource,
    pub name: &'static str,
    pub value: u64,
}

/// Ordered list of limits for the child
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RlimitPlan {
    entries: Vec<RlimitEntry>,
}

impl RlimitPlan {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        let mut plan = Self::default();

        if let Some(kb) = limits.memory_kb {
            plan.push(Resource::RLIMIT_AS, "RLIMIT_AS", kb.saturating_mul(1024));
        }
        if let Some(kb) = limits.file_size_kb {
            plan.push(Resource::RLIMIT_FSIZE, "RLIMIT_FSIZE", kb.saturating_mul(1024));
        }
        let stack = limits
            .stack_kb
            .map(|kb| kb.saturating_mul(1024))
            .unwrap_or(RLIM_INFINITY);
        plan.push(Resource::RLIMIT_STACK, "RLIMIT_STACK", stack);
        plan.push(Resource::RLIMIT_NOFILE, "RLIMIT_NOFILE", limits.fd_limit);
        plan.push(Resource::RLIMIT_MEMLOCK, "RLIMIT_MEMLOCK", 0);
        if let Some(nproc) = limits.process_limit {
            plan.push(Resource::RLIMIT_NPROC, "RLIMIT_NPROC", u64::from(nproc));
        }

        plan
    }

    fn push(&mut self, resource: Resource, name: &'static str, value: u64) {
        self.entries.push(RlimitEntry {
            resource,
            name,
            value,
        });
    }

    pub fn entries(&self) -> &[RlimitEntry] {
        &self.entries
    }

    pub fn get(&self, resource: Resource) -> Option<u64> {
        self.entries
            .iter()
            .find(|entry| entry.resource == resource)
            .map(|entry| entry.value)
    }

    /// Apply every entry to the calling process. Stops at the first failure.
    pub fn apply(&self) -> Result<()> {
        for entry in &self.entries {
            let value = entry.value as libc::rlim_t;
            setrlimit(entry.resource, value, value).map_err(|_| {
                KeeperError::ResourceLimit(format!("setrlimit({}, {})", entry.name, entry.value))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan() {
        let plan = RlimitPlan::from_limits(&ResourceLimits::default());
        let names: Vec<_> = plan.entries().iter().map(|e| e.name).collect();
        assert_eq!(
            names,
            vec!["RLIMIT_STACK", "RLIMIT_NOFILE", "RLIMIT_MEMLOCK", "RLIMIT_NPROC"]
        );
        assert_eq!(plan.get(Resource::RLIMIT_STACK), Some(RLIM_INFINITY));
        assert_eq!(plan.get(Resource::RLIMIT_NOFILE), Some(64));
        assert_eq!(plan.get(Resource::RLIMIT_MEMLOCK), Some(0));
        assert_eq!(plan.get(Resource::RLIMIT_NPROC), Some(1));
        assert_eq!(plan.get(Resource::RLIMIT_AS), None);
    }

    #[test]
    fn test_kilobyte_limits_are_scaled() {
        let limits = ResourceLimits {
            memory_kb: Some(65536),
            file_size_kb: Some(10),
            stack_kb: Some(8192),
            ..Default::default()
        };
        let plan = RlimitPlan::from_limits(&limits);
        assert_eq!(plan.get(Resource::RLIMIT_AS), Some(64 * 1024 * 1024));
        assert_eq!(plan.get(Resource::RLIMIT_FSIZE), Some(10 * 1024));
        assert_eq!(plan.get(Resource::RLIMIT_STACK), Some(8 * 1024 * 1024));
    }

    #[test]
    fn test_unlimited_processes_skips_nproc() {
        let limits = ResourceLimits {
            process_limit: None,
            ..Default::default()
        };
        let plan = RlimitPlan::from_limits(&limits);
        assert_eq!(plan.get(Resource::RLIMIT_NPROC), None);
    }

    #[test]
    fn test_huge_values_saturate() {
        let limits = ResourceLimits {
            memory_kb: Some(u64::MAX / 2),
            ..Default::default()
        };
        let plan = RlimitPlan::from_limits(&limits);
        assert_eq!(plan.get(Resource::RLIMIT_AS), Some(u64::MAX));
    }
}
