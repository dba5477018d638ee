//! Time limit checks, both while the child runs and after it has exited.

use crate::config::types::ResourceLimits;
use std::time::Duration;

/// Which clock ran out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Cpu,
    Wall,
}

impl TimeoutKind {
    pub fn message(&self) -> &'static str {
        match self {
            TimeoutKind::Cpu => "Time limit exceeded",
            TimeoutKind::Wall => "Time limit exceeded (wall clock)",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeLimitPolicy {
    pub cpu_limit: Option<Duration>,
    pub wall_limit: Option<Duration>,
    pub extra_time: Duration,
}

impl TimeLimitPolicy {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            cpu_limit: limits.cpu_time,
            wall_limit: limits.wall_time,
            extra_time: limits.extra_time,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cpu_limit.is_some() || self.wall_limit.is_some()
    }

    /// Wall check during a tick. No grace applies to the wall clock.
    pub fn wall_exceeded(&self, wall: Duration) -> bool {
        matches!(self.wall_limit, Some(limit) if wall > limit)
    }

    /// CPU check during a tick.
    /// The program keeps running until it has also used up the grace time,
    /// so its true overshoot can still be measured.
    pub fn cpu_exceeded(&self, cpu: Duration) -> bool {
        matches!(self.cpu_limit, Some(limit) if cpu > limit && cpu > self.extra_time)
    }

    /// Decide on a still-running child; the wall clock is checked first
    pub fn check_running(&self, cpu: Option<Duration>, wall: Duration) -> Option<TimeoutKind> {
        if self.wall_exceeded(wall) {
            return Some(TimeoutKind::Wall);
        }
        match cpu {
            Some(cpu) if self.cpu_exceeded(cpu) => Some(TimeoutKind::Cpu),
            _ => None,
        }
    }

    /// Decide on a child that exited cleanly, using authoritative accounting
    pub fn check_final(&self, cpu: Duration, wall: Duration) -> Option<TimeoutKind> {
        if matches!(self.cpu_limit, Some(limit) if cpu > limit) {
            return Some(TimeoutKind::Cpu);
        }
        if self.wall_exceeded(wall) {
            return Some(TimeoutKind::Wall);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn policy(cpu: Option<u64>, wall: Option<u64>, extra: u64) -> TimeLimitPolicy {
        TimeLimitPolicy {
            cpu_limit: cpu.map(ms),
            wall_limit: wall.map(ms),
            extra_time: ms(extra),
        }
    }

    #[test]
    fn test_no_limits_never_time_out() {
        let p = policy(None, None, 0);
        assert!(!p.is_active());
        assert_eq!(p.check_running(Some(ms(1_000_000)), ms(1_000_000)), None);
        assert_eq!(p.check_final(ms(1_000_000), ms(1_000_000)), None);
    }

    #[test]
    fn test_running_cpu_overrun() {
        let p = policy(Some(1000), None, 0);
        assert_eq!(p.check_running(Some(ms(1000)), ms(5000)), None);
        assert_eq!(p.check_running(Some(ms(1010)), ms(5000)), Some(TimeoutKind::Cpu));
    }

    #[test]
    fn test_grace_time_postpones_cpu_kill() {
        let p = policy(Some(1000), None, 3000);
        assert_eq!(p.check_running(Some(ms(2000)), ms(2000)), None);
        assert_eq!(p.check_running(Some(ms(3001)), ms(3001)), Some(TimeoutKind::Cpu));
        // grace does not forgive the overrun at exit
        assert_eq!(p.check_final(ms(2000), ms(2000)), Some(TimeoutKind::Cpu));
    }

    #[test]
    fn test_grace_time_does_not_apply_to_wall() {
        let p = policy(Some(1000), Some(1500), 5000);
        assert_eq!(p.check_running(Some(ms(10)), ms(1600)), Some(TimeoutKind::Wall));
    }

    #[test]
    fn test_missing_cpu_sample_only_checks_wall() {
        let p = policy(Some(1000), Some(3000), 0);
        assert_eq!(p.check_running(None, ms(2000)), None);
        assert_eq!(p.check_running(None, ms(3001)), Some(TimeoutKind::Wall));
    }

    #[test]
    fn test_final_check_order() {
        let p = policy(Some(1000), Some(1000), 0);
        assert_eq!(p.check_final(ms(1001), ms(1001)), Some(TimeoutKind::Cpu));
        assert_eq!(p.check_final(ms(999), ms(1001)), Some(TimeoutKind::Wall));
        assert_eq!(p.check_final(ms(1000), ms(1000)), None);
    }
}
