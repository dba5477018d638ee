use crate::kernel::signal;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Resource accounting of a reaped child
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// User + system CPU time
    pub cpu_time: Duration,
    /// Wall time from fork to reap, measured by the keeper
    pub wall_time: Duration,
    pub max_rss_kb: u64,
    pub voluntary_switches: u64,
    pub forced_switches: u64,
}

/// The supervised child, from fork until it is reaped.
///
/// While a handle exists its pid is mirrored into async-signal-safe storage,
/// so the fatal-signal path can still kill and reap the child.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    pub fn adopt(pid: Pid) -> Self {
        signal::publish_child(pid);
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The child leads its own process group
    pub fn pgid(&self) -> Pid {
        self.pid
    }

    /// Give up the handle once the child has been reaped
    pub fn release(self) {}
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        signal::retract_child();
    }
}

/// Running timing state of the keeper
#[derive(Clone, Debug)]
pub struct TimingWindow {
    started: Instant,
    last_cpu: Option<Duration>,
    ticks: u64,
}

impl TimingWindow {
    /// Start measuring; call right before fork
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            last_cpu: None,
            ticks: 0,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn wall_elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_tick(&mut self, cpu: Option<Duration>) {
        self.ticks += 1;
        if cpu.is_some() {
            self.last_cpu = cpu;
        }
    }

    /// Most recent approximate CPU time seen while polling
    pub fn last_cpu(&self) -> Option<Duration> {
        self.last_cpu
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
