use crate::config::types::{KeeperError, Result, SandboxConfig};
use crate::core::types::{ChildHandle, ResourceUsage, TimingWindow};
use crate::exec::error_pipe::{StartupListener, StartupPipe};
use crate::exec::preexec::{run_child, LaunchPlan};
use crate::kernel::cpu_time::{detect_cpu_time_source, CpuTimeSource};
use crate::kernel::process::{self, ChildExit, WaitEvent};
use crate::kernel::signal::SignalFrontEnd;
use crate::observability::meta::{format_seconds, MetaReport};
use crate::utils::env_rules::parent_environment;
use crate::verdict::timeout::{TimeLimitPolicy, TimeoutKind};
use crate::verdict::verdict::{Outcome, VerdictClassifier, Violation, EXIT_INTERNAL};
use log::{debug, error, info};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{fork, ForkResult};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Keeper state for one run.
///
/// `supervise` may bail out at any point with an error or a panic; whatever
/// it leaves behind in here is cleaned up by `teardown` before the outcome
/// is reported.
pub struct Keeper<'a> {
    config: &'a SandboxConfig,
    policy: TimeLimitPolicy,
    signals: Option<SignalFrontEnd>,
    child: Option<ChildHandle>,
    timing: Option<TimingWindow>,
    usage: Option<ResourceUsage>,
    killed: bool,
}

impl<'a> Keeper<'a> {
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self {
            config,
            policy: TimeLimitPolicy::from_limits(&config.limits),
            signals: None,
            child: None,
            timing: None,
            usage: None,
            killed: false,
        }
    }

    /// Run the program to completion and report. Returns the keeper's exit code.
    pub fn run(mut self, meta: &mut MetaReport) -> i32 {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.supervise())) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Outcome::InternalError(e.to_string()),
            Err(payload) => Outcome::InternalError(format!("Keeper panicked: {}", panic_detail(payload))),
        };

        self.teardown();
        self.finalize(&outcome, meta)
    }

    fn supervise(&mut self) -> Result<Outcome> {
        let plan = LaunchPlan::prepare(self.config, &parent_environment())?;
        self.signals = Some(SignalFrontEnd::install()?);
        let pipe = StartupPipe::create()?;

        let timing = TimingWindow::start();
        let mut cpu_source = match self.policy.cpu_limit {
            Some(_) => Some(detect_cpu_time_source(timing.started())?),
            None => None,
        };
        self.timing = Some(timing);

        // SAFETY: the keeper is single-threaded; the child only runs the
        // pre-exec chain and then execs or exits.
        let pid = match unsafe { fork() }
            .map_err(|e| KeeperError::Process(format!("fork: {}", e.desc())))?
        {
            ForkResult::Child => run_child(&plan, pipe.into_reporter()),
            ForkResult::Parent { child } => child,
        };
        self.child = Some(ChildHandle::adopt(pid));
        // the child does the same; whichever runs first closes the killpg race
        if let Err(e) = process::lead_own_group(pid) {
            debug!("{}", e);
        }
        let mut listener = pipe.into_listener();
        info!("Started process {}", pid);

        if self.policy.is_active() {
            if let Some(signals) = self.signals.as_mut() {
                signals.start_ticker();
            }
        }

        loop {
            if let Some(sig) = self.signals.as_ref().and_then(|s| s.pending_interrupt()) {
                info!("Interrupted by signal {}", sig);
                return Ok(Violation::Interrupted(sig).into());
            }

            match process::wait_child(pid)? {
                WaitEvent::Changed(reaped) => {
                    return self.on_wait(reaped.exit, reaped.usage, &mut listener);
                }
                WaitEvent::Interrupted => {
                    let ticked = self.signals.as_ref().map(|s| s.take_tick()).unwrap_or(false);
                    if ticked {
                        if let Some(kind) = self.check_running(cpu_source.as_mut())? {
                            return Ok(Violation::TimedOut(kind).into());
                        }
                    }
                }
            }
        }
    }

    /// Periodic timeout poll on a live child
    fn check_running(&mut self, cpu_source: Option<&mut Box<dyn CpuTimeSource>>) -> Result<Option<TimeoutKind>> {
        let pid = match &self.child {
            Some(child) => child.pid(),
            None => return Ok(None),
        };
        let timing = match self.timing.as_mut() {
            Some(timing) => timing,
            None => return Ok(None),
        };

        let wall = timing.wall_elapsed();
        debug!("[wall time check: {} msec]", wall.as_millis());

        let cpu = match cpu_source {
            Some(source) => {
                let cpu = source.cpu_time(pid)?;
                debug!("[time check: {} msec]", cpu.as_millis());
                Some(cpu)
            }
            None => None,
        };
        timing.record_tick(cpu);

        let exceeded = self.policy.check_running(cpu, wall);
        if exceeded.is_some() {
            info!(
                "Limit hit on poll {} (cpu {} msec, wall {} msec)",
                timing.ticks(),
                timing.last_cpu().unwrap_or_default().as_millis(),
                wall.as_millis()
            );
        }
        Ok(exceeded)
    }

    fn wall_elapsed(&self) -> Duration {
        self.timing
            .as_ref()
            .map(TimingWindow::wall_elapsed)
            .unwrap_or_default()
    }

    fn on_wait(
        &mut self,
        exit: ChildExit,
        usage: ResourceUsage,
        listener: &mut StartupListener,
    ) -> Result<Outcome> {
        let wall = self.wall_elapsed();

        if let ChildExit::Stopped(sig) = exit {
            // still alive; teardown kills and reaps it
            return Ok(Violation::Stopped(sig).into());
        }

        if let Some(child) = self.child.take() {
            let pgid = child.pgid();
            child.release();
            process::sweep_group(pgid);
        }
        self.usage = Some(ResourceUsage {
            wall_time: wall,
            ..usage
        });

        if let Some(report) = listener.take_report()? {
            return Ok(Outcome::InternalError(report));
        }

        Ok(VerdictClassifier::classify_exit(exit, usage.cpu_time, wall, &self.policy))
    }

    /// Kill and reap a child that is still around, then stop the ticker
    fn teardown(&mut self) {
        if let Some(child) = self.child.take() {
            let pid = child.pid();
            process::kill_process_tree(pid);
            self.killed = true;
            match process::reap_blocking(pid) {
                Ok(reaped) => {
                    let wall = self.wall_elapsed();
                    self.usage = Some(ResourceUsage {
                        wall_time: wall,
                        ..reaped.usage
                    });
                }
                Err(e) => {
                    error!("Reaping {} failed: {}", pid, e);
                    eprintln!("UGH: Lost track of the process");
                }
            }
            let pgid = child.pgid();
            child.release();
            process::sweep_group(pgid);
        }

        if let Some(signals) = self.signals.as_mut() {
            signals.cancel_ticker();
        }
    }

    fn finalize(&self, outcome: &Outcome, meta: &mut MetaReport) -> i32 {
        meta.record_outcome(outcome, self.killed);
        if let Some(usage) = &self.usage {
            meta.record_usage(usage);
        }

        if let Err(e) = meta.flush() {
            eprintln!("{}", e);
            return EXIT_INTERNAL;
        }

        // internal errors are printed even in silent mode
        if self.config.silent && !outcome.is_internal_error() {
            return outcome.exit_code();
        }
        match outcome {
            Outcome::Ok => {
                let usage = self.usage.unwrap_or_default();
                eprintln!(
                    "OK ({} sec real, {} sec wall)",
                    format_seconds(usage.cpu_time),
                    format_seconds(usage.wall_time)
                );
            }
            Outcome::Violation(violation) => eprintln!("{}", violation.message()),
            Outcome::InternalError(message) => eprintln!("{}", message),
        }

        outcome.exit_code()
    }
}

/// Supervisor entry point: run `config.command` under the configured limits,
/// write the meta report and return the process exit code (0, 1 or 2).
pub fn run_sandbox(config: &SandboxConfig) -> i32 {
    umask(Mode::from_bits_truncate(0o022));

    let mut meta = match MetaReport::open(&config.meta) {
        Ok(meta) => meta,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_INTERNAL;
        }
    };

    Keeper::new(config).run(&mut meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ResourceLimits;

    #[test]
    fn test_panic_detail() {
        assert_eq!(panic_detail(Box::new("oops")), "oops");
        assert_eq!(panic_detail(Box::new(String::from("bad"))), "bad");
        assert_eq!(panic_detail(Box::new(17u8)), "unknown panic");
    }

    #[test]
    fn test_keeper_policy_follows_limits() {
        let config = SandboxConfig {
            limits: ResourceLimits {
                cpu_time: Some(Duration::from_secs(1)),
                extra_time: Duration::from_secs(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let keeper = Keeper::new(&config);
        assert!(keeper.policy.is_active());
        assert_eq!(keeper.policy.extra_time, Duration::from_secs(2));
        assert!(keeper.child.is_none());
    }

    #[test]
    fn test_missing_command_is_internal_error() {
        let config = SandboxConfig {
            silent: true,
            ..Default::default()
        };
        let mut meta = MetaReport::disabled();
        let code = Keeper::new(&config).run(&mut meta);
        assert_eq!(code, EXIT_INTERNAL);
        assert!(meta.render().starts_with("status:XX\n"));
        assert!(!meta.render().contains("killed"));
    }

    #[test]
    fn test_finalize_ok_without_usage() {
        let config = SandboxConfig {
            silent: true,
            ..Default::default()
        };
        let keeper = Keeper::new(&config);
        let mut meta = MetaReport::disabled();
        assert_eq!(keeper.finalize(&Outcome::Ok, &mut meta), 0);
        assert!(meta.render().is_empty());
    }
}
