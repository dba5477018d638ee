//! Pre-exec sequence of the forked child
//!
//! The setup sequence is fixed:
//! 1. forget the keeper's meta descriptor, reset handled signals to default
//! 2. new process group, so the keeper can kill the whole tree
//! 3. stdin/stdout/stderr redirections
//! 4. resource limits
//! 5. optional working directory
//! 6. execve with the resolved environment, no PATH search
//!
//! Everything that can be computed ahead of time lives in [`LaunchPlan`],
//! built in the keeper before fork.

use crate::config::types::{KeeperError, Result, SandboxConfig, StderrTarget};
use crate::exec::error_pipe::ChildReporter;
use crate::kernel::rlimit::RlimitPlan;
use crate::kernel::signal;
use crate::utils::env_rules;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, close, dup2, execve, setpgid, Pid};
use std::ffi::{CString, OsString};
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Everything the child needs, resolved before fork
#[derive(Debug)]
pub struct LaunchPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: StderrTarget,
    workdir: Option<PathBuf>,
    rlimits: RlimitPlan,
}

fn to_cstring(value: &OsString, what: &str) -> Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| KeeperError::Config(format!("{} contains NUL byte", what)))
}

impl LaunchPlan {
    pub fn prepare(config: &SandboxConfig, parent_env: &[(OsString, OsString)]) -> Result<Self> {
        let program = config
            .command
            .first()
            .ok_or_else(|| KeeperError::Config("--run mode requires a command to run".to_string()))?;

        let argv = config
            .command
            .iter()
            .map(|arg| to_cstring(arg, "command argument"))
            .collect::<Result<Vec<_>>>()?;

        let env = env_rules::resolve_environment(&config.env_rules, config.inherit_full_env, parent_env);
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Passing environment:");
            for entry in env_rules::describe(&env) {
                log::debug!("\t{}", entry);
            }
        }

        let rlimits = RlimitPlan::from_limits(&config.limits);
        for entry in rlimits.entries() {
            log::debug!("{} = {}", entry.name, entry.value);
        }

        Ok(Self {
            program: to_cstring(program, "program path")?,
            argv,
            envp: env_rules::to_exec_env(&env)?,
            stdin: config.redirections.stdin.clone(),
            stdout: config.redirections.stdout.clone(),
            stderr: config.redirections.stderr.clone(),
            workdir: config.workdir.clone(),
            rlimits,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }

    pub fn rlimits(&self) -> &RlimitPlan {
        &self.rlimits
    }
}

// ============================================================================
// Type-state chain
// ============================================================================
// Fresh -> Detached -> Redirected -> Limited -> ExecReady
//
// Each step consumes the prior state and returns exactly one next state.
// Only ChildSetup<ExecReady> can exec.

/// Type-state marker: nothing done yet
pub struct Fresh;

/// Type-state marker: signals reset, own process group
pub struct Detached;

/// Type-state marker: standard streams in place
pub struct Redirected;

/// Type-state marker: resource limits applied
pub struct Limited;

/// Type-state marker: ready for exec
pub struct ExecReady;

/// Child-side setup with type-state tracking.
///
/// Steps cannot be skipped or reordered; see `tests/typestate_compile_fail`.
pub struct ChildSetup<'a, S> {
    plan: &'a LaunchPlan,
    _state: PhantomData<S>,
}

impl<'a, S> ChildSetup<'a, S> {
    fn advance<T>(self) -> ChildSetup<'a, T> {
        ChildSetup {
            plan: self.plan,
            _state: PhantomData,
        }
    }
}

impl<'a> ChildSetup<'a, Fresh> {
    pub fn new(plan: &'a LaunchPlan) -> Self {
        Self {
            plan,
            _state: PhantomData,
        }
    }

    /// Reset signal dispositions and move into a fresh process group
    pub fn detach(self) -> Result<ChildSetup<'a, Detached>> {
        signal::reset_to_default()?;
        setpgid(Pid::from_raw(0), Pid::from_raw(0))
            .map_err(|e| KeeperError::Process(format!("setpgid: {}", e.desc())))?;
        Ok(self.advance())
    }
}

fn redirect(path: &Path, flags: OFlag, target: RawFd) -> Result<()> {
    let fd = open(path, flags, Mode::from_bits_truncate(0o666))
        .map_err(|e| KeeperError::Process(format!("open(\"{}\"): {}", path.display(), e.desc())))?;
    if fd != target {
        dup2(fd, target)
            .map_err(|e| KeeperError::Process(format!("dup2({}, {}): {}", fd, target, e.desc())))?;
        close(fd).map_err(|e| KeeperError::Process(format!("close({}): {}", fd, e.desc())))?;
    }
    Ok(())
}

impl<'a> ChildSetup<'a, Detached> {
    pub fn redirect_stdio(self) -> Result<ChildSetup<'a, Redirected>> {
        let writable = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;

        if let Some(stdin) = &self.plan.stdin {
            redirect(stdin, OFlag::O_RDONLY, libc::STDIN_FILENO)?;
        }
        if let Some(stdout) = &self.plan.stdout {
            redirect(stdout, writable, libc::STDOUT_FILENO)?;
        }
        match &self.plan.stderr {
            StderrTarget::Inherit => {}
            StderrTarget::File(path) => redirect(path, writable, libc::STDERR_FILENO)?,
            StderrTarget::Stdout => {
                dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO).map_err(|_| {
                    KeeperError::Process("Cannot dup stdout to stderr".to_string())
                })?;
            }
        }
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, Redirected> {
    pub fn apply_limits(self) -> Result<ChildSetup<'a, Limited>> {
        self.plan.rlimits.apply()?;
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, Limited> {
    pub fn enter_workdir(self) -> Result<ChildSetup<'a, ExecReady>> {
        if let Some(dir) = &self.plan.workdir {
            chdir(dir.as_path())
                .map_err(|e| KeeperError::Process(format!("chdir(\"{}\"): {}", dir.display(), e.desc())))?;
        }
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, ExecReady> {
    /// Replace the child image. Returns only on failure.
    pub fn exec(self) -> KeeperError {
        let plan = self.plan;
        match execve(plan.program.as_c_str(), plan.argv.as_slice(), plan.envp.as_slice()) {
            Ok(never) => match never {},
            Err(e) => KeeperError::Process(format!(
                "execve(\"{}\"): {}",
                plan.program.to_string_lossy(),
                e.desc()
            )),
        }
    }
}

// Compile-fail guards for the chain above
#[cfg(doctest)]
mod typestate_compile_fail {
    /// ```compile_fail
    #[doc = include_str!("../../tests/typestate_compile_fail/exec_from_fresh.rs")]
    /// ```
    struct ExecFromFresh;

    /// ```compile_fail
    #[doc = include_str!("../../tests/typestate_compile_fail/exec_before_limits.rs")]
    /// ```
    struct ExecBeforeLimits;

    /// ```compile_fail
    #[doc = include_str!("../../tests/typestate_compile_fail/limits_before_redirect.rs")]
    /// ```
    struct LimitsBeforeRedirect;

    /// ```compile_fail
    #[doc = include_str!("../../tests/typestate_compile_fail/skip_workdir.rs")]
    /// ```
    struct SkipWorkdir;

    /// ```compile_fail
    #[doc = include_str!("../../tests/typestate_compile_fail/reuse_consumed_state.rs")]
    /// ```
    struct ReuseConsumedState;
}

fn setup_and_exec(plan: &LaunchPlan) -> KeeperError {
    let ready = ChildSetup::new(plan)
        .detach()
        .and_then(|setup| setup.redirect_stdio())
        .and_then(|setup| setup.apply_limits())
        .and_then(|setup| setup.enter_workdir());
    match ready {
        Ok(ready) => ready.exec(),
        Err(e) => e,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Child setup panicked: {}", detail)
}

/// Body of the forked child. Never returns: either execve succeeds or the
/// failure is reported over the startup pipe and the child exits with 2.
pub fn run_child(plan: &LaunchPlan, reporter: ChildReporter) -> ! {
    let message = match panic::catch_unwind(AssertUnwindSafe(|| setup_and_exec(plan))) {
        Ok(err) => err.to_string(),
        Err(payload) => panic_message(payload),
    };
    reporter.report_and_exit(&message)
}
