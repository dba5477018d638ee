//! Outcome classification
//!
//! Exactly one Outcome per run. It is a plain tagged union while the keeper
//! works and only turns into status codes, messages and exit codes at the
//! reporting boundary.

use crate::kernel::process::ChildExit;
use crate::verdict::timeout::{TimeLimitPolicy, TimeoutKind};
use nix::sys::signal::Signal;
use std::time::Duration;

/// What the sandboxed program did wrong
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    NonzeroExit(i32),
    Signaled(Signal),
    Stopped(Signal),
    TimedOut(TimeoutKind),
    /// The keeper itself was asked to stop
    Interrupted(Signal),
}

/// Terminal classification of a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Violation(Violation),
    InternalError(String),
}

/// Legacy two-letter status codes of the meta report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    TimedOut,
    Signaled,
    RuntimeError,
    InternalError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::TimedOut => "TO",
            StatusCode::Signaled => "SG",
            StatusCode::RuntimeError => "RE",
            StatusCode::InternalError => "XX",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_VIOLATION: i32 = 1;
pub const EXIT_INTERNAL: i32 = 2;

impl Violation {
    pub fn status(&self) -> StatusCode {
        match self {
            Violation::NonzeroExit(_) => StatusCode::RuntimeError,
            Violation::Signaled(_) | Violation::Stopped(_) | Violation::Interrupted(_) => {
                StatusCode::Signaled
            }
            Violation::TimedOut(_) => StatusCode::TimedOut,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Violation::NonzeroExit(code) => format!("Exited with error status {}", code),
            Violation::Signaled(sig) => format!("Caught fatal signal {}", *sig as i32),
            Violation::Stopped(sig) => format!("Stopped by signal {}", *sig as i32),
            Violation::TimedOut(kind) => kind.message().to_string(),
            Violation::Interrupted(_) => "Interrupted".to_string(),
        }
    }

    /// Signal number reported as `exitsig`, if any
    pub fn exit_signal(&self) -> Option<i32> {
        match self {
            Violation::Signaled(sig) | Violation::Stopped(sig) | Violation::Interrupted(sig) => {
                Some(*sig as i32)
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Violation::NonzeroExit(code) => Some(*code),
            _ => None,
        }
    }
}

impl Outcome {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Outcome::Ok => None,
            Outcome::Violation(v) => Some(v.status()),
            Outcome::InternalError(_) => Some(StatusCode::InternalError),
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Outcome::Ok => None,
            Outcome::Violation(v) => Some(v.message()),
            Outcome::InternalError(msg) => Some(msg.clone()),
        }
    }

    /// Process exit code of the keeper
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Ok => EXIT_OK,
            Outcome::Violation(_) => EXIT_VIOLATION,
            Outcome::InternalError(_) => EXIT_INTERNAL,
        }
    }

    pub fn is_internal_error(&self) -> bool {
        matches!(self, Outcome::InternalError(_))
    }
}

impl From<Violation> for Outcome {
    fn from(violation: Violation) -> Self {
        Outcome::Violation(violation)
    }
}

/// Pure classifier over the wait status and authoritative accounting
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify a state change reported by `wait4`.
    ///
    /// `cpu` and `wall` come from rusage and the keeper's own clock, not from
    /// the approximate poll, so a program that finished just past its limit
    /// between two ticks is still reported as timed out.
    pub fn classify_exit(
        exit: ChildExit,
        cpu: Duration,
        wall: Duration,
        policy: &TimeLimitPolicy,
    ) -> Outcome {
        match exit {
            ChildExit::Exited(0) => match policy.check_final(cpu, wall) {
                Some(kind) => Violation::TimedOut(kind).into(),
                None => Outcome::Ok,
            },
            ChildExit::Exited(code) => Violation::NonzeroExit(code).into(),
            ChildExit::Signaled(sig) => Violation::Signaled(sig).into(),
            ChildExit::Stopped(sig) => Violation::Stopped(sig).into(),
        }
    }
}
