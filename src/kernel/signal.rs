//! Async-safe signal front-end of the keeper
//!
//! Handlers never allocate, lock or log. The interrupt and tick handlers only
//! store into atomics (and re-arm `alarm`), and the keeper loop acts on them
//! after `wait4` returns with EINTR. The fatal handler cannot return to a sane keeper, so it tears
//! the child down itself using raw syscalls and exits.

use crate::config::types::{KeeperError, Result, TICK_INTERVAL_SECS};
use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{alarm, Pid};
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Last interrupting signal number, 0 when none arrived
static INTERRUPT: AtomicI32 = AtomicI32::new(0);

/// Set by SIGALRM, consumed by the keeper loop
static TIMER_TICK: AtomicBool = AtomicBool::new(false);

/// Pid of the supervised child between fork and reap, 0 otherwise
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Meta report descriptor while the report is still unflushed, -1 otherwise
static META_FD: AtomicI32 = AtomicI32::new(-1);

/// How the keeper reacts to a signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalAction {
    Ignore,
    Interrupt,
    Fatal,
}

#[derive(Clone, Copy, Debug)]
pub struct SignalRule {
    pub signal: Signal,
    pub action: SignalAction,
}

const fn rule(signal: Signal, action: SignalAction) -> SignalRule {
    SignalRule { signal, action }
}

/// Every signal the keeper takes over. The child resets all of them.
pub const SIGNAL_RULES: &[SignalRule] = &[
    rule(Signal::SIGHUP, SignalAction::Interrupt),
    rule(Signal::SIGINT, SignalAction::Interrupt),
    rule(Signal::SIGQUIT, SignalAction::Interrupt),
    rule(Signal::SIGILL, SignalAction::Fatal),
    rule(Signal::SIGABRT, SignalAction::Fatal),
    rule(Signal::SIGBUS, SignalAction::Fatal),
    rule(Signal::SIGFPE, SignalAction::Fatal),
    rule(Signal::SIGUSR1, SignalAction::Ignore),
    rule(Signal::SIGSEGV, SignalAction::Fatal),
    rule(Signal::SIGUSR2, SignalAction::Ignore),
    rule(Signal::SIGPIPE, SignalAction::Ignore),
    rule(Signal::SIGTERM, SignalAction::Interrupt),
];

/// Handle to the installed keeper handlers
pub struct SignalFrontEnd {
    _installed: (),
}

fn install_handler(sig: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handlers only touch atomics and async-signal-safe libc calls.
    unsafe { signal::sigaction(sig, &action) }
        .map(drop)
        .map_err(|e| KeeperError::Signal(format!("sigaction({}): {}", sig, e)))
}

impl SignalFrontEnd {
    /// Install the keeper's handlers. Must run before fork.
    ///
    /// `SA_RESTART` is deliberately left out so a blocked `wait4` returns
    /// EINTR as soon as any handled signal arrives. The SIGALRM handler is
    /// installed here too, but no alarm is armed until [`start_ticker`].
    ///
    /// [`start_ticker`]: SignalFrontEnd::start_ticker
    pub fn install() -> Result<Self> {
        INTERRUPT.store(0, Ordering::SeqCst);
        TIMER_TICK.store(false, Ordering::SeqCst);

        for rule in SIGNAL_RULES {
            let handler = match rule.action {
                SignalAction::Ignore => SigHandler::SigIgn,
                SignalAction::Interrupt => SigHandler::Handler(interrupt_handler),
                SignalAction::Fatal => SigHandler::Handler(fatal_handler),
            };
            install_handler(rule.signal, handler)?;
        }
        install_handler(Signal::SIGALRM, SigHandler::Handler(tick_handler))?;

        debug!("Signal handlers installed ({} signals)", SIGNAL_RULES.len() + 1);
        Ok(Self { _installed: () })
    }

    /// The interrupting signal, if one arrived since install
    pub fn pending_interrupt(&self) -> Option<Signal> {
        match INTERRUPT.load(Ordering::SeqCst) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }

    /// Consume a pending tick
    pub fn take_tick(&self) -> bool {
        TIMER_TICK.swap(false, Ordering::SeqCst)
    }

    /// Arm the first tick. The handler re-arms itself, so ticks keep coming
    /// until cancelled.
    pub fn start_ticker(&mut self) {
        alarm::set(TICK_INTERVAL_SECS);
    }

    /// Stop all ticks, including the wake-up armed by an interrupt
    pub fn cancel_ticker(&mut self) {
        alarm::cancel();
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: switching to SIG_IGN installs no code.
        let _ = unsafe { signal::sigaction(Signal::SIGALRM, &action) };
        TIMER_TICK.store(false, Ordering::SeqCst);
    }
}

impl Drop for SignalFrontEnd {
    fn drop(&mut self) {
        self.cancel_ticker();
    }
}

/// Make the child pid visible to the fatal-signal path
pub fn publish_child(pid: Pid) {
    CHILD_PID.store(pid.as_raw(), Ordering::SeqCst);
}

/// Called once the child has been reaped
pub fn retract_child() {
    CHILD_PID.store(0, Ordering::SeqCst);
}

/// Make the still-unflushed meta descriptor visible to the fatal-signal path
pub fn publish_meta_fd(fd: RawFd) {
    META_FD.store(fd, Ordering::SeqCst);
}

/// Take the meta descriptor away from the fatal path.
/// Returns it if it was still published, which happens exactly once.
pub fn retract_meta_fd() -> Option<RawFd> {
    match META_FD.swap(-1, Ordering::SeqCst) {
        fd if fd >= 0 => Some(fd),
        _ => None,
    }
}

/// Restore default dispositions in the forked child, before exec.
/// The child also forgets the keeper's meta descriptor so a crash during
/// setup can never write into the keeper's report.
pub fn reset_to_default() -> Result<()> {
    META_FD.store(-1, Ordering::SeqCst);
    CHILD_PID.store(0, Ordering::SeqCst);

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in SIGNAL_RULES
        .iter()
        .map(|rule| rule.signal)
        .chain(std::iter::once(Signal::SIGALRM))
    {
        // SAFETY: SIG_DFL installs no code.
        unsafe { signal::sigaction(sig, &default) }
            .map_err(|e| KeeperError::Signal(format!("sigaction({}): {}", sig, e)))?;
    }
    Ok(())
}

/// Besides the flag, arm one tick: if the signal landed between the loop's
/// flag check and `wait4`, the tick still wakes the wait.
extern "C" fn interrupt_handler(signo: libc::c_int) {
    INTERRUPT.store(signo, Ordering::SeqCst);
    // SAFETY: alarm(2) is async-signal-safe.
    unsafe {
        libc::alarm(TICK_INTERVAL_SECS);
    }
}

extern "C" fn tick_handler(_signo: libc::c_int) {
    TIMER_TICK.store(true, Ordering::SeqCst);
    // SAFETY: alarm(2) is async-signal-safe.
    unsafe {
        libc::alarm(TICK_INTERVAL_SECS);
    }
}

/// Fixed-size, allocation-free text buffer for use inside signal handlers
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> std::fmt::Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        // overflow is truncated
        let room = N - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn raw_write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: bytes is a valid slice for the duration of the call.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Fatal fault inside the keeper itself.
/// Only async-signal-safe calls from here on: kill, waitpid, write, _exit.
extern "C" fn fatal_handler(signo: libc::c_int) {
    let pid = CHILD_PID.swap(0, Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: plain syscalls on integers.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
            libc::kill(pid, libc::SIGKILL);
            let mut status = 0;
            libc::waitpid(pid, &mut status, 0);
        }
    }

    let mut message: StackBuf<64> = StackBuf::new();
    let _ = write!(message, "Keeper received fatal signal {}", signo);

    if let Some(fd) = retract_meta_fd() {
        raw_write_all(fd, b"status:XX\nmessage:");
        raw_write_all(fd, message.as_bytes());
        raw_write_all(fd, b"\n");
        if pid > 0 {
            raw_write_all(fd, b"killed:1\n");
        }
    }

    raw_write_all(libc::STDERR_FILENO, message.as_bytes());
    raw_write_all(libc::STDERR_FILENO, b"\n");

    // SAFETY: _exit skips atexit handlers and unwinding.
    unsafe { libc::_exit(2) }
}

#[cfg(test)]
pub(crate) fn clear_interrupt() {
    INTERRUPT.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn action_of(sig: Signal) -> Option<SignalAction> {
        SIGNAL_RULES
            .iter()
            .find(|rule| rule.signal == sig)
            .map(|rule| rule.action)
    }

    #[test]
    fn test_signal_rule_groups() {
        for sig in [Signal::SIGPIPE, Signal::SIGUSR1, Signal::SIGUSR2] {
            assert_eq!(action_of(sig), Some(SignalAction::Ignore));
        }
        for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
            assert_eq!(action_of(sig), Some(SignalAction::Interrupt));
        }
        for sig in [
            Signal::SIGILL,
            Signal::SIGABRT,
            Signal::SIGFPE,
            Signal::SIGSEGV,
            Signal::SIGBUS,
        ] {
            assert_eq!(action_of(sig), Some(SignalAction::Fatal));
        }
        // SIGALRM belongs to the ticker, not to the rule table
        assert_eq!(action_of(Signal::SIGALRM), None);
    }

    #[test]
    fn test_stack_buf_formats_and_truncates() {
        let mut buf: StackBuf<16> = StackBuf::new();
        write!(buf, "signal {}", 11).unwrap();
        assert_eq!(buf.as_bytes(), b"signal 11");

        let mut tiny: StackBuf<4> = StackBuf::new();
        write!(tiny, "abcdefgh").unwrap();
        assert_eq!(tiny.as_bytes(), b"abcd");
    }

    #[test]
    fn test_interrupt_flag_and_ignored_signals() {
        let mut front = SignalFrontEnd::install().unwrap();
        assert!(front.pending_interrupt().is_none());

        // ignored: must not terminate the test process or set the flag
        signal::raise(Signal::SIGUSR1).unwrap();
        assert!(front.pending_interrupt().is_none());

        signal::raise(Signal::SIGHUP).unwrap();
        assert_eq!(front.pending_interrupt(), Some(Signal::SIGHUP));
        assert!(!front.take_tick());
        // the interrupt armed a wake-up tick although no time limit asked for one
        assert!(alarm::cancel().is_some());

        front.start_ticker();
        front.cancel_ticker();
        assert!(alarm::cancel().is_none());
        clear_interrupt();
    }
}
