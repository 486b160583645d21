//! Deferred signal dispatch.
//!
//! Real signal delivery only appends `(signal, context)` to a bounded queue.
//! Everything else happens synchronously at explicit drain points: a guarded
//! call entry, a supervisor poll cycle, a liveness retry, or `resume()`.
//! User-level handlers therefore never run in interrupt context.
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

/// Capacity of the interrupt-side queue. Deliveries beyond it are counted
/// and reported at the next drain instead of being stored.
const QUEUE_CAPACITY: usize = 64;

/// Offset added to a signal number to form the process exit code.
pub const EXIT_SIGNAL_SHIFT: i32 = 128;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static PENDING: PendingQueue = PendingQueue::new();

/// What the OS told us about a delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalContext {
    /// Sending process, 0 when unknown.
    pub sender_pid: i32,
    /// `si_code` of the delivery (e.g. `SI_USER`, `SI_KERNEL`).
    pub code: i32,
}

impl SignalContext {
    /// # Safety
    /// `info` must be null or point to the `siginfo_t` the kernel passed to
    /// an `SA_SIGINFO` handler.
    unsafe fn from_siginfo(info: *const libc::siginfo_t) -> Self {
        if info.is_null() {
            return Self::default();
        }
        let info = &*info;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let sender_pid = info.si_pid();
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let sender_pid = 0;
        Self {
            sender_pid,
            code: info.si_code,
        }
    }
}

/// A monitored signal asked the program to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub signal: Signal,
}

impl Termination {
    pub fn new(signal: Signal) -> Self {
        Self { signal }
    }

    /// Conventional shell exit code for death-by-signal.
    pub fn exit_code(&self) -> i32 {
        EXIT_SIGNAL_SHIFT + self.signal as i32
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' signal received", self.signal.as_str())
    }
}

impl std::error::Error for Termination {}

/// Application-level handler, run synchronously at a drain point.
pub type Handler = Box<dyn FnMut(Signal, &SignalContext) -> Result<(), Termination>>;

/// How a dequeued signal is dispatched.
pub enum Disposition {
    /// Replay the signal with the OS default action (e.g. terminate).
    Default,
    /// Drop the signal.
    Ignore,
    /// Call back into the application.
    Handler(Handler),
    /// A handler function that was installed before us (e.g. by a launcher
    /// or a library) and has been preserved.
    Foreign(SigHandler),
}

impl Disposition {
    fn from_os(handler: SigHandler) -> Self {
        match handler {
            SigHandler::SigDfl => Disposition::Default,
            SigHandler::SigIgn => Disposition::Ignore,
            other => Disposition::Foreign(other),
        }
    }
}

impl std::fmt::Debug for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Default => f.write_str("Default"),
            Disposition::Ignore => f.write_str("Ignore"),
            Disposition::Handler(_) => f.write_str("Handler(..)"),
            Disposition::Foreign(h) => write!(f, "Foreign({h:?})"),
        }
    }
}

/// Decides whether a signal's disposition at install time wins over the
/// handler the application asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservePolicy {
    /// Keep anything that is not the runtime's own default. Launchers such
    /// as `nohup` or `env --ignore-signal` set these on purpose.
    Auto,
    Always,
    Never,
}

impl PreservePolicy {
    pub fn preserves(&self, signal: Signal, current: SigHandler) -> bool {
        match self {
            PreservePolicy::Always => true,
            PreservePolicy::Never => false,
            // The Rust runtime starts with SIGPIPE ignored.
            PreservePolicy::Auto if signal == Signal::SIGPIPE => current != SigHandler::SigIgn,
            PreservePolicy::Auto => current != SigHandler::SigDfl,
        }
    }
}

/// Errors raised while setting up the registry.
#[derive(Debug)]
pub enum SignalError {
    /// `install` was called a second time in this process.
    AlreadyInstalled,
    /// A signal syscall failed.
    Os {
        op: &'static str,
        signal: Option<Signal>,
        source: nix::Error,
    },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::AlreadyInstalled => {
                write!(f, "signal handlers can only be installed once")
            }
            SignalError::Os {
                op,
                signal: Some(sig),
                source,
            } => write!(f, "{op} failed for {}: {source}", sig.as_str()),
            SignalError::Os {
                op,
                signal: None,
                source,
            } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::AlreadyInstalled => None,
            SignalError::Os { source, .. } => Some(source),
        }
    }
}

struct Slot {
    signo: AtomicI32,
    sender_pid: AtomicI32,
    code: AtomicI32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            signo: AtomicI32::new(0),
            sender_pid: AtomicI32::new(0),
            code: AtomicI32::new(0),
        }
    }
}

/// Fixed-size FIFO written by the deferring handler and read by `drain()`.
///
/// One producer (interrupt context) and one consumer (normal context); the
/// consumer only touches it with the monitored set masked, so a push never
/// interleaves with a pop on the same thread. No allocation, no locks.
pub(crate) struct PendingQueue {
    slots: [Slot; QUEUE_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicUsize,
}

impl PendingQueue {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { Slot::new() }; QUEUE_CAPACITY],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Async-signal-safe.
    pub(crate) fn push(&self, signo: i32, ctx: SignalContext) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= QUEUE_CAPACITY {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &self.slots[tail % QUEUE_CAPACITY];
        slot.signo.store(signo, Ordering::Relaxed);
        slot.sender_pid.store(ctx.sender_pid, Ordering::Relaxed);
        slot.code.store(ctx.code, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    fn pop(&self) -> Option<(i32, SignalContext)> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let entry = self.read(head);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(entry)
    }

    fn read(&self, index: usize) -> (i32, SignalContext) {
        let slot = &self.slots[index % QUEUE_CAPACITY];
        (
            slot.signo.load(Ordering::Relaxed),
            SignalContext {
                sender_pid: slot.sender_pid.load(Ordering::Relaxed),
                code: slot.code.load(Ordering::Relaxed),
            },
        )
    }

    fn snapshot(&self) -> Vec<(i32, SignalContext)> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let mut entries = Vec::with_capacity(tail.wrapping_sub(head));
        let mut index = head;
        while index != tail {
            entries.push(self.read(index));
            index = index.wrapping_add(1);
        }
        entries
    }

    fn take_dropped(&self) -> usize {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

/// Runs in interrupt context. The kernel masks the whole monitored set for
/// the duration (see `sa_mask` in `install`), so this is the only writer.
extern "C" fn defer_signal(signo: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // SAFETY: the kernel hands an SA_SIGINFO handler a valid siginfo_t.
    let ctx = unsafe { SignalContext::from_siginfo(info) };
    PENDING.push(signo, ctx);
}

/// Blocks a signal set on the current thread until dropped.
struct Masked<'a> {
    set: &'a SigSet,
}

impl<'a> Masked<'a> {
    fn new(set: &'a SigSet) -> Self {
        if let Err(e) = set.thread_block() {
            tracing::error!(error = %e, "failed to mask monitored signals");
        }
        Self { set }
    }
}

impl Drop for Masked<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.set.thread_unblock() {
            tracing::error!(error = %e, "failed to unmask monitored signals");
        }
    }
}

/// Process-wide deferred signal dispatch.
///
/// Constructed once by [`SignalRegistry::install`] and passed by reference to
/// whatever needs a drain point.
pub struct SignalRegistry {
    monitored: SigSet,
    dispositions: HashMap<Signal, Disposition>,
    queue: &'static PendingQueue,
    suspended: bool,
    /// Termination requested while no caller could receive it (a guard
    /// dropped on an error path). Returned by the next drain.
    stashed: Option<Termination>,
}

impl SignalRegistry {
    /// Install deferring handlers for every signal in `handlers`.
    ///
    /// The signals are blocked while their dispositions are swapped so a
    /// delivery can't race the capture of the original one. Where `policy`
    /// says so, the original disposition replaces the requested one.
    pub fn install(
        handlers: impl IntoIterator<Item = (Signal, Disposition)>,
        policy: PreservePolicy,
    ) -> Result<Self, SignalError> {
        if INSTALLED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SignalError::AlreadyInstalled);
        }

        let mut dispositions: HashMap<Signal, Disposition> = handlers.into_iter().collect();
        let mut monitored = SigSet::empty();
        for sig in dispositions.keys() {
            monitored.add(*sig);
        }

        monitored.thread_block().map_err(|source| SignalError::Os {
            op: "pthread_sigmask",
            signal: None,
            source,
        })?;

        let deferring = SigAction::new(
            SigHandler::SigAction(defer_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            monitored,
        );

        let signals: Vec<Signal> = dispositions.keys().copied().collect();
        let mut replaced: Vec<(Signal, SigAction)> = Vec::with_capacity(signals.len());
        for sig in signals {
            // SAFETY: `defer_signal` only touches atomics.
            match unsafe { signal::sigaction(sig, &deferring) } {
                Ok(original) => {
                    if policy.preserves(sig, original.handler()) {
                        tracing::debug!(signal = sig.as_str(), handler = ?original.handler(), "preserving original disposition");
                        dispositions.insert(sig, Disposition::from_os(original.handler()));
                    }
                    replaced.push((sig, original));
                }
                Err(source) => {
                    for (sig, original) in replaced {
                        // SAFETY: restoring what was there before.
                        let _ = unsafe { signal::sigaction(sig, &original) };
                    }
                    let _ = monitored.thread_unblock();
                    return Err(SignalError::Os {
                        op: "sigaction",
                        signal: Some(sig),
                        source,
                    });
                }
            }
        }

        monitored.thread_unblock().map_err(|source| SignalError::Os {
            op: "pthread_sigmask",
            signal: None,
            source,
        })?;

        Ok(Self {
            monitored,
            dispositions,
            queue: &PENDING,
            suspended: false,
            stashed: None,
        })
    }

    /// Dispatch every queued signal, oldest first.
    ///
    /// A handler returning `Err(Termination)` stops the drain; entries queued
    /// behind it stay queued.
    pub fn drain(&mut self) -> Result<(), Termination> {
        if self.suspended {
            return Ok(());
        }
        if let Some(termination) = self.stashed.take() {
            return Err(termination);
        }

        let _masked = Masked::new(&self.monitored);

        let dropped = self.queue.take_dropped();
        if dropped > 0 {
            tracing::warn!(dropped, "signal queue overflowed, deliveries lost");
        }

        while let Some((signo, ctx)) = self.queue.pop() {
            let Ok(sig) = Signal::try_from(signo) else {
                continue;
            };
            tracing::debug!(signal = sig.as_str(), sender_pid = ctx.sender_pid, "dispatching deferred signal");
            match self.dispositions.get_mut(&sig) {
                None | Some(Disposition::Ignore) => {}
                Some(Disposition::Handler(handler)) => handler(sig, &ctx)?,
                Some(Disposition::Foreign(handler)) => call_foreign(*handler, sig, &ctx),
                Some(Disposition::Default) => {
                    if let Err(e) = replay_default(sig) {
                        tracing::error!(signal = sig.as_str(), error = %e, "failed to replay default action");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Lift suspension and drain whatever arrived meanwhile.
    pub fn resume(&mut self) -> Result<(), Termination> {
        self.suspended = false;
        self.drain()
    }

    #[allow(dead_code)]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Suspend dispatch until the returned guard is released or dropped.
    pub fn suspended(&mut self) -> Suspended<'_> {
        self.suspend();
        Suspended {
            registry: self,
            released: false,
        }
    }

    /// Drain stale signals, then run `op`.
    pub fn guarded<T, E, F>(&mut self, op: F) -> Result<T, E>
    where
        E: From<Termination>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.drain()?;
        op(self)
    }

    /// Copy of the queue, oldest first.
    #[allow(dead_code)]
    pub fn pending(&self) -> Vec<(Signal, SignalContext)> {
        let _masked = Masked::new(&self.monitored);
        self.queue
            .snapshot()
            .into_iter()
            .filter_map(|(signo, ctx)| Signal::try_from(signo).ok().map(|s| (s, ctx)))
            .collect()
    }
}

/// Scoped suspension. Dispatch resumes on every exit path.
pub struct Suspended<'a> {
    registry: &'a mut SignalRegistry,
    released: bool,
}

impl Suspended<'_> {
    /// Resume and report a termination requested while suspended.
    pub fn release(mut self) -> Result<(), Termination> {
        self.released = true;
        self.registry.resume()
    }
}

impl std::ops::Deref for Suspended<'_> {
    type Target = SignalRegistry;

    fn deref(&self) -> &SignalRegistry {
        self.registry
    }
}

impl std::ops::DerefMut for Suspended<'_> {
    fn deref_mut(&mut self) -> &mut SignalRegistry {
        self.registry
    }
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(termination) = self.registry.resume() {
            self.registry.stashed = Some(termination);
        }
    }
}

fn call_foreign(handler: SigHandler, sig: Signal, ctx: &SignalContext) {
    let signo = sig as libc::c_int;
    match handler {
        SigHandler::Handler(f) => f(signo),
        SigHandler::SigAction(f) => {
            // SAFETY: siginfo_t is plain old data; zeroed is a valid value.
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            info.si_signo = signo;
            info.si_code = ctx.code;
            f(signo, &mut info, std::ptr::null_mut());
        }
        SigHandler::SigDfl | SigHandler::SigIgn => {}
    }
}

/// Let the OS default action for `sig` happen to this process.
///
/// Called with the monitored set masked. Only `sig` is unmasked around the
/// delivery, so other queued or in-flight signals are neither lost nor
/// delivered twice.
fn replay_default(sig: Signal) -> Result<(), SignalError> {
    let os = |op: &'static str| {
        move |source| SignalError::Os {
            op,
            signal: Some(sig),
            source,
        }
    };

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing SIG_DFL.
    let deferring = unsafe { signal::sigaction(sig, &default) }.map_err(os("sigaction"))?;

    let mut only = SigSet::empty();
    only.add(sig);

    signal::raise(sig).map_err(os("raise"))?;
    only.thread_unblock().map_err(os("pthread_sigmask"))?;
    // Still here: the default action was ignore, stop or continue.
    only.thread_block().map_err(os("pthread_sigmask"))?;

    // SAFETY: reinstalling the deferring handler we just took out.
    unsafe { signal::sigaction(sig, &deferring) }.map_err(os("sigaction"))?;
    Ok(())
}

#[cfg(test)]
impl SignalRegistry {
    /// Registry with its own queue and no OS handlers; signals are fed in
    /// with [`SignalRegistry::inject`].
    pub(crate) fn detached(handlers: impl IntoIterator<Item = (Signal, Disposition)>) -> Self {
        let dispositions: HashMap<Signal, Disposition> = handlers.into_iter().collect();
        let mut monitored = SigSet::empty();
        for sig in dispositions.keys() {
            monitored.add(*sig);
        }
        Self {
            monitored,
            dispositions,
            queue: Box::leak(Box::new(PendingQueue::new())),
            suspended: false,
            stashed: None,
        }
    }

    pub(crate) fn inject(&self, sig: Signal) {
        self.queue.push(sig as i32, SignalContext::default());
    }
}
