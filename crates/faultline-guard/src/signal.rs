//! Fault capture: process-wide signal handlers and per-thread guard stacks.
//!
//! Every thread that runs protected code owns a [`GuardCtx`] holding a fixed
//! stack of [`GuardSlot`]s. Protecting a body pushes a slot, records a resume
//! point with `sigsetjmp` and marks the slot armed. When one of the covered
//! signals arrives, the handler looks up the faulting thread's context, and if
//! the top slot is armed it records the signal and fault address and jumps back
//! with `siglongjmp`. Faults on threads without an armed slot are passed on to
//! whatever disposition was registered before ours.
//!
//! # Async-signal-safety
//!
//! The handler only performs:
//! - `pthread_getspecific` on a key created before any handler is installed,
//! - lock-free atomic loads and stores,
//! - `siglongjmp`, or the chaining calls `sigaction`/`raise` on the crash path.
//!
//! Nothing in the handler allocates, locks, or touches `thread_local!` storage.
//!
//! # Platform support
//!
//! Linux only. Elsewhere installation reports [`InitError::Unsupported`].

use faultline_core::{FaultKind, InitError, RuntimeError};

/// Depth of the per-thread guard stack.
pub const GUARD_CAPACITY: usize = 16;

/// Result of running a body under an armed guard slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<R> {
    /// The body returned normally.
    Completed(R),
    /// A covered signal was intercepted and control resumed at the guard.
    Faulted {
        kind: FaultKind,
        signal: i32,
        fault_addr: usize,
    },
}

/// Signal number delivered for `kind`.
#[must_use]
pub const fn signal_number(kind: FaultKind) -> i32 {
    match kind {
        FaultKind::Segmentation => libc::SIGSEGV,
        FaultKind::Abort => libc::SIGABRT,
        FaultKind::Bus => libc::SIGBUS,
        FaultKind::FloatingPoint => libc::SIGFPE,
        FaultKind::IllegalInstruction => libc::SIGILL,
    }
}

/// The covered kind delivered as `sig`, if any.
#[must_use]
pub fn kind_of(sig: i32) -> Option<FaultKind> {
    FaultKind::ALL
        .into_iter()
        .find(|kind| signal_number(*kind) == sig)
}

#[cfg(target_os = "linux")]
mod platform {
    use std::cell::UnsafeCell;
    use std::ffi::c_void;
    use std::ptr;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

    use parking_lot::{Mutex, const_mutex};

    use super::{GUARD_CAPACITY, Guarded, kind_of, signal_number};
    use faultline_core::{FaultKind, InitError, RuntimeError};

    /// Alternate signal stack size for threads that have none.
    const ALT_STACK_SIZE: usize = 64 * 1024;

    /// `sigjmp_buf` size, over-allocated. glibc uses 200 bytes on x86_64.
    #[cfg(target_arch = "x86_64")]
    const JMP_BUF_LEN: usize = 256;
    #[cfg(not(target_arch = "x86_64"))]
    const JMP_BUF_LEN: usize = 512;

    #[repr(C, align(16))]
    struct SigJmpBuf {
        _buf: [u8; JMP_BUF_LEN],
    }

    impl SigJmpBuf {
        const fn zeroed() -> Self {
            Self {
                _buf: [0u8; JMP_BUF_LEN],
            }
        }
    }

    unsafe extern "C" {
        // glibc exposes sigsetjmp only as a macro over __sigsetjmp.
        #[link_name = "__sigsetjmp"]
        fn sigsetjmp(env: *mut SigJmpBuf, savemask: libc::c_int) -> libc::c_int;
        fn siglongjmp(env: *mut SigJmpBuf, val: libc::c_int) -> !;
    }

    // ── Guard slots ────────────────────────────────────────────────────

    const SLOT_IDLE: u8 = 0;
    const SLOT_ARMED: u8 = 1;
    const SLOT_FIRED: u8 = 2;

    struct GuardSlot {
        jmp_buf: UnsafeCell<SigJmpBuf>,
        state: AtomicU8,
        signal: AtomicI32,
        fault_addr: AtomicUsize,
    }

    impl GuardSlot {
        const fn new() -> Self {
            Self {
                jmp_buf: UnsafeCell::new(SigJmpBuf::zeroed()),
                state: AtomicU8::new(SLOT_IDLE),
                signal: AtomicI32::new(0),
                fault_addr: AtomicUsize::new(0),
            }
        }

        fn reset(&self) {
            self.state.store(SLOT_IDLE, Ordering::Release);
            self.signal.store(0, Ordering::Relaxed);
            self.fault_addr.store(0, Ordering::Relaxed);
        }
    }

    /// Per-thread guard stack, reachable from the handler via
    /// `pthread_getspecific`.
    struct GuardCtx {
        slots: [GuardSlot; GUARD_CAPACITY],
        depth: AtomicUsize,
        /// Alternate signal stack mapped for this thread, null if the thread
        /// already had one.
        alt_stack: *mut c_void,
    }

    static GUARD_KEY: OnceLock<libc::pthread_key_t> = OnceLock::new();
    static KEY_LOCK: Mutex<()> = const_mutex(());

    /// pthread destructor for a thread's [`GuardCtx`].
    ///
    /// # Safety
    ///
    /// `ptr` was produced by `Box::into_raw` in [`thread_ctx`].
    unsafe extern "C" fn guard_ctx_dtor(ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: ptr came from Box::into_raw in thread_ctx.
        let ctx = unsafe { Box::from_raw(ptr.cast::<GuardCtx>()) };
        if !ctx.alt_stack.is_null() {
            // SAFETY: the stack was installed by this thread; disabling it
            // before unmapping keeps the kernel from delivering onto it.
            unsafe {
                let disable = libc::stack_t {
                    ss_sp: ptr::null_mut(),
                    ss_flags: libc::SS_DISABLE,
                    ss_size: 0,
                };
                libc::sigaltstack(&raw const disable, ptr::null_mut());
                libc::munmap(ctx.alt_stack, ALT_STACK_SIZE);
            }
        }
    }

    fn guard_key() -> Result<libc::pthread_key_t, InitError> {
        if let Some(&key) = GUARD_KEY.get() {
            return Ok(key);
        }
        let _lock = KEY_LOCK.lock();
        if let Some(&key) = GUARD_KEY.get() {
            return Ok(key);
        }
        let mut key: libc::pthread_key_t = 0;
        // SAFETY: key is a valid out-pointer; guard_ctx_dtor matches the
        // destructor signature.
        let rc = unsafe { libc::pthread_key_create(&raw mut key, Some(guard_ctx_dtor)) };
        if rc != 0 {
            return Err(InitError::ThreadKey(rc));
        }
        let _ = GUARD_KEY.set(key);
        Ok(key)
    }

    /// Read the current thread's context without creating it.
    ///
    /// Async-signal-safe: `pthread_getspecific` is on the POSIX list.
    #[inline]
    fn current_ctx() -> *mut GuardCtx {
        let Some(&key) = GUARD_KEY.get() else {
            return ptr::null_mut();
        };
        // SAFETY: key was created by guard_key.
        unsafe { libc::pthread_getspecific(key) }.cast::<GuardCtx>()
    }

    /// Map and register an alternate signal stack unless the thread already
    /// has one. Returns the mapping, or null when none was installed.
    fn ensure_alt_stack() -> *mut c_void {
        // SAFETY: querying with a null new-stack pointer only reads state.
        unsafe {
            let mut current: libc::stack_t = std::mem::zeroed();
            if libc::sigaltstack(ptr::null(), &raw mut current) == 0
                && current.ss_flags & libc::SS_DISABLE == 0
            {
                return ptr::null_mut();
            }
        }
        // SAFETY: fresh anonymous private mapping; MAP_FAILED is checked.
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ALT_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return ptr::null_mut();
        }
        let ss = libc::stack_t {
            ss_sp: mem,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        // SAFETY: ss describes the mapping created above.
        if unsafe { libc::sigaltstack(&raw const ss, ptr::null_mut()) } != 0 {
            // SAFETY: mem was returned by mmap with this size.
            unsafe { libc::munmap(mem, ALT_STACK_SIZE) };
            return ptr::null_mut();
        }
        mem
    }

    /// The current thread's context, created on first use.
    fn thread_ctx() -> Result<&'static GuardCtx, InitError> {
        let key = guard_key()?;
        let mut ctx = current_ctx();
        if ctx.is_null() {
            let fresh = Box::new(GuardCtx {
                slots: [const { GuardSlot::new() }; GUARD_CAPACITY],
                depth: AtomicUsize::new(0),
                alt_stack: ensure_alt_stack(),
            });
            ctx = Box::into_raw(fresh);
            // SAFETY: key is valid and ctx is a live heap pointer owned by
            // the key from here on.
            let rc = unsafe { libc::pthread_setspecific(key, ctx.cast()) };
            if rc != 0 {
                // SAFETY: ownership was not transferred.
                unsafe { guard_ctx_dtor(ctx.cast()) };
                return Err(InitError::ThreadKey(rc));
            }
        }
        // SAFETY: the context lives until this thread exits, and the returned
        // reference never leaves this thread's protected-call frames.
        Ok(unsafe { &*ctx })
    }

    // ── Handler registration ───────────────────────────────────────────

    const KINDS: usize = FaultKind::ALL.len();

    static INSTALLED: [AtomicBool; KINDS] = [const { AtomicBool::new(false) }; KINDS];
    // Previous dispositions, mirrored into atomics for the handler.
    static PREV_HANDLER: [AtomicUsize; KINDS] = [const { AtomicUsize::new(0) }; KINDS];
    static PREV_FLAGS: [AtomicI32; KINDS] = [const { AtomicI32::new(0) }; KINDS];
    static SAVED: Mutex<[Option<libc::sigaction>; KINDS]> = const_mutex([None; KINDS]);

    fn handler_address() -> usize {
        fault_handler as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) as usize
    }

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    pub(super) fn install(kind: FaultKind) -> Result<(), InitError> {
        guard_key()?;
        let mut saved = SAVED.lock();
        let idx = kind.index();
        if INSTALLED[idx].load(Ordering::Acquire) {
            return Ok(());
        }
        let sig = signal_number(kind);
        // SAFETY: both sigaction structs are fully initialized before use and
        // sig is a valid catchable signal.
        unsafe {
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &raw mut previous) != 0 {
                return Err(InitError::Install {
                    signal: sig,
                    errno: last_errno(),
                });
            }
            PREV_HANDLER[idx].store(previous.sa_sigaction, Ordering::Release);
            PREV_FLAGS[idx].store(previous.sa_flags, Ordering::Release);

            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigfillset(&raw mut sa.sa_mask);
            sa.sa_sigaction = handler_address();
            if libc::sigaction(sig, &raw const sa, ptr::null_mut()) != 0 {
                return Err(InitError::Install {
                    signal: sig,
                    errno: last_errno(),
                });
            }
            saved[idx] = Some(previous);
        }
        INSTALLED[idx].store(true, Ordering::Release);
        Ok(())
    }

    pub(super) fn restore(kind: FaultKind) -> Result<(), InitError> {
        let mut saved = SAVED.lock();
        let idx = kind.index();
        if !INSTALLED[idx].load(Ordering::Acquire) {
            return Ok(());
        }
        let sig = signal_number(kind);
        if let Some(previous) = saved[idx] {
            // SAFETY: previous was filled in by sigaction during install.
            if unsafe { libc::sigaction(sig, &raw const previous, ptr::null_mut()) } != 0 {
                return Err(InitError::Install {
                    signal: sig,
                    errno: last_errno(),
                });
            }
        }
        saved[idx] = None;
        INSTALLED[idx].store(false, Ordering::Release);
        Ok(())
    }

    pub(super) fn is_installed(kind: FaultKind) -> bool {
        INSTALLED[kind.index()].load(Ordering::Acquire)
    }

    pub(super) fn current_action(kind: FaultKind) -> Result<usize, InitError> {
        let sig = signal_number(kind);
        // SAFETY: query only.
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &raw mut current) != 0 {
                return Err(InitError::Install {
                    signal: sig,
                    errno: last_errno(),
                });
            }
            Ok(current.sa_sigaction)
        }
    }

    pub(super) fn owns(kind: FaultKind) -> bool {
        current_action(kind).is_ok_and(|action| action == handler_address())
    }

    pub(super) fn guard_depth() -> usize {
        let ctx = current_ctx();
        if ctx.is_null() {
            return 0;
        }
        // SAFETY: ctx belongs to this thread and is live.
        unsafe { (*ctx).depth.load(Ordering::Acquire) }
    }

    // ── Signal handler ─────────────────────────────────────────────────

    extern "C" fn fault_handler(
        sig: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut c_void,
    ) {
        let ctx = current_ctx();
        if !ctx.is_null() {
            // SAFETY: ctx is this thread's live context.
            let ctx = unsafe { &*ctx };
            let depth = ctx.depth.load(Ordering::Acquire);
            if depth > 0 {
                let slot = &ctx.slots[depth - 1];
                if slot
                    .state
                    .compare_exchange(SLOT_ARMED, SLOT_FIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.signal.store(sig, Ordering::Release);
                    // si_addr is only meaningful for kernel-generated faults
                    // (si_code > 0), not for raise/kill.
                    if !info.is_null() {
                        // SAFETY: info is valid for the duration of the handler.
                        unsafe {
                            if (*info).si_code > 0 {
                                let addr = (*info).si_addr() as usize;
                                slot.fault_addr.store(addr, Ordering::Release);
                            }
                        }
                    }
                    // SAFETY: the frame that called sigsetjmp on this buffer
                    // is still live, since the slot is only armed while
                    // run_armed is on the stack. The saved mask is restored.
                    unsafe { siglongjmp(slot.jmp_buf.get(), sig) };
                }
            }
        }
        // SAFETY: we are in a signal handler for sig.
        unsafe { chain_previous(sig, info, ucontext) };
    }

    /// Pass an unguarded fault on to the disposition that preceded ours.
    ///
    /// # Safety
    ///
    /// Must only be called from the signal handler for `sig`.
    unsafe fn chain_previous(sig: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
        let Some(kind) = kind_of(sig) else {
            return;
        };
        let idx = kind.index();
        let handler = PREV_HANDLER[idx].load(Ordering::Acquire);
        let flags = PREV_FLAGS[idx].load(Ordering::Acquire);

        // A kernel-generated fault re-executes the faulting instruction when
        // the handler returns, so ignoring it would spin forever. Only a
        // raise/kill may be dropped.
        // SAFETY: info is valid for the duration of the handler.
        let synchronous = !info.is_null() && unsafe { (*info).si_code } > 0;
        if handler == libc::SIG_IGN && !synchronous {
            return;
        }
        if handler == libc::SIG_DFL || handler == libc::SIG_IGN || handler == handler_address() {
            // SAFETY: sigaction and raise are async-signal-safe. The signal
            // stays blocked until the handler returns, then terminates the
            // process under the default action.
            unsafe {
                let mut dfl: libc::sigaction = std::mem::zeroed();
                dfl.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(sig, &raw const dfl, ptr::null_mut());
                libc::raise(sig);
            }
            return;
        }
        if flags & libc::SA_SIGINFO != 0 {
            // SAFETY: the previous disposition declared SA_SIGINFO, so the
            // stored address is a three-argument handler.
            let previous: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) =
                unsafe { std::mem::transmute(handler) };
            previous(sig, info, ucontext);
        } else {
            // SAFETY: without SA_SIGINFO the stored address is a plain handler.
            let previous: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            previous(sig);
        }
    }

    // ── Protected execution ────────────────────────────────────────────

    /// Record a resume point in `slot`, arm it, and run `body`.
    ///
    /// Returns 0 when `body` completed, or the signal number when control came
    /// back through `siglongjmp`. Nothing but the return value of `sigsetjmp`
    /// is used after a resumption.
    ///
    /// # Safety
    ///
    /// `slot` must be the top slot of the calling thread's guard stack.
    #[inline(never)]
    unsafe fn run_armed(slot: &GuardSlot, body: &mut dyn FnMut()) -> libc::c_int {
        // SAFETY: the buffer belongs to this thread's slot and outlives this
        // frame. savemask=1 so the signal mask is restored on resumption.
        let rc = unsafe { sigsetjmp(slot.jmp_buf.get(), 1) };
        if rc != 0 {
            return rc;
        }
        slot.state.store(SLOT_ARMED, Ordering::Release);
        body();
        slot.state.store(SLOT_IDLE, Ordering::Release);
        0
    }

    /// Pops the slot pushed by [`protect`] on every exit path.
    struct SlotRelease<'a> {
        ctx: &'a GuardCtx,
        depth: usize,
    }

    impl Drop for SlotRelease<'_> {
        fn drop(&mut self) {
            self.ctx.slots[self.depth].reset();
            self.ctx.depth.store(self.depth, Ordering::Release);
        }
    }

    pub(super) fn protect<R>(body: impl FnOnce() -> R) -> Result<Guarded<R>, RuntimeError> {
        let ctx = thread_ctx()?;
        let depth = ctx.depth.load(Ordering::Acquire);
        if depth >= GUARD_CAPACITY {
            return Err(RuntimeError::NestingTooDeep(GUARD_CAPACITY));
        }
        let slot = &ctx.slots[depth];
        slot.reset();
        ctx.depth.store(depth + 1, Ordering::Release);
        let release = SlotRelease { ctx, depth };

        let mut body = Some(body);
        let mut result = None;
        let mut run = || {
            if let Some(body) = body.take() {
                result = Some(body());
            }
        };
        // SAFETY: slot is the top of this thread's stack until `release`
        // drops.
        let rc = unsafe { run_armed(slot, &mut run) };

        if rc != 0 {
            let signal = slot.signal.load(Ordering::Acquire);
            let fault_addr = slot.fault_addr.load(Ordering::Acquire);
            drop(release);
            let kind = kind_of(signal).unwrap_or(FaultKind::Segmentation);
            return Ok(Guarded::Faulted {
                kind,
                signal,
                fault_addr,
            });
        }
        drop(release);
        result
            .map(Guarded::Completed)
            .ok_or_else(|| RuntimeError::raised("protected body did not run"))
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::Guarded;
    use faultline_core::{FaultKind, InitError, RuntimeError};

    pub(super) fn install(_kind: FaultKind) -> Result<(), InitError> {
        Err(InitError::Unsupported)
    }

    pub(super) fn restore(_kind: FaultKind) -> Result<(), InitError> {
        Ok(())
    }

    pub(super) fn is_installed(_kind: FaultKind) -> bool {
        false
    }

    pub(super) fn current_action(_kind: FaultKind) -> Result<usize, InitError> {
        Err(InitError::Unsupported)
    }

    pub(super) fn owns(_kind: FaultKind) -> bool {
        false
    }

    pub(super) fn guard_depth() -> usize {
        0
    }

    pub(super) fn protect<R>(_body: impl FnOnce() -> R) -> Result<Guarded<R>, RuntimeError> {
        Err(RuntimeError::Init(InitError::Unsupported))
    }
}

/// Register the fault handler for `kind`, saving the disposition it replaces.
/// Idempotent while installed.
pub fn install(kind: FaultKind) -> Result<(), InitError> {
    platform::install(kind)
}

/// Register the fault handler for every covered kind.
pub fn install_all() -> Result<(), InitError> {
    FaultKind::ALL.into_iter().try_for_each(install)
}

/// Put back the disposition saved when `kind` was installed.
pub fn restore(kind: FaultKind) -> Result<(), InitError> {
    platform::restore(kind)
}

/// Restore every installed kind.
///
/// A kind that fails to restore does not stop the others; it stays
/// installed with its saved disposition so a later call can retry. The
/// first failure is returned.
pub fn restore_all() -> Result<(), InitError> {
    visit_all(restore)
}

fn visit_all(mut step: impl FnMut(FaultKind) -> Result<(), InitError>) -> Result<(), InitError> {
    let mut first = None;
    for kind in FaultKind::ALL {
        if let Err(err) = step(kind) {
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Whether our handler is registered for `kind`.
#[must_use]
pub fn is_installed(kind: FaultKind) -> bool {
    platform::is_installed(kind)
}

/// Raw address of the disposition currently registered for `kind`
/// (`SIG_DFL`, `SIG_IGN` or a handler address).
pub fn current_action(kind: FaultKind) -> Result<usize, InitError> {
    platform::current_action(kind)
}

/// Whether the disposition currently registered for `kind` is our handler.
#[must_use]
pub fn owns(kind: FaultKind) -> bool {
    platform::owns(kind)
}

/// Number of guard slots in use on this thread.
#[must_use]
pub fn guard_depth() -> usize {
    platform::guard_depth()
}

/// Run `body` with a guard slot armed on this thread.
///
/// The handlers must already be installed for a fault to be intercepted.
/// Nesting past [`GUARD_CAPACITY`] fails with
/// [`RuntimeError::NestingTooDeep`] without running `body`.
///
/// Destructors of frames skipped by a resumption do not run; whatever they
/// owned is leaked.
pub fn protect<R>(body: impl FnOnce() -> R) -> Result<Guarded<R>, RuntimeError> {
    platform::protect(body)
}
