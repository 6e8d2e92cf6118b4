#![cfg(target_os = "linux")]

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, const_mutex};

use faultline_core::config::{self, Disposition};
use faultline_core::frame;
use faultline_core::{Callable, CallableRef, FaultKind, Kwargs, RuntimeError, Value};
use faultline_guard::signal::{self, GUARD_CAPACITY};
use faultline_guard::{FaultReporter, guarded, handle, probes, region, supervise};

// Handler registration is process-wide; serialize everything in this binary.
static TEST_LOCK: Mutex<()> = const_mutex(());

fn segfaulting(name: &str) -> CallableRef {
    Callable::new(name, &[], |_| {
        let byte = probes::read_protected_page();
        Ok(Value::Int(i64::from(byte)))
    })
}

fn raising(name: &str, kind: FaultKind) -> CallableRef {
    Callable::new(name, &[], move |_| {
        probes::raise_signal(kind);
        Ok(Value::None)
    })
}

#[test]
fn returns_value_of_successful_call() {
    let _guard = TEST_LOCK.lock();
    let add = Callable::new("add", &["a", "b"], |scope| {
        let a = scope.get("a")?.as_int().unwrap_or(0);
        let b = scope.get("b")?.as_int().unwrap_or(0);
        Ok(Value::Int(a + b))
    });
    let result = handle(&add, Some(vec![Value::Int(2), Value::Int(40)]), None);
    assert_eq!(result, Ok(Value::Int(42)));

    let mut kwargs = Kwargs::new();
    kwargs.insert("b".into(), Value::Int(1));
    let result = handle(&add, Some(vec![Value::Int(1)]), Some(kwargs));
    assert_eq!(result, Ok(Value::Int(2)));
}

#[test]
fn ordinary_errors_pass_through_unchanged() {
    let _guard = TEST_LOCK.lock();
    let failing = Callable::new("failing", &[], |_| Err(RuntimeError::raised("bad input")));
    assert_eq!(
        handle(&failing, None, None),
        Err(RuntimeError::Raised("bad input".into()))
    );

    let strict = Callable::new("strict", &[], |_| Ok(Value::None));
    assert!(matches!(
        handle(&strict, Some(vec![Value::Int(1)]), None),
        Err(RuntimeError::TooManyArguments { .. })
    ));
}

#[test]
fn segfault_becomes_fault_error_naming_the_callable() {
    let _guard = TEST_LOCK.lock();
    let err = handle(&segfaulting("read_header"), None, None).unwrap_err();
    let report = err.as_fault().expect("fault report");
    assert_eq!(report.kind, FaultKind::Segmentation);
    assert_eq!(report.signal, libc::SIGSEGV);
    assert_eq!(report.unit, "read_header");
    assert_eq!(report.fault_addr, probes::protected_page_address());
    assert_eq!(
        err.to_string(),
        "segmentation fault occurred during execution of read_header"
    );
}

#[test]
fn fault_names_the_innermost_frame() {
    let _guard = TEST_LOCK.lock();
    let inner = segfaulting("parse_inner");
    let outer = Callable::new("outer", &[], move |_| inner.call(&[], &Kwargs::new()));
    let base = frame::depth();

    let err = handle(&outer, None, None).unwrap_err();

    assert_eq!(err.as_fault().map(|r| r.unit.as_str()), Some("parse_inner"));
    assert_eq!(frame::depth(), base);
    assert_eq!(signal::guard_depth(), 0);
}

#[test]
fn abort_and_arithmetic_signals_are_captured() {
    let _guard = TEST_LOCK.lock();
    let err = handle(&raising("shutdown", FaultKind::Abort), None, None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "abnormal termination occurred during execution of shutdown"
    );
    assert_eq!(err.as_fault().map(|r| r.fault_addr), Some(0));

    let err = handle(&raising("divide", FaultKind::FloatingPoint), None, None).unwrap_err();
    assert_eq!(
        err.as_fault().map(|r| r.kind),
        Some(FaultKind::FloatingPoint)
    );

    let err = handle(&raising("mmap_tail", FaultKind::Bus), None, None).unwrap_err();
    assert_eq!(err.to_string(), "bus error occurred during execution of mmap_tail");
}

#[test]
fn repeated_faults_are_all_recoverable() {
    let _guard = TEST_LOCK.lock();
    let faulty = segfaulting("again");
    for _ in 0..50 {
        let err = handle(&faulty, None, None).unwrap_err();
        assert_eq!(err.as_fault().map(|r| r.unit.as_str()), Some("again"));
    }
    let ok = Callable::new("fine", &[], |_| Ok(Value::Bool(true)));
    assert_eq!(handle(&ok, None, None), Ok(Value::Bool(true)));
}

#[test]
fn fault_after_inner_supervised_call_resumes_at_outer_call() {
    let _guard = TEST_LOCK.lock();
    let inner_ok = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&inner_ok);
    let outer = Callable::new("outer_job", &[], move |_| {
        let step = Callable::new("step", &[], |_| Ok(Value::Int(1)));
        let value = handle(&step, None, None)?;
        seen.store(value == Value::Int(1), Ordering::SeqCst);
        probes::read_protected_page();
        Ok(Value::None)
    });

    let err = handle(&outer, None, None).unwrap_err();

    assert!(inner_ok.load(Ordering::SeqCst));
    assert_eq!(err.as_fault().map(|r| r.unit.as_str()), Some("outer_job"));
    assert_eq!(signal::guard_depth(), 0);
}

#[test]
fn inner_fault_is_contained_by_inner_call() {
    let _guard = TEST_LOCK.lock();
    let outer = Callable::new("coordinator", &[], |_| {
        let inner = handle(&segfaulting("worker"), None, None);
        let unit = inner
            .err()
            .and_then(|e| e.as_fault().map(|r| r.unit.clone()))
            .unwrap_or_default();
        Ok(Value::str(&unit))
    });
    assert_eq!(handle(&outer, None, None), Ok(Value::str("worker")));
}

#[test]
fn nesting_beyond_capacity_is_refused() {
    let _guard = TEST_LOCK.lock();

    fn nest(levels: usize) -> Result<usize, RuntimeError> {
        supervise(
            || "nest".to_string(),
            || if levels == 0 { Ok(0) } else { nest(levels - 1).map(|n| n + 1) },
        )?
    }

    assert_eq!(nest(GUARD_CAPACITY - 1), Ok(GUARD_CAPACITY - 1));
    assert_eq!(
        nest(GUARD_CAPACITY),
        Err(RuntimeError::NestingTooDeep(GUARD_CAPACITY))
    );
    assert_eq!(signal::guard_depth(), 0);
}

#[test]
fn guarded_wrapper_keeps_name_and_captures_faults() {
    let _guard = TEST_LOCK.lock();
    let wrapped = guarded(&segfaulting("decode"));
    assert_eq!(wrapped.name(), "decode");

    let err = wrapped.call(&[], &Kwargs::new()).unwrap_err();
    assert_eq!(err.as_fault().map(|r| r.unit.as_str()), Some("decode"));

    let echo = guarded(&Callable::new("echo", &["x"], |scope| scope.get("x")));
    assert_eq!(echo.params(), ["x"]);
    assert_eq!(echo.call(&[Value::Int(5)], &Kwargs::new()), Ok(Value::Int(5)));
}

#[test]
fn dispositions_are_restored_after_each_call() {
    let _guard = TEST_LOCK.lock();
    let previous = config::set_disposition(Disposition::RestoreDefault);
    let before: Vec<usize> = FaultKind::ALL
        .iter()
        .map(|k| signal::current_action(*k).unwrap())
        .collect();

    let observed = Callable::new("observe", &[], |_| {
        Ok(Value::Bool(
            FaultKind::ALL.iter().all(|k| signal::owns(*k)),
        ))
    });
    assert_eq!(handle(&observed, None, None), Ok(Value::Bool(true)));
    let _ = handle(&segfaulting("crash"), None, None);

    let after: Vec<usize> = FaultKind::ALL
        .iter()
        .map(|k| signal::current_action(*k).unwrap())
        .collect();
    assert_eq!(before, after);
    assert!(FaultKind::ALL.iter().all(|k| !signal::is_installed(*k)));
    assert_eq!(region::active_regions(), 0);
    assert_eq!(region::take_restore_error(), None);
    config::set_disposition(previous);
}

#[test]
fn stay_armed_keeps_handlers_installed() {
    let _guard = TEST_LOCK.lock();
    let previous = config::set_disposition(Disposition::StayArmed);
    let ok = Callable::new("noop", &[], |_| Ok(Value::None));
    handle(&ok, None, None).unwrap();
    assert!(signal::owns(FaultKind::Segmentation));
    assert!(signal::is_installed(FaultKind::Abort));

    config::set_disposition(Disposition::RestoreDefault);
    handle(&ok, None, None).unwrap();
    assert!(!signal::owns(FaultKind::Segmentation));
    config::set_disposition(previous);
}

#[test]
fn init_is_idempotent_and_leaves_nothing_installed_by_default() {
    let _guard = TEST_LOCK.lock();
    let previous = config::set_disposition(Disposition::RestoreDefault);
    faultline_guard::init().unwrap();
    faultline_guard::init().unwrap();
    assert!(!signal::owns(FaultKind::Segmentation));
    config::set_disposition(previous);
}

struct CountingReporter {
    name: String,
    enabled: AtomicBool,
    disabled_count: AtomicUsize,
}

impl FaultReporter for CountingReporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.disabled_count.fetch_add(1, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
}

#[test]
fn reporters_are_suspended_for_the_call_and_resumed_on_every_path() {
    let _guard = TEST_LOCK.lock();
    let reporter = Arc::new(CountingReporter {
        name: "crash-printer".into(),
        enabled: AtomicBool::new(true),
        disabled_count: AtomicUsize::new(0),
    });
    faultline_guard::register_reporter(reporter.clone());

    let watched = Arc::clone(&reporter);
    let check = Callable::new("check", &[], move |_| {
        Ok(Value::Bool(watched.enabled.load(Ordering::SeqCst)))
    });
    assert_eq!(handle(&check, None, None), Ok(Value::Bool(false)));
    assert!(reporter.enabled.load(Ordering::SeqCst));

    let _ = handle(&segfaulting("loud"), None, None);
    assert!(reporter.enabled.load(Ordering::SeqCst));

    let failing = Callable::new("failing", &[], |_| Err(RuntimeError::raised("x")));
    let _ = handle(&failing, None, None);
    assert!(reporter.enabled.load(Ordering::SeqCst));
    assert_eq!(reporter.disabled_count.load(Ordering::SeqCst), 3);

    assert!(faultline_guard::unregister_reporter("crash-printer"));
    assert!(!faultline_guard::unregister_reporter("crash-printer"));
}

#[test]
fn concurrent_threads_resume_at_their_own_call_sites() {
    let _guard = TEST_LOCK.lock();
    let workers: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let name = format!("worker_{i}");
                let mut units = Vec::new();
                for _ in 0..10 {
                    let err = handle(&segfaulting(&name), None, None).unwrap_err();
                    units.push(err.as_fault().map(|r| r.unit.clone()));
                }
                (name, units)
            })
        })
        .collect();

    for worker in workers {
        let (name, units) = worker.join().unwrap();
        assert!(units.iter().all(|u| u.as_deref() == Some(name.as_str())));
    }
}

// ── Unguarded faults in a forked child ─────────────────────────────────

/// Run `body` in a forked child and return its wait status. The child exits
/// 0 when `body` returns and 101 when it panics.
fn run_in_child(body: impl FnOnce()) -> libc::c_int {
    // SAFETY: TEST_LOCK is held by the caller, so no other test in this
    // binary holds a lock across the fork; the child never returns here.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let none = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: plain syscalls in the child; expected crashes leave no core.
        unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const none) };
        let code = if catch_unwind(AssertUnwindSafe(body)).is_ok() { 0 } else { 101 };
        // SAFETY: skips the parent's atexit handlers and test harness.
        unsafe { libc::_exit(code) };
    }

    let mut status = 0;
    for _ in 0..500 {
        // SAFETY: pid is our child and status a valid out-pointer.
        if unsafe { libc::waitpid(pid, &raw mut status, libc::WNOHANG) } == pid {
            return status;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    // SAFETY: as above.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, &raw mut status, 0);
    }
    panic!("child still running after 5s");
}

/// Register `handler` as the disposition for `kind`, then install ours on
/// top of it. Exits the child with 90 if either step fails.
fn install_over(kind: FaultKind, handler: usize, flags: libc::c_int) {
    if signal::restore_all().is_err() {
        // SAFETY: child process only.
        unsafe { libc::_exit(90) };
    }
    let sig = signal::signal_number(kind);
    // SAFETY: sa is fully initialized; handler is SIG_DFL, SIG_IGN or a
    // function matching `flags`.
    let rc = unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = flags;
        libc::sigemptyset(&raw mut sa.sa_mask);
        libc::sigaction(sig, &raw const sa, std::ptr::null_mut())
    };
    if rc != 0 || signal::install(kind).is_err() {
        // SAFETY: child process only.
        unsafe { libc::_exit(90) };
    }
}

extern "C" fn exit_42_with_info(_sig: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(42) };
}

extern "C" fn exit_43(_sig: libc::c_int) {
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(43) };
}

fn killed_by(status: libc::c_int) -> Option<libc::c_int> {
    libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status))
}

fn exit_code(status: libc::c_int) -> Option<libc::c_int> {
    libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status))
}

#[test]
fn unguarded_fault_over_default_disposition_kills_the_process() {
    let _guard = TEST_LOCK.lock();
    let status = run_in_child(|| {
        install_over(FaultKind::Segmentation, libc::SIG_DFL, 0);
        probes::read_protected_page();
    });
    assert_eq!(killed_by(status), Some(libc::SIGSEGV));
}

#[test]
fn unguarded_hardware_fault_over_ignored_disposition_still_kills() {
    let _guard = TEST_LOCK.lock();
    let status = run_in_child(|| {
        install_over(FaultKind::Segmentation, libc::SIG_IGN, 0);
        probes::read_protected_page();
    });
    assert_eq!(killed_by(status), Some(libc::SIGSEGV));
}

#[test]
fn raised_signal_over_ignored_disposition_is_dropped() {
    let _guard = TEST_LOCK.lock();
    let status = run_in_child(|| {
        install_over(FaultKind::FloatingPoint, libc::SIG_IGN, 0);
        probes::raise_signal(FaultKind::FloatingPoint);
    });
    assert_eq!(exit_code(status), Some(0));
}

#[test]
fn unguarded_fault_reaches_previous_siginfo_handler() {
    let _guard = TEST_LOCK.lock();
    let handler = exit_42_with_info
        as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
        as usize;
    let status = run_in_child(|| {
        install_over(FaultKind::Segmentation, handler, libc::SA_SIGINFO);
        probes::read_protected_page();
    });
    assert_eq!(exit_code(status), Some(42));
}

#[test]
fn unguarded_fault_reaches_previous_plain_handler() {
    let _guard = TEST_LOCK.lock();
    let handler = exit_43 as extern "C" fn(libc::c_int) as usize;
    let status = run_in_child(|| {
        install_over(FaultKind::Segmentation, handler, 0);
        probes::read_protected_page();
    });
    assert_eq!(exit_code(status), Some(43));
}
