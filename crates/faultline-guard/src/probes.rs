//! Deterministic ways to fault, for tests, benchmarks and the harness.
//!
//! Every probe here terminates the process unless it runs under a supervised
//! call.

use std::sync::OnceLock;

use faultline_core::FaultKind;

use crate::signal::signal_number;

static PROTECTED_PAGE: OnceLock<usize> = OnceLock::new();

/// Address of a page mapped with no access rights. Mapped on first use and
/// kept for the life of the process.
#[must_use]
pub fn protected_page_address() -> usize {
    *PROTECTED_PAGE.get_or_init(|| {
        // SAFETY: fresh anonymous private mapping; MAP_FAILED is checked.
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            // Low addresses are never mapped for user space on Linux.
            16
        } else {
            page as usize
        }
    })
}

/// Read one byte from the protected page (`SIGSEGV`).
#[inline(never)]
pub fn read_protected_page() -> u8 {
    let addr = protected_page_address();
    // SAFETY: deliberately invalid; only sound when a guard intercepts the
    // resulting fault.
    unsafe { std::ptr::read_volatile(addr as *const u8) }
}

/// Write one byte to the protected page (`SIGSEGV`).
#[inline(never)]
pub fn write_protected_page(value: u8) {
    let addr = protected_page_address();
    // SAFETY: deliberately invalid; see read_protected_page.
    unsafe { std::ptr::write_volatile(addr as *mut u8, value) };
}

/// Deliver the signal for `kind` to the calling thread.
pub fn raise_signal(kind: FaultKind) {
    // SAFETY: raise is safe to call with any valid signal number.
    unsafe {
        libc::raise(signal_number(kind));
    }
}
