//! Stack-allocated scratch buffers.
//!
//! [`run_stack_callback`] reserves a zeroed block in its own stack frame,
//! hands the callback a wrapper describing it, and marks the wrapper freed when
//! the callback returns. Block sizes are bucketed into a few fixed capacities
//! so the reservation is a plain array in a dedicated frame.

use faultline_core::RuntimeError;

/// Largest request [`run_stack_callback`] accepts.
pub const MAX_STACK_ALLOCATION: usize = 64 * 1024;

/// Describes a block handed to a stack callback.
pub trait StackWrapper {
    /// Wrap the block at `address` holding `size` usable bytes.
    fn wrap(address: usize, size: usize) -> Self;
    /// Called once the block has gone out of scope.
    fn mark_freed(&mut self);
}

/// Place `size` zeroed bytes on the call stack and run `callback` with a
/// `W` describing them. The wrapper is marked freed before this returns.
pub fn run_stack_callback<W, R>(
    size: usize,
    callback: impl FnOnce(&mut W) -> R,
) -> Result<R, RuntimeError>
where
    W: StackWrapper,
{
    let result = match size {
        0..=64 => with_block::<64, W, R>(size, callback),
        65..=256 => with_block::<256, W, R>(size, callback),
        257..=1024 => with_block::<1024, W, R>(size, callback),
        1025..=4096 => with_block::<4096, W, R>(size, callback),
        4097..=16384 => with_block::<16384, W, R>(size, callback),
        16385..=MAX_STACK_ALLOCATION => with_block::<MAX_STACK_ALLOCATION, W, R>(size, callback),
        _ => {
            return Err(RuntimeError::StackAllocation {
                requested: size,
                limit: MAX_STACK_ALLOCATION,
            });
        }
    };
    Ok(result)
}

#[inline(never)]
fn with_block<const N: usize, W: StackWrapper, R>(
    size: usize,
    callback: impl FnOnce(&mut W) -> R,
) -> R {
    let mut block = [0u8; N];
    let mut wrapper = W::wrap(block.as_mut_ptr() as usize, size);
    let result = callback(&mut wrapper);
    wrapper.mark_freed();
    std::hint::black_box(&mut block);
    result
}

/// The default [`StackWrapper`]: address, size and liveness of a block, with
/// checked raw access.
#[derive(Debug, PartialEq, Eq)]
pub struct StackBuffer {
    address: usize,
    size: usize,
    freed: bool,
}

impl StackWrapper for StackBuffer {
    fn wrap(address: usize, size: usize) -> Self {
        Self {
            address,
            size,
            freed: false,
        }
    }

    fn mark_freed(&mut self) {
        self.freed = true;
    }
}

impl StackBuffer {
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Set once [`StackWrapper::mark_freed`] has run. Wrappers handed out by
    /// [`run_stack_callback`] are only marked after the callback returns, so
    /// the flag matters for buffers built with [`StackWrapper::wrap`] directly
    /// and kept past their block.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// Address `offset` bytes into the block.
    pub fn offset(&self, offset: usize) -> Result<usize, RuntimeError> {
        self.check(offset, 0)?;
        Ok(self.address + offset)
    }

    /// Stack memory is released by returning from the callback, never
    /// explicitly.
    pub fn free(&mut self) -> Result<(), RuntimeError> {
        Err(RuntimeError::StackFree)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), RuntimeError> {
        if self.freed {
            return Err(RuntimeError::BufferFreed(self.address));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RuntimeError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Copy `out.len()` bytes starting at `offset` out of the block.
    ///
    /// # Safety
    ///
    /// The block must still be live: this buffer must be the one passed to
    /// the running callback, not a value moved out of it.
    pub unsafe fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), RuntimeError> {
        self.check(offset, out.len())?;
        // SAFETY: range checked against the block; liveness is the caller's
        // contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.address + offset) as *const u8,
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Copy `data` into the block at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`StackBuffer::read_bytes`].
    pub unsafe fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        self.check(offset, data.len())?;
        // SAFETY: range checked against the block; liveness is the caller's
        // contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.address + offset) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_zeroed_and_writable() {
        let read = run_stack_callback::<StackBuffer, _>(100, |buf| {
            assert_eq!(buf.size(), 100);
            assert!(!buf.is_freed());
            let mut zeros = [0xffu8; 100];
            // SAFETY: buf is the live block passed to this callback.
            unsafe { buf.read_bytes(0, &mut zeros).unwrap() };
            assert!(zeros.iter().all(|b| *b == 0));

            // SAFETY: as above.
            unsafe { buf.write_bytes(96, b"tail").unwrap() };
            let mut out = [0u8; 4];
            // SAFETY: as above.
            unsafe { buf.read_bytes(96, &mut out).unwrap() };
            out
        })
        .unwrap();
        assert_eq!(&read, b"tail");
    }

    #[test]
    fn accesses_are_bounds_checked() {
        run_stack_callback::<StackBuffer, _>(8, |buf| {
            // SAFETY: buf is the live block passed to this callback.
            let err = unsafe { buf.write_bytes(6, b"abc") }.unwrap_err();
            assert_eq!(
                err,
                RuntimeError::OutOfBounds {
                    offset: 6,
                    len: 3,
                    size: 8
                }
            );
            assert_eq!(buf.offset(8).unwrap(), buf.address() + 8);
            assert!(buf.offset(9).is_err());
            assert_eq!(buf.free(), Err(RuntimeError::StackFree));
        })
        .unwrap();
    }

    #[test]
    fn freed_buffer_refuses_every_access() {
        let mut block = [0u8; 16];
        let mut buf = StackBuffer::wrap(block.as_mut_ptr() as usize, block.len());
        assert_eq!(buf.offset(4), Ok(buf.address() + 4));

        buf.mark_freed();
        assert!(buf.is_freed());
        let freed = Err(RuntimeError::BufferFreed(buf.address()));
        assert_eq!(buf.offset(4).map(|_| ()), freed);
        let mut out = [0xaau8; 2];
        // SAFETY: the freed check refuses before any memory is touched.
        assert_eq!(unsafe { buf.read_bytes(0, &mut out) }, freed);
        // SAFETY: as above.
        assert_eq!(unsafe { buf.write_bytes(0, b"xy") }, freed);
        assert_eq!(out, [0xaa, 0xaa]);
        assert_eq!(block, [0u8; 16]);
    }

    #[test]
    fn oversized_requests_fail_without_calling_back() {
        let mut called = false;
        let err = run_stack_callback::<StackBuffer, _>(MAX_STACK_ALLOCATION + 1, |_| {
            called = true;
        })
        .unwrap_err();
        assert!(!called);
        assert_eq!(
            err,
            RuntimeError::StackAllocation {
                requested: MAX_STACK_ALLOCATION + 1,
                limit: MAX_STACK_ALLOCATION
            }
        );
    }

    #[test]
    fn wrapper_is_marked_freed_after_callback() {
        use std::sync::atomic::{AtomicBool, Ordering};

        static FREED: AtomicBool = AtomicBool::new(false);

        struct Recorder {
            size: usize,
        }
        impl StackWrapper for Recorder {
            fn wrap(_address: usize, size: usize) -> Self {
                Self { size }
            }
            fn mark_freed(&mut self) {
                FREED.store(true, Ordering::SeqCst);
            }
        }

        let mut seen = None;
        run_stack_callback::<Recorder, _>(4096, |rec| {
            assert!(!FREED.load(Ordering::SeqCst));
            seen = Some(rec.size);
        })
        .unwrap();
        assert_eq!(seen, Some(4096));
        assert!(FREED.load(Ordering::SeqCst));

        let mut observed = None;
        run_stack_callback::<StackBuffer, _>(0, |buf| {
            observed = Some((buf.address(), buf.size()));
        })
        .unwrap();
        assert!(matches!(observed, Some((addr, 0)) if addr != 0));
    }
}
