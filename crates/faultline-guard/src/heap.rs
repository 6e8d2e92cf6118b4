//! Heap blocks from the C allocator.
//!
//! A [`HeapBuffer`] owns one block obtained with `malloc`, `calloc` or
//! `realloc` and remembers whether it has been freed. After [`HeapBuffer::free`]
//! every access, resize and further free is refused with
//! [`RuntimeError::FreedMemory`] instead of reaching the allocator. A block
//! still live when its buffer drops is freed then.

use std::ffi::c_void;

use faultline_core::RuntimeError;

/// An owned `malloc`-family block with checked access.
#[derive(Debug, PartialEq, Eq)]
pub struct HeapBuffer {
    address: usize,
    size: usize,
    freed: bool,
}

impl HeapBuffer {
    /// `malloc(size)`. Contents are unspecified until written.
    pub fn allocate(size: usize) -> Result<Self, RuntimeError> {
        // SAFETY: malloc takes any size; a null result is checked below.
        let ptr = unsafe { libc::malloc(size.max(1)) };
        Self::from_raw(ptr, size)
    }

    /// `calloc(count, elem_size)`: `count * elem_size` zeroed bytes.
    pub fn zeroed(count: usize, elem_size: usize) -> Result<Self, RuntimeError> {
        let size = count.checked_mul(elem_size).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "{count} elements of {elem_size} bytes overflow the address space"
            ))
        })?;
        // SAFETY: as in allocate.
        let ptr = unsafe { libc::calloc(count.max(1), elem_size.max(1)) };
        Self::from_raw(ptr, size)
    }

    fn from_raw(ptr: *mut c_void, size: usize) -> Result<Self, RuntimeError> {
        if ptr.is_null() {
            return Err(RuntimeError::Allocation(size));
        }
        Ok(Self {
            address: ptr as usize,
            size,
            freed: false,
        })
    }

    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// `realloc` to `size` bytes. The block may move; bytes up to the smaller
    /// of the two sizes are kept. On failure the current block is untouched.
    pub fn resize(&mut self, size: usize) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        // SAFETY: address came from the C allocator and has not been freed.
        let ptr = unsafe { libc::realloc(self.address as *mut c_void, size.max(1)) };
        if ptr.is_null() {
            return Err(RuntimeError::Allocation(size));
        }
        self.address = ptr as usize;
        self.size = size;
        Ok(())
    }

    /// Return the block to the allocator. A second call is refused.
    pub fn free(&mut self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        // SAFETY: address came from the C allocator and has not been freed.
        unsafe { libc::free(self.address as *mut c_void) };
        self.freed = true;
        Ok(())
    }

    /// Address `offset` bytes into the block.
    pub fn offset(&self, offset: usize) -> Result<usize, RuntimeError> {
        self.check(offset, 0)?;
        Ok(self.address + offset)
    }

    /// Copy `out.len()` bytes starting at `offset` out of the block.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), RuntimeError> {
        self.check(offset, out.len())?;
        // SAFETY: the block is live and owned by self; range checked.
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
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        self.check(offset, data.len())?;
        // SAFETY: as in read_bytes; &mut self rules out concurrent readers.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.address + offset) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), RuntimeError> {
        if self.freed {
            return Err(RuntimeError::FreedMemory(self.address));
        }
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RuntimeError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        if !self.freed {
            // SAFETY: live block owned by self.
            unsafe { libc::free(self.address as *mut c_void) };
        }
    }
}
