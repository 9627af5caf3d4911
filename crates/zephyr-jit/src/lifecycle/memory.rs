//! Executable memory regions
//!
//! Each compiled function gets its own page-aligned mapping with PROT_NONE
//! guard pages on both sides, so stale pointers into a freed neighbourhood
//! fault instead of executing garbage. Commit follows W^X: map RW, copy,
//! flip to R+X. Later patches flip to RW and back; invalidation seals the
//! region read-only with execution disabled.

use std::io;
use std::ptr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap failed: {0}")]
    Map(io::Error),
    #[error("mprotect failed: {0}")]
    Protect(io::Error),
    #[error("offset {offset:#x} outside region of {len:#x} bytes")]
    OutOfRegion { offset: usize, len: usize },
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 {
        4096
    } else {
        v as usize
    }
}

/// A guard-paged executable mapping holding one compiled region.
pub struct ExecRegion {
    /// Mapping base, including the leading guard page
    base: *mut u8,
    /// First code byte
    code: *mut u8,
    /// Committed code length in bytes (unpadded)
    len: usize,
    /// Code pages length (page multiple)
    code_pages: usize,
    /// Full mapping length
    total: usize,
}

// The raw pointers refer to a private anonymous mapping owned by this
// struct alone.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}

impl ExecRegion {
    /// Map a fresh region, copy `code` in, and make it executable.
    pub fn commit(code: &[u8]) -> Result<Self, MemoryError> {
        let page = page_size();
        let code_pages = code.len().div_ceil(page).max(1) * page;
        let total = code_pages + 2 * page;

        // SAFETY: anonymous private mapping, no address hint
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::Map(io::Error::last_os_error()));
        }
        let region = Self {
            base: base as *mut u8,
            // SAFETY: the mapping is total bytes long, page < total
            code: unsafe { (base as *mut u8).add(page) },
            len: code.len(),
            code_pages,
            total,
        };

        region.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        // SAFETY: destination is a fresh RW mapping of at least code.len()
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), region.code, code.len());
        }
        region.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        Ok(region)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.code
    }

    /// Committed code length (excluding page padding and guards).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The committed bytes. Valid for the lifetime of the region in every
    /// state but Freed, which only `Drop` reaches.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: code..code+len stays mapped readable until Drop
        unsafe { std::slice::from_raw_parts(self.code, self.len) }
    }

    /// Address range covered by the code pages.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.code as usize;
        addr >= start && addr < start + self.len
    }

    pub fn read_word(&self, offset: usize) -> Result<u32, MemoryError> {
        self.check(offset)?;
        // SAFETY: offset+4 <= len, region readable
        Ok(unsafe { (self.code.add(offset) as *const u32).read_unaligned() })
    }

    /// Patch one word: flip to RW, write, restore R+X.
    pub fn write_word(&self, offset: usize, word: u32) -> Result<(), MemoryError> {
        self.check(offset)?;
        self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        // SAFETY: offset+4 <= len, region now writable
        unsafe { (self.code.add(offset) as *mut u32).write_unaligned(word) };
        self.protect(libc::PROT_READ | libc::PROT_EXEC)
    }

    /// Disable execution permanently; the bytes stay readable for
    /// diagnostics until the region is unmapped.
    pub fn seal_readonly(&self) -> Result<(), MemoryError> {
        self.protect(libc::PROT_READ)
    }

    fn check(&self, offset: usize) -> Result<(), MemoryError> {
        if offset + 4 > self.len {
            return Err(MemoryError::OutOfRegion {
                offset,
                len: self.len,
            });
        }
        Ok(())
    }

    fn protect(&self, prot: i32) -> Result<(), MemoryError> {
        // SAFETY: code..code+code_pages is page-aligned and inside the mapping
        let rc = unsafe { libc::mprotect(self.code as *mut libc::c_void, self.code_pages, prot) };
        if rc != 0 {
            return Err(MemoryError::Protect(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        // SAFETY: base/total describe the mapping created in commit
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
