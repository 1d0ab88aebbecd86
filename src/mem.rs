use gimli::{Endianity, RunTimeEndian};
use tracing::trace;

use crate::error::{Error, Result};

/// Page granularity used when snapshotting task memory.
pub const PAGE_SIZE: u64 = 4096;

/// A handle onto a target task's address space.
///
/// This is the only seam through which the unwinder touches foreign
/// memory. Implementations must either fill the whole buffer or fail;
/// partial reads are an error. The read path must be callable from the
/// context the embedder unwinds in (for signal handlers that means no
/// locks and no allocation in the implementation).
pub trait TaskMemory {
    /// Copy `buf.len()` bytes starting at `addr` in the target task.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
}

/// Apply a signed offset to an address, failing on wraparound instead of
/// silently producing a wrapped value.
pub fn apply_offset(addr: u64, offset: i64) -> Result<u64> {
    addr.checked_add_signed(offset)
        .ok_or(Error::Invalid("address offset overflows"))
}

/// Read a 32-bit value directly from task memory.
pub fn read_task_u32<T: TaskMemory>(
    task: &T,
    endian: RunTimeEndian,
    addr: u64,
    offset: i64,
) -> Result<u32> {
    let addr = apply_offset(addr, offset)?;
    let mut buf = [0u8; 4];
    task.read_bytes(addr, &mut buf)?;
    Ok(endian.read_u32(&buf))
}

/// Read a 64-bit value directly from task memory.
pub fn read_task_u64<T: TaskMemory>(
    task: &T,
    endian: RunTimeEndian,
    addr: u64,
    offset: i64,
) -> Result<u64> {
    let addr = apply_offset(addr, offset)?;
    let mut buf = [0u8; 8];
    task.read_bytes(addr, &mut buf)?;
    Ok(endian.read_u64(&buf))
}

/// A bounds-checked local snapshot of a range of task memory.
///
/// The requested range is rounded out to page boundaries and copied page
/// by page. When `require_full` is false the mapping may be *short*: if
/// the tail of the range is unreadable, the mapping covers the largest
/// readable prefix and reports the shorter length. Declared sizes in
/// binaries are not trustworthy (segment vmsize values larger than what
/// is resident have been observed in the wild), so consumers must
/// validate every access through [`Mapping::verify_range`] or
/// [`Mapping::remap`] rather than assuming the full range is present.
///
/// Dropping a mapping releases only local memory; the task is never
/// touched.
#[derive(Debug)]
pub struct Mapping {
    buf: Vec<u8>,
    /// Offset of `task_address` within `buf`.
    data_off: usize,
    task_address: u64,
    /// Usable length, possibly shorter than `requested`.
    length: u64,
    requested: u64,
}

impl Mapping {
    /// Snapshot `length` bytes at `task_addr` from `task`.
    ///
    /// With `require_full` set, any unreadable page in the range fails the
    /// mapping with [`Error::Internal`]. Without it, the mapping stops at
    /// the first unreadable page and keeps the prefix; only a completely
    /// unreadable first page fails.
    pub fn new<T: TaskMemory>(
        task: &T,
        task_addr: u64,
        length: u64,
        require_full: bool,
    ) -> Result<Mapping> {
        if length == 0 {
            return Err(Error::Invalid("zero-length mapping requested"));
        }
        // Reject ranges that wrap the address space outright.
        task_addr
            .checked_add(length)
            .ok_or(Error::Invalid("mapping range wraps the address space"))?;

        let base = task_addr & !(PAGE_SIZE - 1);
        let head = task_addr - base;
        let total = length
            .checked_add(head)
            .and_then(|t| t.checked_add(PAGE_SIZE - 1))
            .ok_or(Error::Invalid("mapping range wraps the address space"))?
            & !(PAGE_SIZE - 1);

        // Copy page by page so that an attacker-declared length never
        // forces an allocation larger than what is actually readable.
        let mut buf = Vec::new();
        let mut page = [0u8; PAGE_SIZE as usize];
        let mut mapped = 0u64;
        while mapped < total {
            match task.read_bytes(base + mapped, &mut page) {
                Ok(()) => {
                    buf.extend_from_slice(&page);
                    mapped += PAGE_SIZE;
                }
                Err(_) if require_full => {
                    trace!(
                        addr = task_addr,
                        length,
                        mapped,
                        "full mapping required but a page was unreadable"
                    );
                    return Err(Error::Internal("requested pages are not fully readable"));
                }
                Err(_) => break,
            }
        }

        let avail = buf.len() as u64;
        if avail <= head {
            trace!(addr = task_addr, "no readable pages at mapping base");
            return Err(Error::Internal("no readable pages at mapping base"));
        }

        // Cap to the caller's requested length; the page rounding above
        // must not widen what consumers are allowed to read.
        let usable = core::cmp::min(length, avail - head);
        Ok(Mapping {
            buf,
            data_off: head as usize,
            task_address: task_addr,
            length: usable,
            requested: length,
        })
    }

    /// The base (target-relative) address of this mapping.
    pub fn base_address(&self) -> u64 {
        self.task_address
    }

    /// The usable length of this mapping, possibly shorter than requested.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The length that was originally requested.
    pub fn requested_length(&self) -> u64 {
        self.requested
    }

    /// True if the mapping could not cover the full requested range.
    pub fn is_short(&self) -> bool {
        self.length < self.requested
    }

    /// The usable bytes of the mapping, starting at [`base_address`].
    ///
    /// [`base_address`]: Mapping::base_address
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.data_off..self.data_off + self.length as usize]
    }

    /// Verify that `[address + offset, address + offset + length)` lies
    /// fully within the mapping. Overflow anywhere in the arithmetic is a
    /// validation failure, never a wrapped value.
    pub fn verify_range(&self, address: u64, offset: i64, length: u64) -> bool {
        let Some(start) = address.checked_add_signed(offset) else {
            return false;
        };
        let Some(end) = start.checked_add(length) else {
            return false;
        };
        start >= self.task_address && end <= self.task_address + self.length
    }

    /// Return a dereferenceable view of `length` bytes at the (target
    /// relative) `address + offset`, or fail if any part of the range is
    /// outside the mapping.
    pub fn remap(&self, address: u64, offset: i64, length: u64) -> Result<&[u8]> {
        if !self.verify_range(address, offset, length) {
            return Err(Error::Invalid("range outside mapped bounds"));
        }
        let start = (address.wrapping_add_signed(offset) - self.task_address) as usize
            + self.data_off;
        Ok(&self.buf[start..start + length as usize])
    }

    pub fn read_u8(&self, address: u64, offset: i64) -> Result<u8> {
        Ok(self.remap(address, offset, 1)?[0])
    }

    pub fn read_u16(&self, endian: RunTimeEndian, address: u64, offset: i64) -> Result<u16> {
        Ok(endian.read_u16(self.remap(address, offset, 2)?))
    }

    pub fn read_u32(&self, endian: RunTimeEndian, address: u64, offset: i64) -> Result<u32> {
        Ok(endian.read_u32(self.remap(address, offset, 4)?))
    }

    pub fn read_u64(&self, endian: RunTimeEndian, address: u64, offset: i64) -> Result<u64> {
        Ok(endian.read_u64(self.remap(address, offset, 8)?))
    }
}

/// A task modeled as a single in-memory region.
///
/// The region is served at page granularity, the way real task memory is:
/// bytes between the end of `data` and the end of its last page read as
/// zero, and everything outside those pages is unreadable. Mostly useful
/// for tests and for treating a buffer of bytes as an image source.
pub struct SliceMemory<'a> {
    base: u64,
    data: &'a [u8],
}

impl<'a> SliceMemory<'a> {
    pub fn new(base: u64, data: &'a [u8]) -> SliceMemory<'a> {
        SliceMemory { base, data }
    }

    fn page_start(&self) -> u64 {
        self.base & !(PAGE_SIZE - 1)
    }

    fn page_end(&self) -> u64 {
        (self.base + self.data.len() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }
}

impl TaskMemory for SliceMemory<'_> {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        let end = addr
            .checked_add(len)
            .ok_or(Error::Invalid("address offset overflows"))?;
        if addr < self.page_start() || end > self.page_end() {
            return Err(Error::Internal("address not readable in target"));
        }
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr + i as u64;
            *b = if a >= self.base && a - self.base < self.data.len() as u64 {
                self.data[(a - self.base) as usize]
            } else {
                0
            };
        }
        Ok(())
    }
}

/// A task handle onto another (or this) process, backed by
/// `process_vm_readv(2)`. The kernel validates every access, so reads of
/// unmapped remote addresses fail cleanly instead of faulting.
#[cfg(target_os = "linux")]
pub struct ProcessMemory {
    pid: nix::unistd::Pid,
}

#[cfg(target_os = "linux")]
impl ProcessMemory {
    pub fn new(pid: i32) -> ProcessMemory {
        ProcessMemory {
            pid: nix::unistd::Pid::from_raw(pid),
        }
    }

    /// A handle onto the current process's own address space.
    pub fn current() -> ProcessMemory {
        ProcessMemory {
            pid: nix::unistd::Pid::this(),
        }
    }
}

#[cfg(target_os = "linux")]
impl TaskMemory for ProcessMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        use nix::sys::uio::{process_vm_readv, RemoteIoVec};
        use std::io::IoSliceMut;

        let len = buf.len();
        let mut local = [IoSliceMut::new(buf)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        match process_vm_readv(self.pid, &mut local, &remote) {
            Ok(n) if n == len => Ok(()),
            Ok(_) => Err(Error::Internal("short read from target process")),
            Err(_) => Err(Error::Internal("target process memory not readable")),
        }
    }
}
