//! Per-allocation seqlock header for shared-memory streaming.
//!
//! Every allocation in the shared region is framed by a 16-byte
//! [`AllocationHeader`] followed by its payload. The header implements a
//! one-writer / one-reader seqlock between the streaming client (writer) and
//! the terminal's GPU flush (reader):
//!
//! ```text
//! writer:  wait while uploading == 1;  seq += 1 (odd);  write payload;  seq += 1 (even)
//! reader:  uploading = 1;  wait while seq is odd;  copy payload;  uploading = 0
//! ```
//!
//! Neither side can observe a torn payload and neither blocks the other
//! beyond one in-flight transition. The bracketing is enforced by RAII:
//! [`SeqWriteGuard`] closes the odd sequence on drop, [`SeqReadGuard`] clears
//! the uploading flag on drop. The read side spins with a bound so a crashed
//! writer that left `seq` odd costs one frame of stale data, not a stalled
//! renderer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Size of [`AllocationHeader`]; payload starts this many bytes after the
/// allocation offset.
pub const ALLOCATION_HEADER_SIZE: usize = 16;

/// Default bound for the read-side spin before the upload is abandoned for
/// this frame.
pub const READ_SPIN_TIMEOUT: Duration = Duration::from_millis(1);

/// 16-byte seqlock header at the start of every shared-memory allocation.
#[repr(C)]
pub struct AllocationHeader {
    /// Odd while a write is in progress, even when quiescent.
    seq: AtomicU32,
    /// 1 while the terminal is copying the payload for GPU upload.
    uploading: AtomicU32,
    /// Payload bytes following this header.
    size: u32,
    _pad: u32,
}

// 32-bit atomics are lock-free on every supported target; the layout must
// match the wire header exactly.
const _: () = assert!(std::mem::size_of::<AllocationHeader>() == ALLOCATION_HEADER_SIZE);

impl AllocationHeader {
    /// Reinterpret `ptr` as a header.
    ///
    /// # Safety
    /// `ptr` must point at a 16-byte-aligned, initialized allocation header
    /// inside a live mapping, valid for the returned lifetime.
    pub unsafe fn from_raw<'a>(ptr: *mut u8) -> &'a AllocationHeader {
        debug_assert!(ptr as usize % std::mem::align_of::<AllocationHeader>() == 0);
        &*(ptr as *const AllocationHeader)
    }

    /// Initialize a fresh header in place with a quiescent sequence.
    ///
    /// # Safety
    /// `ptr` must be valid for 16 writable bytes and not concurrently
    /// accessed through another header view.
    pub unsafe fn init(ptr: *mut u8, size: u32) {
        std::ptr::write(
            ptr as *mut AllocationHeader,
            AllocationHeader {
                seq: AtomicU32::new(0),
                uploading: AtomicU32::new(0),
                size,
                _pad: 0,
            },
        );
    }

    /// Payload bytes following the header.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether a write is currently in progress.
    pub fn write_in_progress(&self) -> bool {
        self.seq.load(Ordering::Acquire) & 1 == 1
    }

    /// Client side: begin a payload write. Spins while the terminal is
    /// uploading, then marks the sequence odd.
    pub fn begin_write(&self) -> SeqWriteGuard<'_> {
        let mut spins = 0u32;
        while self.uploading.load(Ordering::Acquire) == 1 {
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        self.seq.fetch_add(1, Ordering::Release);
        SeqWriteGuard { header: self }
    }

    /// Terminal side: begin a payload read for GPU upload. Sets the
    /// uploading flag and waits out an in-progress write, bounded by
    /// `timeout`. Returns `None` on timeout (skip this allocation for the
    /// frame).
    pub fn begin_read(&self, timeout: Duration) -> Option<SeqReadGuard<'_>> {
        self.uploading.store(1, Ordering::Release);
        let deadline = Instant::now() + timeout;
        while self.seq.load(Ordering::Acquire) & 1 == 1 {
            if Instant::now() >= deadline {
                self.uploading.store(0, Ordering::Release);
                return None;
            }
            std::hint::spin_loop();
        }
        Some(SeqReadGuard { header: self })
    }

    fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self as *const AllocationHeader as *mut u8).add(ALLOCATION_HEADER_SIZE) }
    }
}

/// Write bracket: created by [`AllocationHeader::begin_write`], closes the
/// odd sequence on drop.
pub struct SeqWriteGuard<'a> {
    header: &'a AllocationHeader,
}

impl SeqWriteGuard<'_> {
    /// Mutable view of the payload. Exclusive by protocol: there is one
    /// writer per allocation and the terminal never writes payloads.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.header.payload_ptr(), self.header.size as usize)
        }
    }
}

impl Drop for SeqWriteGuard<'_> {
    fn drop(&mut self) {
        self.header.seq.fetch_add(1, Ordering::Release);
    }
}

/// Read bracket: created by [`AllocationHeader::begin_read`], clears the
/// uploading flag on drop.
pub struct SeqReadGuard<'a> {
    header: &'a AllocationHeader,
}

impl SeqReadGuard<'_> {
    /// Immutable view of the payload, stable for the guard's lifetime (the
    /// uploading flag holds the writer off).
    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.header.payload_ptr(), self.header.size as usize)
        }
    }
}

impl Drop for SeqReadGuard<'_> {
    fn drop(&mut self) {
        self.header.uploading.store(0, Ordering::Release);
    }
}
