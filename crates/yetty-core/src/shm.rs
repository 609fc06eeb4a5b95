//! Named, growable POSIX shared memory.
//!
//! A [`SharedMemoryRegion`] is the physical backing store for card buffers
//! when streaming is enabled: the terminal creates it as owner, streaming
//! clients open it by name and write into card allocations directly.
//!
//! The first [`REGION_HEADER_SIZE`] bytes of every region are reserved for
//! the region header. Offset 0 holds a monotonically increasing generation
//! counter that the owner bumps on every [`grow`](SharedMemoryRegion::grow);
//! clients compare it against their last observed value and
//! [`remap`](SharedMemoryRegion::remap) when it advanced, because growth
//! invalidates their mapping.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Bytes reserved at the start of every region for the region header.
pub const REGION_HEADER_SIZE: usize = 64;

/// Cross-process shared memory region.
///
/// Owner (`create`) and clients (`open`) map the same physical pages. Only
/// the owner may grow; the owner unlinks the object on drop.
pub struct SharedMemoryRegion {
    name: String,
    shm_path: CString,
    fd: RawFd,
    mapping: *mut u8,
    size: usize,
    owner: bool,
    poisoned: bool,
}

impl SharedMemoryRegion {
    /// Create a new region (terminal side). Zero-filled.
    ///
    /// A stale object with the same name is unlinked and the creation retried
    /// once. If the retry still hits `EEXIST` a live owner holds the name and
    /// [`Error::AlreadyExists`] is returned; any other failure is
    /// [`Error::Os`].
    pub fn create(name: &str, initial_size: usize) -> Result<Self> {
        if initial_size <= REGION_HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "region size {initial_size} does not fit the region header"
            )));
        }
        let shm_path = shm_path(name)?;

        let mut fd = unsafe {
            libc::shm_open(
                shm_path.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            // Stale object from a dead process; reclaim the name.
            warn!(name, "stale shm object, unlinking and recreating");
            unsafe { libc::shm_unlink(shm_path.as_ptr()) };
            fd = unsafe {
                libc::shm_open(
                    shm_path.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                    0o600,
                )
            };
            if fd < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
                // Recreated between the unlink and the retry: a live owner
                // is racing us for the name.
                return Err(Error::AlreadyExists(format!("shm region '{name}'")));
            }
        }
        if fd < 0 {
            return Err(Error::os("shm_open"));
        }

        if unsafe { libc::ftruncate(fd, initial_size as libc::off_t) } < 0 {
            let err = Error::os("ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(shm_path.as_ptr());
            }
            return Err(err);
        }

        let mapping = match map(fd, initial_size) {
            Ok(m) => m,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(shm_path.as_ptr());
                }
                return Err(err);
            }
        };

        // ftruncate on a fresh object already zero-fills; make it explicit so
        // reclaimed stale objects start clean too.
        unsafe { std::ptr::write_bytes(mapping, 0, initial_size) };

        info!(name, size = initial_size, "created shm region");
        Ok(Self {
            name: name.to_string(),
            shm_path,
            fd,
            mapping,
            size: initial_size,
            owner: true,
            poisoned: false,
        })
    }

    /// Open an existing region (client side), mapped at its current size.
    pub fn open(name: &str) -> Result<Self> {
        let shm_path = shm_path(name)?;

        let fd = unsafe { libc::shm_open(shm_path.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
                return Err(Error::NotFound(format!("shm region '{name}'")));
            }
            return Err(Error::os("shm_open"));
        }

        let size = match object_size(fd) {
            Ok(s) => s,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let mapping = match map(fd, size) {
            Ok(m) => m,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        debug!(name, size, "opened shm region");
        Ok(Self {
            name: name.to_string(),
            shm_path,
            fd,
            mapping,
            size,
            owner: false,
            poisoned: false,
        })
    }

    /// Grow the region. Owner only; `new_size` must exceed the current size.
    ///
    /// The old mapping is invalidated: clients must observe the generation
    /// bump and [`remap`](Self::remap). The new tail is zero-filled.
    pub fn grow(&mut self, new_size: usize) -> Result<()> {
        self.check_poisoned()?;
        if !self.owner {
            return Err(Error::InvalidArgument(
                "only the owner may grow a shm region".into(),
            ));
        }
        if new_size <= self.size {
            return Err(Error::InvalidArgument(format!(
                "grow to {new_size} <= current size {}",
                self.size
            )));
        }

        let old_size = self.size;
        unsafe { libc::munmap(self.mapping.cast(), old_size) };

        if unsafe { libc::ftruncate(self.fd, new_size as libc::off_t) } < 0 {
            let err = Error::os("ftruncate");
            // Try to restore the old mapping so the owner can keep rendering.
            match map(self.fd, old_size) {
                Ok(m) => self.mapping = m,
                Err(remap_err) => {
                    warn!(name = %self.name, %remap_err, "remap after failed grow also failed; region poisoned");
                    self.mapping = std::ptr::null_mut();
                    self.poisoned = true;
                }
            }
            return Err(err);
        }

        match map(self.fd, new_size) {
            Ok(m) => self.mapping = m,
            Err(err) => {
                self.mapping = std::ptr::null_mut();
                self.poisoned = true;
                return Err(err);
            }
        }

        unsafe { std::ptr::write_bytes(self.mapping.add(old_size), 0, new_size - old_size) };
        self.size = new_size;
        let generation = self.generation_atomic().fetch_add(1, Ordering::AcqRel) + 1;
        info!(name = %self.name, old_size, new_size, generation, "grew shm region");
        Ok(())
    }

    /// Re-read the object size and remap (client side, after a growth).
    /// No-op when the size is unchanged.
    pub fn remap(&mut self) -> Result<()> {
        self.check_poisoned()?;
        let new_size = object_size(self.fd)?;
        if new_size == self.size && !self.mapping.is_null() {
            return Ok(());
        }

        if !self.mapping.is_null() {
            unsafe { libc::munmap(self.mapping.cast(), self.size) };
        }
        match map(self.fd, new_size) {
            Ok(m) => self.mapping = m,
            Err(err) => {
                self.mapping = std::ptr::null_mut();
                self.poisoned = true;
                return Err(err);
            }
        }
        debug!(name = %self.name, new_size, "remapped shm region");
        self.size = new_size;
        Ok(())
    }

    /// Base pointer of the mapping.
    pub fn data(&self) -> *mut u8 {
        self.mapping
    }

    /// Current mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name the region was created/opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Current generation counter (bumped on every owner-side grow).
    pub fn generation(&self) -> u64 {
        self.generation_atomic().load(Ordering::Acquire)
    }

    fn generation_atomic(&self) -> &AtomicU64 {
        debug_assert!(!self.mapping.is_null());
        // Offset 0 of the region header; the mapping is page-aligned.
        unsafe { &*(self.mapping as *const AtomicU64) }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::Unavailable(format!(
                "shm region '{}' is poisoned",
                self.name
            )));
        }
        Ok(())
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if !self.mapping.is_null() {
            unsafe { libc::munmap(self.mapping.cast(), self.size) };
        }
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
        if self.owner {
            unsafe { libc::shm_unlink(self.shm_path.as_ptr()) };
            debug!(name = %self.name, "unlinked shm region");
        }
    }
}

impl std::fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// POSIX shm names must be `/`-prefixed with no interior slashes.
fn shm_path(name: &str) -> Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidArgument(format!("invalid shm name '{name}'")));
    }
    CString::new(format!("/{name}"))
        .map_err(|_| Error::InvalidArgument(format!("invalid shm name '{name}'")))
}

fn object_size(fd: RawFd) -> Result<usize> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(Error::os("fstat"));
    }
    Ok(st.st_size as usize)
}

fn map(fd: RawFd, size: usize) -> Result<*mut u8> {
    let mapping = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if mapping == libc::MAP_FAILED {
        return Err(Error::os("mmap"));
    }
    Ok(mapping.cast())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "yetty-test-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique_name("share");
        let owner = SharedMemoryRegion::create(&name, 4096).unwrap();
        let client = SharedMemoryRegion::open(&name).unwrap();

        assert!(owner.is_owner());
        assert!(!client.is_owner());
        assert_eq!(client.size(), 4096);

        unsafe {
            *owner.data().add(REGION_HEADER_SIZE) = 0xAB;
        }
        let seen = unsafe { *client.data().add(REGION_HEADER_SIZE) };
        assert_eq!(seen, 0xAB);
    }

    #[test]
    fn open_missing_is_not_found() {
        let err = SharedMemoryRegion::open(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn grow_bumps_generation_and_zero_fills() {
        let name = unique_name("grow");
        let mut owner = SharedMemoryRegion::create(&name, 4096).unwrap();
        let mut client = SharedMemoryRegion::open(&name).unwrap();
        let before = client.generation();

        owner.grow(16384).unwrap();
        assert_eq!(owner.size(), 16384);

        // Generation is visible through the client's (stale) mapping header
        // page; after remap the full new size is accessible.
        assert_eq!(client.generation(), before + 1);
        client.remap().unwrap();
        assert_eq!(client.size(), 16384);
        let tail = unsafe { *client.data().add(16384 - 1) };
        assert_eq!(tail, 0);
    }

    #[test]
    fn grow_to_same_size_is_invalid() {
        let name = unique_name("same");
        let mut owner = SharedMemoryRegion::create(&name, 8192).unwrap();
        assert!(matches!(
            owner.grow(8192),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(owner.grow(4096), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn client_cannot_grow() {
        let name = unique_name("client-grow");
        let _owner = SharedMemoryRegion::create(&name, 4096).unwrap();
        let mut client = SharedMemoryRegion::open(&name).unwrap();
        assert!(matches!(
            client.grow(8192),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn owner_drop_unlinks() {
        let name = unique_name("unlink");
        {
            let _owner = SharedMemoryRegion::create(&name, 4096).unwrap();
        }
        assert!(matches!(
            SharedMemoryRegion::open(&name),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn stale_object_is_reclaimed() {
        let name = unique_name("stale");
        let first = SharedMemoryRegion::create(&name, 4096).unwrap();
        // Simulate a crashed owner: leak the fd/mapping, skip the unlink.
        std::mem::forget(first);
        let second = SharedMemoryRegion::create(&name, 4096).unwrap();
        assert_eq!(second.size(), 4096);
    }
}
