use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use enum_primitive::FromPrimitive;
use libc;
use nix::errno::errno;

use error::{Error, Result};

bitflags! {
    pub struct MemFlags: u32 {
        const READABLE = 1;
        const WRITABLE = 2;
        const SEALED = 4;
        const READWRITE = Self::READABLE.bits | Self::WRITABLE.bits;
    }
}

/// A page-granular window over an fd: `offset` is rounded down to the
/// page, `size` rounded up, and `start` remembers where the caller's
/// bytes begin inside the mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapRange {
    pub start: usize,
    pub offset: u64,
    pub size: usize,
}

impl MapRange {
    pub fn new(offset: u32, size: u32, page: usize) -> MapRange {
        let off = offset as usize;
        let start = off % page;
        let rounded = start + size as usize;
        let size = (rounded + page - 1) / page * page;
        MapRange {
            start,
            offset: (off - start) as u64,
            size,
        }
    }
}

enum_from_primitive! {
#[repr(i32)]
#[derive(Debug, Fail)]
pub enum MapError {
    #[fail(display = "fd is not open for the requested access, or the file is append-only")]
    Access = libc::EACCES,

    #[fail(display = "fd is not a valid file descriptor")]
    FdBad = libc::EBADF,

    #[fail(display = "bad addr, length, or offset (too large or not page aligned), or length was 0")]
    InvalidArgs = libc::EINVAL,

    #[fail(display = "the underlying filesystem does not support memory mapping")]
    NoMapSupport = libc::ENODEV,

    #[fail(display = "no memory available, or the process mapping limit was exceeded")]
    NoMemory = libc::ENOMEM,

    #[fail(display = "the file has been locked, or too much memory has been locked")]
    TooMuchLocking = libc::EAGAIN,

    #[fail(display = "the per-process or system-wide open file limit has been reached")]
    TooManyOpenFiles = libc::ENFILE,

    #[fail(display = "length plus offset would overflow the architecture page count")]
    Overflow = libc::EOVERFLOW,

    #[fail(display = "the operation was prevented by a file seal")]
    Sealed = libc::EPERM,
}
}

impl From<MapError> for Error {
    fn from(inner: MapError) -> Error {
        Error::NoMem {
            what: format!("mmap failed: {}", inner),
        }
    }
}

/// An owned `MAP_SHARED` mapping; unmapped on drop, failures to unmap are
/// logged and swallowed.
#[derive(Debug)]
pub struct Mapping {
    ptr: *mut u8,
    range: MapRange,
}

unsafe impl Send for Mapping {}

impl Mapping {
    pub fn new(fd: RawFd, offset: u32, size: u32, prot: libc::c_int, page: usize) -> Result<Mapping> {
        let range = MapRange::new(offset, size, page);

        // NOTE(unsafe) mmap validates the fd and range for us; we only
        // ever hand out pointers inside [ptr, ptr + range.size).
        let ptr = unsafe {
            libc::mmap(
                ::std::ptr::null_mut(),
                range.size,
                prot,
                libc::MAP_SHARED,
                fd,
                range.offset as libc::off_t,
            )
        };

        if ptr == libc::MAP_FAILED {
            let e = errno();
            return Err(match MapError::from_i32(e) {
                Some(me) => Error::from(me),
                None => Error::NoMem {
                    what: format!("mmap failed: errno {}", e),
                },
            });
        }

        Ok(Mapping {
            ptr: ptr as *mut u8,
            range,
        })
    }

    /// Base of the mapping (page aligned).
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// First byte the caller asked for.
    pub fn user_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(self.range.start) }
    }

    pub fn range(&self) -> &MapRange {
        &self.range
    }

    /// Lock the mapping into RAM. Best effort; the caller only logs.
    pub fn lock(&self) -> ::std::result::Result<(), i32> {
        // NOTE(unsafe) the range is exactly what we mapped above
        match unsafe { libc::mlock(self.ptr as *const libc::c_void, self.range.size) } {
            0 => Ok(()),
            _ => Err(errno()),
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // NOTE(unsafe) ptr/size came from a successful mmap
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.range.size) } < 0 {
            warn!("failed to unmap {:p} ({} bytes): errno {}", self.ptr, self.range.size, errno());
        }
    }
}

#[derive(Debug)]
pub struct MemoryRegion {
    pub id: u32,
    pub fd: RawFd,
    pub flags: MemFlags,
    refcount: u32,
    mapping: Option<Mapping>,
}

impl MemoryRegion {
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

/// The per-session table of server-announced regions, keyed by the
/// server-assigned id. Regions map lazily on first use and are
/// reference counted by the buffers that pin them; several ids may
/// share one fd, which is closed only when the last of them is cleared.
/// Lives on the control thread; the data thread only ever reads through
/// pointers installed before `Start` was acknowledged.
#[derive(Debug)]
pub struct MemRegistry {
    regions: BTreeMap<u32, MemoryRegion>,
    page: usize,
}

impl MemRegistry {
    pub fn new(page: usize) -> MemRegistry {
        MemRegistry {
            regions: BTreeMap::new(),
            page,
        }
    }

    /// Record a region announced by the server. A duplicate id is warned
    /// about and ignored; the existing entry stays authoritative.
    pub fn add(&mut self, id: u32, fd: RawFd, flags: MemFlags) {
        if self.regions.contains_key(&id) {
            warn!("duplicate mem {}, fd {}, flags {:?}", id, fd, flags);
            return;
        }
        debug!("add mem {}, fd {}, flags {:?}", id, fd, flags);
        self.regions.insert(
            id,
            MemoryRegion {
                id,
                fd,
                flags,
                refcount: 0,
                mapping: None,
            },
        );
    }

    pub fn find(&self, id: u32) -> Option<&MemoryRegion> {
        self.regions.get(&id)
    }

    pub fn page(&self) -> usize {
        self.page
    }

    /// Pin a region on behalf of a buffer entry; returns the fd the
    /// caller stores in its rebuilt descriptor.
    pub fn pin(&mut self, id: u32) -> Result<RawFd> {
        let r = self
            .regions
            .get_mut(&id)
            .ok_or(Error::NotFound { what: "mem", id })?;
        r.refcount += 1;
        Ok(r.fd)
    }

    /// Drop one pin; the region is cleared when the last pin goes away.
    pub fn unpin(&mut self, id: u32) {
        let cleared = match self.regions.get_mut(&id) {
            Some(r) => {
                r.refcount -= 1;
                r.refcount == 0
            }
            None => {
                warn!("unpin of unknown mem {}", id);
                false
            }
        };
        if cleared {
            self.clear(id);
        }
    }

    /// Map (or return the existing mapping of) `[offset, offset+size)`
    /// inside a region. Asking for a different window while one is live
    /// is a caller bug.
    pub fn map(&mut self, id: u32, offset: u32, size: u32) -> Result<*mut u8> {
        let page = self.page;
        let r = self
            .regions
            .get_mut(&id)
            .ok_or(Error::NotFound { what: "mem", id })?;

        if let Some(ref m) = r.mapping {
            let want = MapRange::new(offset, size, page);
            assert_eq!(
                *m.range(),
                want,
                "conflicting map request for mem {}",
                id
            );
            return Ok(m.user_ptr());
        }

        let m = Mapping::new(r.fd, offset, size, libc::PROT_READ | libc::PROT_WRITE, page)?;
        let ptr = m.user_ptr();
        r.mapping = Some(m);
        Ok(ptr)
    }

    /// Drop a region's mapping if it has one. Idempotent.
    pub fn unmap(&mut self, id: u32) {
        if let Some(r) = self.regions.get_mut(&id) {
            r.mapping = None;
        }
    }

    /// Remove a region: unmap it, and close the fd unless some other
    /// region in the table still refers to the same descriptor.
    pub fn clear(&mut self, id: u32) {
        let region = match self.regions.remove(&id) {
            Some(r) => r,
            None => return,
        };
        let mut region = region;
        region.mapping = None;

        let shared = self.regions.values().any(|r| r.fd == region.fd);
        if !shared {
            debug!("clear mem {}: closing fd {}", id, region.fd);
            // NOTE(unsafe) the fd was handed to us by the server with the
            // add_mem event and is ours to close
            if unsafe { libc::close(region.fd) } < 0 {
                warn!("close of mem fd {} failed: errno {}", region.fd, errno());
            }
        } else {
            debug!("clear mem {}: fd {} still shared", id, region.fd);
        }
    }

    pub fn clear_all(&mut self) {
        let ids: Vec<u32> = self.regions.keys().cloned().collect();
        for id in ids {
            self.clear(id);
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}
