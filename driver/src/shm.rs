// Copyright 2024 Oxide Computer Company
//! Named memory regions shared between cooperating driver processes.
//!
//! One process is the primary: it creates every region and is the only one
//! that ever removes them.  Every other process is a secondary and attaches
//! to the regions by name, which requires that the primary got there first.
//!
//! Regions are POSIX shared memory objects mapped `MAP_SHARED`.  The raw
//! mapping never leaves this module except as typed views (atomics, or a
//! pointer handed to the command log, which owns the layout).
//!
//! The creating process holds an exclusive `flock` on every region it owns
//! until it drops the region.  A name whose lock can still be taken was
//! left behind by a primary that is gone, and only such a name is reclaimed.
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use slog::{debug, warn, Logger};

use crate::NvmeError;

/// How this process takes part in the shared state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Primary,
    Secondary,
    /// Primary if nobody has created the regions yet
    #[default]
    Auto,
}

/// The well known shared regions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionName {
    IoToken,
    ChecksumTable,
    CmdLogTable,
    GlobalConfig,
}

impl RegionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionName::IoToken => "driver_io_token",
            RegionName::ChecksumTable => "driver_crc32_table",
            RegionName::CmdLogTable => "driver_cmdlog_table",
            RegionName::GlobalConfig => "driver_global_config",
        }
    }

    /// Name of the shared memory object for a given instance prefix
    pub fn os_name(&self, prefix: &str) -> String {
        format!("/{}_{}", prefix, self.as_str())
    }
}

/// Bytes of shared memory the primary is still allowed to reserve
#[derive(Debug)]
pub struct ShmBudget {
    limit: u64,
    used: AtomicU64,
}

impl ShmBudget {
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(ShmBudget {
            limit,
            used: AtomicU64::new(0),
        })
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }

    fn try_take(&self, size: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(size)?;
                (next <= self.limit).then_some(next)
            })
            .is_ok()
    }

    fn give_back(&self, size: u64) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}

/// One mapped shared region
///
/// Dropping the region unmaps it; if this process created it, the name is
/// also removed so that a later primary starts from scratch.
#[derive(Debug)]
pub struct SharedRegion {
    region: RegionName,
    os_name: String,
    ptr: NonNull<libc::c_void>,
    len: usize,
    owner: Option<Owner>,
    log: Logger,
}

/// What the creating process holds on to for a region
struct Owner {
    budget: Arc<ShmBudget>,
    _lock: Flock<File>,
}

impl std::fmt::Debug for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Owner").field("budget", &self.budget).finish()
    }
}

// SAFETY: the mapping is plain shared memory.  Every typed view handed out
// is either atomic or owned by a structure that partitions access (one
// command log queue per queue pair).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn region_err(os_name: &str, e: Errno) -> NvmeError {
    match e {
        Errno::ENOENT => NvmeError::RegionNotFound(os_name.to_string()),
        _ => NvmeError::RegionIo {
            name: os_name.to_string(),
            reason: e.desc().to_string(),
        },
    }
}

fn map(
    os_name: &str,
    file: &File,
    len: usize,
) -> Result<NonNull<libc::c_void>, NvmeError> {
    let length = NonZeroUsize::new(len).ok_or_else(|| NvmeError::RegionIo {
        name: os_name.to_string(),
        reason: "zero sized region".to_string(),
    })?;

    // SAFETY: mapping a freshly opened shared memory object; the mapping is
    // owned by the SharedRegion and released in Drop.
    unsafe {
        mman::mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|e| match e {
        Errno::ENOMEM => NvmeError::RegionNoSpace {
            name: os_name.to_string(),
            size: len as u64,
        },
        e => region_err(os_name, e),
    })
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> Result<(), Errno> {
    use std::os::fd::AsRawFd;

    // Back the object with real pages now, so running out of shared memory
    // is an error here instead of SIGBUS on first touch.
    // SAFETY: plain syscall on an fd we own.
    let rc = unsafe {
        libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t)
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Errno::from_raw(rc))
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _len: u64) -> Result<(), Errno> {
    Ok(())
}

impl SharedRegion {
    /// Does the named region exist for this instance?
    pub fn exists(prefix: &str, region: RegionName) -> bool {
        let os_name = region.os_name(prefix);
        match mman::shm_open(os_name.as_str(), OFlag::O_RDONLY, Mode::empty())
        {
            Ok(_fd) => true,
            Err(_) => false,
        }
    }

    /// Create a region as the primary
    ///
    /// A region left behind by an earlier primary is removed first; one whose
    /// primary is still alive is `RegionBusy`.  The returned region is zero
    /// filled.
    pub fn reserve(
        prefix: &str,
        region: RegionName,
        size: u64,
        budget: &Arc<ShmBudget>,
        log: &Logger,
    ) -> Result<SharedRegion, NvmeError> {
        let os_name = region.os_name(prefix);
        let no_space = || NvmeError::RegionNoSpace {
            name: os_name.clone(),
            size,
        };

        if !budget.try_take(size) {
            return Err(no_space());
        }

        let res = Self::create(&os_name, size, log);
        match res {
            Ok((ptr, len, lock)) => {
                debug!(log, "reserved shared region {} size {}", os_name, size);
                Ok(SharedRegion {
                    region,
                    os_name,
                    ptr,
                    len,
                    owner: Some(Owner {
                        budget: budget.clone(),
                        _lock: lock,
                    }),
                    log: log.clone(),
                })
            }
            Err(e) => {
                budget.give_back(size);
                Err(e)
            }
        }
    }

    /// Take the owner lock of an open region without waiting
    fn lock(os_name: &str, file: File) -> Result<Flock<File>, NvmeError> {
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
            |(_, e)| match e {
                Errno::EWOULDBLOCK => NvmeError::RegionBusy(os_name.to_string()),
                e => region_err(os_name, e),
            },
        )
    }

    /// Remove a region left behind by a primary that no longer runs
    fn reclaim(os_name: &str, log: &Logger) -> Result<(), NvmeError> {
        let fd = match mman::shm_open(os_name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Ok(()),
            Err(e) => return Err(region_err(os_name, e)),
        };
        let _stale = Self::lock(os_name, File::from(fd))?;
        warn!(log, "removing stale shared region {}", os_name);
        match mman::shm_unlink(os_name) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(region_err(os_name, e)),
        }
    }

    /// Inode currently behind a region name
    fn named_ino(os_name: &str) -> Option<u64> {
        let fd = mman::shm_open(os_name, OFlag::O_RDONLY, Mode::empty()).ok()?;
        File::from(fd).metadata().ok().map(|m| m.ino())
    }

    fn create(
        os_name: &str,
        size: u64,
        log: &Logger,
    ) -> Result<(NonNull<libc::c_void>, usize, Flock<File>), NvmeError> {
        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let fd = match mman::shm_open(os_name, flags, mode) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                Self::reclaim(os_name, log)?;
                mman::shm_open(os_name, flags, mode)
                    .map_err(|e| region_err(os_name, e))?
            }
            Err(e) => return Err(region_err(os_name, e)),
        };
        let file = Self::lock(os_name, File::from(fd))?;

        // Between creation and locking another primary may have taken the
        // name over; the region is only ours if the name still points here.
        let ino = file.metadata().map(|m| m.ino()).ok();
        if ino.is_none() || Self::named_ino(os_name) != ino {
            return Err(NvmeError::RegionBusy(os_name.to_string()));
        }

        let cleanup = |e: NvmeError| {
            let _ = mman::shm_unlink(os_name);
            e
        };

        file.set_len(size).map_err(|e| {
            cleanup(NvmeError::RegionIo {
                name: os_name.to_string(),
                reason: e.to_string(),
            })
        })?;
        preallocate(&file, size).map_err(|e| {
            cleanup(match e {
                Errno::ENOSPC | Errno::ENOMEM => NvmeError::RegionNoSpace {
                    name: os_name.to_string(),
                    size,
                },
                e => region_err(os_name, e),
            })
        })?;

        let len = usize::try_from(size).map_err(|_| {
            cleanup(NvmeError::RegionNoSpace {
                name: os_name.to_string(),
                size,
            })
        })?;
        let ptr = map(os_name, &file, len).map_err(cleanup)?;
        Ok((ptr, len, file))
    }

    /// Attach to a region created by the primary
    ///
    /// The region must already exist and have exactly the expected size.
    pub fn attach(
        prefix: &str,
        region: RegionName,
        size: u64,
        log: &Logger,
    ) -> Result<SharedRegion, NvmeError> {
        let os_name = region.os_name(prefix);
        let fd = mman::shm_open(os_name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| region_err(&os_name, e))?;
        let file = File::from(fd);

        let actual = file
            .metadata()
            .map_err(|e| NvmeError::RegionIo {
                name: os_name.clone(),
                reason: e.to_string(),
            })?
            .len();
        if actual != size {
            return Err(NvmeError::RegionSizeMismatch {
                name: os_name,
                expected: size,
                actual,
            });
        }

        let len = size as usize;
        let ptr = map(&os_name, &file, len)?;
        debug!(log, "attached shared region {} size {}", os_name, size);
        Ok(SharedRegion {
            region,
            os_name,
            ptr,
            len,
            owner: None,
            log: log.clone(),
        })
    }

    /// Create (primary) or look up (secondary) a region
    pub fn reserve_or_attach(
        prefix: &str,
        region: RegionName,
        size: u64,
        primary: bool,
        budget: &Arc<ShmBudget>,
        log: &Logger,
    ) -> Result<SharedRegion, NvmeError> {
        if primary {
            Self::reserve(prefix, region, size, budget, log)
        } else {
            Self::attach(prefix, region, size, log)
        }
    }

    pub fn region(&self) -> RegionName {
        self.region
    }

    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_owner(&self) -> bool {
        self.owner.is_some()
    }

    /// View the first eight bytes as an atomic counter
    pub fn as_atomic_u64(&self) -> &AtomicU64 {
        assert!(self.len >= std::mem::size_of::<AtomicU64>());
        // SAFETY: mmap returns page aligned memory that lives as long as
        // self, and all access to it goes through atomics.
        unsafe { AtomicU64::from_ptr(self.ptr.as_ptr() as *mut u64) }
    }

    /// View the region as an array of 32-bit atomic slots
    pub fn as_atomic_u32_slice(&self) -> &[AtomicU32] {
        let count = self.len / std::mem::size_of::<AtomicU32>();
        // SAFETY: page aligned, sized by len, valid while self lives.
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr() as *const AtomicU32,
                count,
            )
        }
    }

    /// Base of the mapping, for layouts owned by another module
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and len are exactly what mmap returned.
        if let Err(e) = unsafe { mman::munmap(self.ptr, self.len) } {
            warn!(self.log, "munmap {} failed: {}", self.os_name, e);
        }
        if let Some(owner) = self.owner.take() {
            if let Err(e) = mman::shm_unlink(self.os_name.as_str()) {
                warn!(self.log, "unlink {} failed: {}", self.os_name, e);
            }
            owner.budget.give_back(self.len as u64);
            debug!(self.log, "released shared region {}", self.os_name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{csl, test_prefix};

    #[test]
    fn attach_before_create_fails_cleanly() {
        let log = csl();
        let prefix = test_prefix();
        let res = SharedRegion::attach(&prefix, RegionName::IoToken, 8, &log);
        assert!(matches!(res, Err(NvmeError::RegionNotFound(_))));
        assert!(!SharedRegion::exists(&prefix, RegionName::IoToken));
    }

    #[test]
    fn secondary_sees_primary_writes() {
        let log = csl();
        let prefix = test_prefix();
        let budget = ShmBudget::new(1 << 20);

        let primary =
            SharedRegion::reserve(&prefix, RegionName::IoToken, 8, &budget, &log)
                .unwrap();
        assert!(primary.is_owner());
        assert_eq!(primary.as_atomic_u64().load(Ordering::SeqCst), 0);

        let secondary =
            SharedRegion::attach(&prefix, RegionName::IoToken, 8, &log).unwrap();
        assert!(!secondary.is_owner());

        primary.as_atomic_u64().store(41, Ordering::SeqCst);
        secondary.as_atomic_u64().fetch_add(1, Ordering::SeqCst);
        assert_eq!(primary.as_atomic_u64().load(Ordering::SeqCst), 42);
    }

    #[test]
    fn attach_with_wrong_size() {
        let log = csl();
        let prefix = test_prefix();
        let budget = ShmBudget::new(1 << 20);
        let _primary = SharedRegion::reserve(
            &prefix,
            RegionName::ChecksumTable,
            4096,
            &budget,
            &log,
        )
        .unwrap();

        let res =
            SharedRegion::attach(&prefix, RegionName::ChecksumTable, 8192, &log);
        assert_eq!(
            res.unwrap_err(),
            NvmeError::RegionSizeMismatch {
                name: RegionName::ChecksumTable.os_name(&prefix),
                expected: 8192,
                actual: 4096,
            }
        );
    }

    #[test]
    fn budget_limits_reservation() {
        let log = csl();
        let prefix = test_prefix();
        let budget = ShmBudget::new(4096);

        let res = SharedRegion::reserve(
            &prefix,
            RegionName::ChecksumTable,
            8192,
            &budget,
            &log,
        );
        assert!(matches!(res, Err(NvmeError::RegionNoSpace { .. })));
        assert_eq!(budget.used(), 0);
        assert!(!SharedRegion::exists(&prefix, RegionName::ChecksumTable));

        let r = SharedRegion::reserve(
            &prefix,
            RegionName::ChecksumTable,
            4096,
            &budget,
            &log,
        )
        .unwrap();
        assert_eq!(budget.remaining(), 0);
        drop(r);
        assert_eq!(budget.remaining(), 4096);
    }

    #[test]
    fn owner_drop_removes_name() {
        let log = csl();
        let prefix = test_prefix();
        let budget = ShmBudget::new(1 << 20);
        let r = SharedRegion::reserve(
            &prefix,
            RegionName::GlobalConfig,
            8,
            &budget,
            &log,
        )
        .unwrap();
        let attached =
            SharedRegion::attach(&prefix, RegionName::GlobalConfig, 8, &log)
                .unwrap();
        drop(attached);
        assert!(SharedRegion::exists(&prefix, RegionName::GlobalConfig));
        drop(r);
        assert!(!SharedRegion::exists(&prefix, RegionName::GlobalConfig));
    }

    #[test]
    fn stale_region_is_replaced() {
        let log = csl();
        let prefix = test_prefix();
        let budget = ShmBudget::new(1 << 20);
        let os_name = RegionName::IoToken.os_name(&prefix);

        // A primary that went away without cleaning up leaves the name
        // behind, with nobody holding its lock.
        let fd = mman::shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .unwrap();
        let stale = File::from(fd);
        stale.set_len(8).unwrap();
        std::io::Write::write_all(&mut &stale, &99u64.to_ne_bytes()).unwrap();
        drop(stale);

        let fresh =
            SharedRegion::reserve(&prefix, RegionName::IoToken, 8, &budget, &log)
                .unwrap();
        assert!(fresh.is_owner());
        assert_eq!(fresh.as_atomic_u64().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn live_region_is_not_reclaimed() {
        let log = csl();
        let prefix = test_prefix();
        let budget = ShmBudget::new(1 << 20);
        let first =
            SharedRegion::reserve(&prefix, RegionName::IoToken, 8, &budget, &log)
                .unwrap();
        first.as_atomic_u64().store(99, Ordering::SeqCst);

        let res =
            SharedRegion::reserve(&prefix, RegionName::IoToken, 8, &budget, &log);
        assert_eq!(
            res.unwrap_err(),
            NvmeError::RegionBusy(RegionName::IoToken.os_name(&prefix))
        );
        assert_eq!(budget.used(), 8);

        // The live owner's contents are untouched
        let attached =
            SharedRegion::attach(&prefix, RegionName::IoToken, 8, &log).unwrap();
        assert_eq!(attached.as_atomic_u64().load(Ordering::SeqCst), 99);

        drop(attached);
        drop(first);
        SharedRegion::reserve(&prefix, RegionName::IoToken, 8, &budget, &log)
            .unwrap();
    }
}
