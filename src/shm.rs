//! Attach to shared memory regions handed out by the fuzzing driver.
use std::{mem, ptr, slice};

use nix::errno::Errno;
use nix::libc;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use thiserror::Error;

/// Maximum size of one test case delivered through shared memory.
pub const MAX_INPUT_SIZE: usize = 1 << 20;
/// Size of the length prefix of the input region.
pub const INPUT_LEN_SIZE: usize = mem::size_of::<u32>();

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("{0} is not set")]
    MissingId(&'static str),
    #[error("shmat({id}): {errno}")]
    Attach { id: i32, errno: Errno },
    #[error("shm {id} has {actual} bytes, {expected} required")]
    TooSmall {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("open named shm '{id}': {err}")]
    Named { id: String, err: ShmemError },
}

/// A mapped shared memory region, never removed by us.
pub enum ShmRegion {
    /// SysV segment, identified by a numeric id.
    SysV {
        id: i32,
        ptr: *mut u8,
        size: usize,
    },
    /// Named posix mapping, only the first `size` bytes are exposed.
    Named { shm: Shmem, size: usize },
}

impl ShmRegion {
    /// Attach the region identified by `id`, requiring at least `size` bytes.
    /// A `size` of 0 maps the whole region.
    ///
    /// Numeric ids are SysV segments, anything else is opened as a named mapping.
    pub fn attach(id: &str, size: usize) -> Result<Self, ShmError> {
        match id.trim().parse::<i32>() {
            Ok(id) => Self::attach_sysv(id, size),
            Err(_) => Self::open_named(id, size),
        }
    }

    fn attach_sysv(id: i32, size: usize) -> Result<Self, ShmError> {
        let actual = unsafe {
            let mut ds: libc::shmid_ds = mem::zeroed();
            if libc::shmctl(id, libc::IPC_STAT, &mut ds) == -1 {
                return Err(ShmError::Attach {
                    id,
                    errno: Errno::last(),
                });
            }
            ds.shm_segsz as usize
        };
        if actual < size {
            return Err(ShmError::TooSmall {
                id: id.to_string(),
                expected: size,
                actual,
            });
        }
        let size = if size == 0 { actual } else { size };

        let ptr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(ShmError::Attach {
                id,
                errno: Errno::last(),
            });
        }
        Ok(ShmRegion::SysV {
            id,
            ptr: ptr as *mut u8,
            size,
        })
    }

    fn open_named(id: &str, size: usize) -> Result<Self, ShmError> {
        let shm = ShmemConf::new()
            .os_id(id)
            .open()
            .map_err(|err| ShmError::Named {
                id: id.to_string(),
                err,
            })?;
        if shm.len() < size {
            return Err(ShmError::TooSmall {
                id: id.to_string(),
                expected: size,
                actual: shm.len(),
            });
        }
        let size = if size == 0 { shm.len() } else { size };
        Ok(ShmRegion::Named { shm, size })
    }

    pub fn len(&self) -> usize {
        match self {
            ShmRegion::SysV { size, .. } => *size,
            ShmRegion::Named { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ShmRegion::SysV { ptr, size, .. } => unsafe { slice::from_raw_parts(*ptr, *size) },
            ShmRegion::Named { shm, size } => unsafe { &shm.as_slice()[..*size] },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            ShmRegion::SysV { ptr, size, .. } => unsafe { slice::from_raw_parts_mut(*ptr, *size) },
            ShmRegion::Named { shm, size } => unsafe { &mut shm.as_slice_mut()[..*size] },
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let ShmRegion::SysV { id, ptr, .. } = self {
            // detach only, the driver owns the segment.
            if unsafe { libc::shmdt(*ptr as *const libc::c_void) } == -1 {
                log::warn!("shmdt({}): {}", id, Errno::last());
            }
        }
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShmRegion::SysV { id, size, .. } => write!(f, "SysV(id: {}, size: {})", id, size),
            ShmRegion::Named { shm, size } => {
                write!(f, "Named(id: {}, size: {})", shm.get_os_id(), size)
            }
        }
    }
}

/// Test case delivery region: a u32 length followed by the payload.
#[derive(Debug)]
pub struct InputShm {
    region: ShmRegion,
}

impl InputShm {
    pub fn attach(id: &str) -> Result<Self, ShmError> {
        let region = ShmRegion::attach(id, INPUT_LEN_SIZE + MAX_INPUT_SIZE)?;
        Ok(Self { region })
    }

    /// Length of current test case, clamped to the payload capacity.
    pub fn input_len(&self) -> usize {
        let buf = self.region.as_slice();
        let mut len = [0; INPUT_LEN_SIZE];
        len.copy_from_slice(&buf[..INPUT_LEN_SIZE]);
        (u32::from_ne_bytes(len) as usize).min(MAX_INPUT_SIZE)
    }

    /// Current test case.
    pub fn input(&self) -> &[u8] {
        let len = self.input_len();
        &self.region.as_slice()[INPUT_LEN_SIZE..INPUT_LEN_SIZE + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Segment(i32);

    impl Segment {
        fn new(size: usize) -> Self {
            let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
            assert!(id >= 0, "shmget: {}", Errno::last());
            Segment(id)
        }
    }

    impl Drop for Segment {
        fn drop(&mut self) {
            unsafe { libc::shmctl(self.0, libc::IPC_RMID, ptr::null_mut()) };
        }
    }

    #[test]
    fn sysv_attach_shares_memory() {
        let seg = Segment::new(4096);
        let mut a = ShmRegion::attach(&seg.0.to_string(), 4096).unwrap();
        let b = ShmRegion::attach(&seg.0.to_string(), 1024).unwrap();
        a.as_mut_slice()[7] = 0xaa;
        assert_eq!(b.as_slice()[7], 0xaa);
        assert_eq!(b.len(), 1024);
        let whole = ShmRegion::attach(&seg.0.to_string(), 0).unwrap();
        assert!(whole.len() >= 4096);
    }

    #[test]
    fn sysv_too_small() {
        let seg = Segment::new(1024);
        match ShmRegion::attach(&seg.0.to_string(), 1 << 16) {
            Err(ShmError::TooSmall { actual, .. }) => assert!(actual >= 1024),
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    fn bad_ids() {
        assert!(matches!(
            ShmRegion::attach("-1", 16),
            Err(ShmError::Attach { .. })
        ));
        assert!(matches!(
            ShmRegion::attach("qafl_missing_region", 16),
            Err(ShmError::Named { .. })
        ));
    }

    #[test]
    fn input_region() {
        let seg = Segment::new(INPUT_LEN_SIZE + MAX_INPUT_SIZE);
        let id = seg.0.to_string();
        let mut driver = ShmRegion::attach(&id, INPUT_LEN_SIZE + MAX_INPUT_SIZE).unwrap();
        let input = InputShm::attach(&id).unwrap();

        let buf = driver.as_mut_slice();
        buf[..4].copy_from_slice(&5u32.to_ne_bytes());
        buf[4..9].copy_from_slice(b"hello");
        assert_eq!(input.input(), b"hello");

        let buf = driver.as_mut_slice();
        buf[..4].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert_eq!(input.input_len(), MAX_INPUT_SIZE);
    }
}
