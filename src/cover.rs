//! Coverage map shared with the fuzzing driver.
use crate::shm::{ShmError, ShmRegion};

enum Backing {
    Private(Box<[u8]>),
    Shared(ShmRegion),
}

/// Edge hit counters, indexed by hashed edge.
///
/// The first byte is a sentinel that is always set after a reset, so that the
/// driver can tell an instrumented run with no edges from a dead target.
pub struct CoverageMap {
    backing: Backing,
    /// Target of writes once the persistent loop gave up on the shared map.
    fallback: Option<Box<[u8]>>,
}

impl CoverageMap {
    /// Map not shared with anybody, used when running without a driver.
    pub fn private(size: usize) -> Self {
        Self {
            backing: Backing::Private(boxed_buf(size)),
            fallback: None,
        }
    }

    pub fn attach(id: &str, size: usize) -> Result<Self, ShmError> {
        let region = ShmRegion::attach(id, size)?;
        Ok(Self {
            backing: Backing::Shared(region),
            fallback: None,
        })
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    pub fn is_redirected(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if let Some(buf) = self.fallback.as_ref() {
            return &buf[..];
        }
        match &self.backing {
            Backing::Private(buf) => &buf[..],
            Backing::Shared(region) => region.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if let Some(buf) = self.fallback.as_mut() {
            return &mut buf[..];
        }
        match &mut self.backing {
            Backing::Private(buf) => &mut buf[..],
            Backing::Shared(region) => region.as_mut_slice(),
        }
    }

    /// Set the sentinel byte.
    pub fn touch(&mut self) {
        if let Some(b) = self.as_mut_slice().first_mut() {
            *b = 1;
        }
    }

    /// Clear all counters, then set the sentinel.
    pub fn reset(&mut self) {
        let map = self.as_mut_slice();
        for b in map.iter_mut() {
            *b = 0;
        }
        self.touch();
    }

    /// Redirect all further writes into a private buffer of the same size.
    ///
    /// Used when a persistent child is about to exit: edges hit while tearing
    /// the guest down must not pollute the result of the last iteration.
    pub fn redirect_to_fallback(&mut self) {
        if self.fallback.is_none() {
            let len = self.len();
            self.fallback = Some(boxed_buf(len));
        }
    }
}

impl std::fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageMap")
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .field("redirected", &self.is_redirected())
            .finish()
    }
}

fn boxed_buf(sz: usize) -> Box<[u8]> {
    vec![0; sz].into_boxed_slice()
}
