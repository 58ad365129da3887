//! Persistent hook plugin.
//!
//! A shared object that prepares guest state for every persistent iteration,
//! typically by copying the test case into guest memory and registers:
//!
//! ```c
//! int afl_persistent_hook_init(void);   // optional, non-zero enables shm input
//! void afl_persistent_hook(struct regs *regs, uint64_t guest_base,
//!                          uint8_t *input_buf, uint32_t input_buf_len);
//! ```
use std::ffi::c_void;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const HOOK_INIT_SYM: &[u8] = b"afl_persistent_hook_init\0";
pub const HOOK_SYM: &[u8] = b"afl_persistent_hook\0";

pub type HookInitFn = unsafe extern "C" fn() -> c_int;
pub type HookFn = unsafe extern "C" fn(*mut c_void, u64, *const u8, u32);

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to load hook '{}': {err}", .path.display())]
    Load {
        path: PathBuf,
        err: libloading::Error,
    },
    #[error("hook '{}' has no afl_persistent_hook: {err}", .path.display())]
    MissingEntry {
        path: PathBuf,
        err: libloading::Error,
    },
    #[error("persistent hook '{}' requested, but dynamic loading is unavailable in a static build", .0.display())]
    StaticBuild(PathBuf),
}

/// Capabilities of a loaded hook.
pub trait PersistentHook {
    /// Called once before the handshake, true if the test case comes through shared memory.
    fn init(&mut self) -> bool {
        false
    }

    /// Prepare one iteration. `regs` points to a copy of the saved registers
    /// that is restored into the guest afterwards.
    fn run(&mut self, regs: *mut c_void, guest_base: u64, input: &[u8]);
}

pub struct HookPlugin {
    path: PathBuf,
    init: Option<HookInitFn>,
    hook: HookFn,
    // keeps the symbols above valid.
    _lib: libloading::Library,
}

impl HookPlugin {
    #[cfg(not(feature = "static-build"))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HookError> {
        let path = path.as_ref().to_path_buf();
        let lib = unsafe { libloading::Library::new(&path) }.map_err(|err| HookError::Load {
            path: path.clone(),
            err,
        })?;
        let hook = match unsafe { lib.get::<HookFn>(HOOK_SYM) } {
            Ok(sym) => *sym,
            Err(err) => return Err(HookError::MissingEntry { path, err }),
        };
        let init = unsafe { lib.get::<HookInitFn>(HOOK_INIT_SYM) }
            .ok()
            .map(|sym| *sym);
        log::info!(
            "persistent hook loaded from {}, init: {}",
            path.display(),
            init.is_some()
        );
        Ok(Self {
            path,
            init,
            hook,
            _lib: lib,
        })
    }

    #[cfg(feature = "static-build")]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HookError> {
        Err(HookError::StaticBuild(path.as_ref().to_path_buf()))
    }
}

impl PersistentHook for HookPlugin {
    fn init(&mut self) -> bool {
        match self.init {
            Some(init) => unsafe { init() != 0 },
            None => false,
        }
    }

    fn run(&mut self, regs: *mut c_void, guest_base: u64, input: &[u8]) {
        unsafe { (self.hook)(regs, guest_base, input.as_ptr(), input.len() as u32) }
    }
}

impl std::fmt::Debug for HookPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPlugin")
            .field("path", &self.path)
            .field("init", &self.init.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "static-build"))]
    fn missing_library() {
        match HookPlugin::load("/nonexistent/qafl_hook.so") {
            Err(HookError::Load { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/qafl_hook.so"))
            }
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    #[cfg(all(target_os = "linux", not(feature = "static-build")))]
    fn library_without_entry() {
        // libc is always there and never exports the hook.
        match HookPlugin::load("libc.so.6") {
            Err(e @ HookError::MissingEntry { .. }) => {
                assert!(e.to_string().contains("libc.so.6"))
            }
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    #[cfg(feature = "static-build")]
    fn static_build_refuses() {
        assert!(matches!(
            HookPlugin::load("/tmp/hook.so"),
            Err(HookError::StaticBuild(_))
        ));
    }
}
