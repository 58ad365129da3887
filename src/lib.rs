//! Fork server and translation cache relay for fuzzing binaries under
//! qemu user mode.
//!
//! The emulator calls [`init`] once at startup and [`forkserver`] when the
//! guest reaches its entry point. From then on one process, the controller,
//! only forks children and warms its translation cache with the blocks they
//! report, while each child runs the target once, or many times in
//! persistent mode.
pub mod config;
pub mod cover;
pub mod engine;
pub mod fsrv;
pub mod hook;
pub mod persistent;
pub mod shm;
pub mod tsl;
pub mod utils;

use crate::config::{AddrRange, Config, ConfigError, SHM_FUZZ_ENV_VAR};
use crate::cover::CoverageMap;
use crate::fsrv::{Channels, ForkServer};
use crate::hook::{HookError, HookPlugin, PersistentHook};
use crate::shm::{InputShm, ShmError, ShmRegion};
use crate::tsl::{BlockKey, RelayWriter, TranslationEngine};

use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::process::exit;

use thiserror::Error;

/// Exit codes of the controller, distinct from whatever the target returns.
pub mod exit_code {
    pub const SHM: i32 = 1;
    pub const CTL_CLOSED: i32 = 2;
    pub const RELAY_PIPE: i32 = 3;
    pub const FORK: i32 = 4;
    pub const WRITE_PID: i32 = 5;
    pub const WAIT: i32 = 6;
    pub const WRITE_STATUS: i32 = 7;
    pub const REAP_KILLED: i32 = 8;
    pub const HOOK_LOAD: i32 = 10;
    pub const HOOK_STATIC: i32 = 11;
    pub const NO_PERSISTENT_ITER: i32 = 12;
    pub const CONFIG: i32 = 13;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Controller,
    Child,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("coverage map: {0}")]
    CoverageMap(ShmError),
    #[error("cmplog map: {0}")]
    CmplogMap(ShmError),
    #[error("hook: {0}")]
    Hook(#[from] HookError),
}

impl SetupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupError::Config(_) => exit_code::CONFIG,
            SetupError::CoverageMap(_) | SetupError::CmplogMap(_) => exit_code::SHM,
            SetupError::Hook(HookError::StaticBuild(_)) => exit_code::HOOK_STATIC,
            SetupError::Hook(_) => exit_code::HOOK_LOAD,
        }
    }
}

/// Everything one emulator process keeps between fork server, instrumentation
/// and persistent loop.
pub struct RuntimeState {
    config: Config,
    role: ProcessRole,
    cov: CoverageMap,
    cmp_map: Option<ShmRegion>,
    input: Option<InputShm>,
    hook: Option<Box<dyn PersistentHook>>,
    shmem_fuzzing: bool,
    relay: RelayWriter,
    /// Loaded text region of the target.
    text: AddrRange,
    prev_loc: u64,
    inst_rms: usize,
}

impl RuntimeState {
    /// State with a given map and no driver resources.
    pub fn new(config: Config, cov: CoverageMap) -> Self {
        let inst_rms = config.inst_rms();
        Self {
            config,
            role: ProcessRole::Controller,
            cov,
            cmp_map: None,
            input: None,
            hook: None,
            shmem_fuzzing: false,
            relay: RelayWriter::disconnected(),
            text: AddrRange::new(0, u64::MAX),
            prev_loc: 0,
            inst_rms,
        }
    }

    /// Attach driver maps and load the hook, before anything is forked.
    pub fn setup<E: TranslationEngine>(config: Config, engine: &mut E) -> Result<Self, SetupError> {
        let mut cov = match config.shm_id.as_deref() {
            Some(id) => CoverageMap::attach(id, config.map_size).map_err(SetupError::CoverageMap)?,
            None => CoverageMap::private(config.map_size),
        };
        if config.inst_ratio.is_some() {
            // keep the driver from bailing out on an empty map.
            cov.touch();
        }

        let cmp_map = match config.cmplog_shm_id.as_deref() {
            Some(id) => Some(ShmRegion::attach(id, 0).map_err(SetupError::CmplogMap)?),
            None => None,
        };

        let hook_path = config.hook_path.clone();
        let mut rt = Self::new(config, cov);
        rt.cmp_map = cmp_map;
        if let Some(path) = hook_path {
            rt.set_hook(Box::new(HookPlugin::load(&path)?));
        }

        engine.disable_fork_handlers();

        log::debug!(
            "runtime ready, map: {:?}, cmplog: {}, persistent: {:?}, shm input: {}",
            rt.cov,
            rt.cmp_map.is_some(),
            rt.config.persistent,
            rt.shmem_fuzzing
        );
        Ok(rt)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    #[inline]
    pub fn is_child(&self) -> bool {
        self.role == ProcessRole::Child
    }

    pub fn shmem_fuzzing(&self) -> bool {
        self.shmem_fuzzing
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.cov
    }

    pub fn coverage_mut(&mut self) -> &mut CoverageMap {
        &mut self.cov
    }

    pub fn cmplog_map(&mut self) -> Option<&mut ShmRegion> {
        self.cmp_map.as_mut()
    }

    pub fn relay(&self) -> &RelayWriter {
        &self.relay
    }

    /// Record the loaded text region, the default instrumentation range.
    pub fn set_text_region(&mut self, start: u64, end: u64) {
        self.text = AddrRange::new(start, end);
    }

    pub fn should_instrument(&self, pc: u64) -> bool {
        self.config.should_instrument(pc, self.text)
    }

    /// Become a child, `relay` is the inherited relay descriptor.
    pub fn enter_child(&mut self, relay: Option<RawFd>) {
        let writer = match relay {
            Some(fd) => unsafe { RelayWriter::from_fd(fd) },
            None => RelayWriter::disconnected(),
        };
        self.enter_child_with(writer);
    }

    /// Become a child reporting to `relay`.
    pub fn enter_child_with(&mut self, relay: RelayWriter) {
        self.role = ProcessRole::Child;
        self.relay = relay;
    }

    pub fn attach_input(&mut self) -> Result<(), ShmError> {
        let id = self
            .config
            .shm_fuzz_id
            .as_deref()
            .ok_or(ShmError::MissingId(SHM_FUZZ_ENV_VAR))?;
        self.input = Some(InputShm::attach(id)?);
        Ok(())
    }

    /// Test case delivered through shared memory, empty without one.
    pub fn input_bytes(&self) -> &[u8] {
        match self.input.as_ref() {
            Some(input) => input.input(),
            None => &[],
        }
    }

    /// Install the persistent hook, its `init` decides whether the test
    /// case comes through shared memory.
    pub fn set_hook(&mut self, mut hook: Box<dyn PersistentHook>) {
        self.shmem_fuzzing = hook.init();
        self.hook = Some(hook);
    }

    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Let the hook prepare the registers at `regs` for the next run.
    pub fn run_hook(&mut self, regs: *mut c_void, guest_base: u64) {
        if let Some(hook) = self.hook.as_mut() {
            let input = match self.input.as_ref() {
                Some(input) => input.input(),
                None => &[],
            };
            hook.run(regs, guest_base, input);
        }
    }

    /// Ask the controller to translate `block` too, and to chain it to
    /// `pred` at the given exit if set. Never fails, never blocks for long.
    pub fn request_translation(&mut self, block: BlockKey, cf_mask: u32, pred: Option<(BlockKey, u32)>) {
        if self.config.disable_cache || !self.is_child() {
            return;
        }
        self.relay.send(block, cf_mask, pred);
    }

    /// End the relay stream of one persistent run, false if the relay is gone.
    pub fn send_exit_marker(&mut self) -> bool {
        if self.config.disable_cache {
            // controller does not drain at all.
            return true;
        }
        self.relay.send_exit()
    }

    /// Clear the map and the edge state.
    pub fn reset_coverage(&mut self) {
        self.cov.reset();
        self.prev_loc = 0;
    }

    /// Record the edge from the previous block to the block at `pc`.
    #[inline]
    pub fn trace_block(&mut self, pc: u64) {
        if !self.should_instrument(pc) {
            return;
        }
        let map = self.cov.as_mut_slice();
        let len = map.len() as u64;
        if len == 0 {
            return;
        }
        let cur = ((pc >> 4) ^ (pc << 8)) % len;
        if cur as usize >= self.inst_rms {
            return;
        }
        let idx = ((cur ^ self.prev_loc) % len) as usize;
        map[idx] = map[idx].wrapping_add(1);
        self.prev_loc = cur >> 1;
    }
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("role", &self.role)
            .field("cov", &self.cov)
            .field("relay", &self.relay)
            .field("hook", &self.hook.is_some())
            .field("shmem_fuzzing", &self.shmem_fuzzing)
            .finish()
    }
}

/// Load configuration from the environment and set up the process, exits on failure.
pub fn init<E: TranslationEngine>(engine: &mut E) -> RuntimeState {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}", e);
            exit(exit_code::CONFIG);
        }
    };
    match RuntimeState::setup(config, engine) {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("{}", e);
            exit(e.exit_code());
        }
    }
}

/// Run the fork server on the standard descriptors, exits on protocol failure.
///
/// Returns in forked children, and once in the process itself if no driver
/// is listening.
pub fn forkserver<E: TranslationEngine>(rt: &mut RuntimeState, engine: &mut E) -> ProcessRole {
    let channels = Channels::default();
    if !channels.is_open() {
        log::info!("no fuzzer on the other side, running standalone");
        return ProcessRole::Controller;
    }
    let server = unsafe { ForkServer::from_channels(channels, rt.config()) };
    match server.run(rt, engine) {
        Ok(role) => role,
        Err(e) => {
            log::error!("fork server: {}", e);
            exit(e.exit_code());
        }
    }
}
