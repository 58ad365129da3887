//! Process start configuration, read from the environment once before any fork.
use crate::utils::{parse_hex, parse_num};

use std::convert::TryFrom;
use std::path::PathBuf;

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Default size of the coverage map.
pub const MAP_SIZE: usize = 1 << 16;
/// Default number of persistent iterations before a child is recycled.
pub const PERSISTENT_DEFAULT_CNT: u32 = 1000;

pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
pub const SHM_FUZZ_ENV_VAR: &str = "__AFL_SHM_FUZZ_ID";
pub const CMPLOG_SHM_ENV_VAR: &str = "__AFL_CMPLOG_SHM_ID";
pub const CMPLOG_MARKER_VAR: &str = "___AFL_EINS_ZWEI_POLIZEI___";
pub const MAP_SIZE_VAR: &str = "AFL_MAP_SIZE";
pub const INST_RATIO_VAR: &str = "AFL_INST_RATIO";
pub const INST_LIBS_VAR: &str = "AFL_INST_LIBS";
pub const CODE_START_VAR: &str = "AFL_CODE_START";
pub const CODE_END_VAR: &str = "AFL_CODE_END";
pub const INST_RANGES_VAR: &str = "AFL_QEMU_INST_RANGES";
pub const EXCLUDE_RANGES_VAR: &str = "AFL_QEMU_EXCLUDE_RANGES";
pub const PERSISTENT_ADDR_VAR: &str = "AFL_QEMU_PERSISTENT_ADDR";
pub const PERSISTENT_RET_VAR: &str = "AFL_QEMU_PERSISTENT_RET";
pub const PERSISTENT_GPR_VAR: &str = "AFL_QEMU_PERSISTENT_GPR";
pub const PERSISTENT_HOOK_VAR: &str = "AFL_QEMU_PERSISTENT_HOOK";
pub const PERSISTENT_RETADDR_OFFSET_VAR: &str = "AFL_QEMU_PERSISTENT_RETADDR_OFFSET";
pub const PERSISTENT_CNT_VAR: &str = "AFL_QEMU_PERSISTENT_CNT";
pub const PERSISTENT_EXITS_VAR: &str = "AFL_QEMU_PERSISTENT_EXITS";
pub const DEBUG_MAPS_VAR: &str = "AFL_QEMU_DEBUG_MAPS";
pub const DISABLE_CACHE_VAR: &str = "AFL_QEMU_DISABLE_CACHE";
pub const DEBUG_VAR: &str = "AFL_DEBUG";

/// Half open range of guest addresses, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Persistent mode parameters, present only if an entry address is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Guest address where each iteration starts.
    pub addr: u64,
    /// Guest address where each iteration ends. Patched return address if None.
    pub ret_addr: Option<u64>,
    /// Snapshot general purpose registers on the first pass.
    pub save_gpr: bool,
    /// Offset of the return address slot, for the patching emulator.
    pub retaddr_offset: i64,
    /// Iterations served by one child, 0 means unlimited.
    pub count: u32,
    /// Treat guest exit calls as the end of an iteration.
    pub exits: bool,
}

impl PersistentConfig {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            ret_addr: None,
            save_gpr: false,
            retaddr_offset: 0,
            count: PERSISTENT_DEFAULT_CNT,
            exits: false,
        }
    }
}

/// Immutable configuration of one emulator process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Negotiated coverage map size.
    pub map_size: usize,
    /// Coverage map identifier, a private map is used if None.
    pub shm_id: Option<String>,
    /// Test case delivery map identifier.
    pub shm_fuzz_id: Option<String>,
    /// Comparison log map identifier, only set for cmplog controllers.
    pub cmplog_shm_id: Option<String>,
    /// Instrumentation ratio in percent, in range [1, 100].
    pub inst_ratio: Option<u32>,
    /// Instrument everything, not only the main text region.
    pub inst_libs: bool,
    pub code_start: Option<u64>,
    pub code_end: Option<u64>,
    pub inst_ranges: Vec<AddrRange>,
    pub exclude_ranges: Vec<AddrRange>,
    pub persistent: Option<PersistentConfig>,
    /// Shared object implementing the persistent hook.
    pub hook_path: Option<PathBuf>,
    pub debug_maps: bool,
    pub disable_cache: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_size: MAP_SIZE,
            shm_id: None,
            shm_fuzz_id: None,
            cmplog_shm_id: None,
            inst_ratio: None,
            inst_libs: false,
            code_start: None,
            code_end: None,
            inst_ranges: Vec::new(),
            exclude_ranges: Vec::new(),
            persistent: None,
            hook_path: None,
            debug_maps: false,
            disable_cache: false,
            debug: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}={value}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid range '{range}' in {name}")]
    InvalidRange { name: &'static str, range: String },
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from name/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: FxHashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let var = |name: &str| vars.get(name).map(|v| v.trim());
        let is_set = |name: &str| vars.contains_key(name);

        let mut conf = Config {
            debug: is_set(DEBUG_VAR),
            debug_maps: is_set(DEBUG_MAPS_VAR),
            disable_cache: is_set(DISABLE_CACHE_VAR),
            inst_libs: is_set(INST_LIBS_VAR),
            shm_id: var(SHM_ENV_VAR).map(String::from),
            shm_fuzz_id: var(SHM_FUZZ_ENV_VAR).map(String::from),
            ..Default::default()
        };

        if let Some(sz) = var(MAP_SIZE_VAR) {
            let sz = parse_num(sz).ok_or_else(|| invalid(MAP_SIZE_VAR, sz, "not a number"))?;
            if sz < 8 {
                return Err(invalid(MAP_SIZE_VAR, &sz.to_string(), "too small"));
            }
            conf.map_size = sz as usize;
        }

        if let Some(r) = var(INST_RATIO_VAR) {
            let r = r
                .parse::<u64>()
                .map_err(|e| invalid(INST_RATIO_VAR, r, &e.to_string()))?;
            conf.inst_ratio = Some(r.clamp(1, 100) as u32);
        }

        if is_set(CMPLOG_MARKER_VAR) {
            conf.cmplog_shm_id = var(CMPLOG_SHM_ENV_VAR).map(String::from);
        }

        if let Some(start) = var(CODE_START_VAR) {
            conf.code_start =
                Some(parse_hex(start).ok_or_else(|| invalid(CODE_START_VAR, start, "not hex"))?);
        }
        if let Some(end) = var(CODE_END_VAR) {
            conf.code_end =
                Some(parse_hex(end).ok_or_else(|| invalid(CODE_END_VAR, end, "not hex"))?);
        }
        if let Some(ranges) = var(INST_RANGES_VAR) {
            conf.inst_ranges = parse_ranges(INST_RANGES_VAR, ranges)?;
        }
        if let Some(ranges) = var(EXCLUDE_RANGES_VAR) {
            conf.exclude_ranges = parse_ranges(EXCLUDE_RANGES_VAR, ranges)?;
        }

        conf.hook_path = var(PERSISTENT_HOOK_VAR).map(PathBuf::from);

        // no persistent mode for cmplog
        if conf.cmplog_shm_id.is_none() {
            if let Some(addr) = var(PERSISTENT_ADDR_VAR) {
                let addr = parse_num(addr)
                    .ok_or_else(|| invalid(PERSISTENT_ADDR_VAR, addr, "not an address"))?;
                let mut p = PersistentConfig::new(addr);
                if let Some(ret) = var(PERSISTENT_RET_VAR) {
                    p.ret_addr = Some(
                        parse_num(ret)
                            .ok_or_else(|| invalid(PERSISTENT_RET_VAR, ret, "not an address"))?,
                    );
                }
                if let Some(off) = var(PERSISTENT_RETADDR_OFFSET_VAR) {
                    p.retaddr_offset = parse_offset(off).ok_or_else(|| {
                        invalid(PERSISTENT_RETADDR_OFFSET_VAR, off, "not an offset")
                    })?;
                }
                if let Some(cnt) = var(PERSISTENT_CNT_VAR) {
                    let cnt = parse_num(cnt)
                        .ok_or_else(|| invalid(PERSISTENT_CNT_VAR, cnt, "not a number"))?;
                    p.count = u32::try_from(cnt)
                        .map_err(|e| invalid(PERSISTENT_CNT_VAR, &cnt.to_string(), &e.to_string()))?;
                }
                p.save_gpr = is_set(PERSISTENT_GPR_VAR) || conf.hook_path.is_some();
                p.exits = is_set(PERSISTENT_EXITS_VAR);
                conf.persistent = Some(p);
            }
        }

        Ok(conf)
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent.is_some()
    }

    /// Number of map slots that may receive edges.
    pub fn inst_rms(&self) -> usize {
        match self.inst_ratio {
            Some(r) => self.map_size * r as usize / 100,
            None => self.map_size,
        }
    }

    /// Resolve the instrumented code range given the loaded text region.
    pub fn code_range(&self, text: AddrRange) -> AddrRange {
        let (mut start, mut end) = if self.inst_libs {
            (0, u64::MAX)
        } else {
            (text.start, text.end)
        };
        if let Some(s) = self.code_start {
            start = s;
        }
        if let Some(e) = self.code_end {
            end = e;
        }
        AddrRange::new(start, end)
    }

    /// Should the block at `pc` be instrumented?
    pub fn should_instrument(&self, pc: u64, text: AddrRange) -> bool {
        if self.exclude_ranges.iter().any(|r| r.contains(pc)) {
            return false;
        }
        if !self.inst_ranges.is_empty() {
            return self.inst_ranges.iter().any(|r| r.contains(pc));
        }
        self.code_range(text).contains(pc)
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_offset(s: &str) -> Option<i64> {
    match s.strip_prefix('-') {
        Some(abs) => parse_num(abs).map(|v| -(v as i64)),
        None => parse_num(s).map(|v| v as i64),
    }
}

fn parse_ranges(name: &'static str, s: &str) -> Result<Vec<AddrRange>, ConfigError> {
    let mut ranges = Vec::new();
    for item in s.split(',').map(|i| i.trim()).filter(|i| !i.is_empty()) {
        let bad = || ConfigError::InvalidRange {
            name,
            range: item.to_string(),
        };
        let (start, end) = item.split_once('-').ok_or_else(bad)?;
        let start = parse_hex(start.trim()).ok_or_else(bad)?;
        let end = parse_hex(end.trim()).ok_or_else(bad)?;
        if start >= end {
            return Err(bad());
        }
        ranges.push(AddrRange::new(start, end));
    }
    Ok(ranges)
}
