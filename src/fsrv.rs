//! Fork server controller.
//!
//! Talks to the fuzzing driver over two inherited descriptors. After one
//! handshake it serves requests forever: fork a child (or resume a suspended
//! one), relay its translation requests, wait for it and report the status.
use crate::config::Config;
use crate::shm::ShmError;
use crate::tsl::{drain_relay, RelayEnd, TranslationEngine};
use crate::utils::{dump_maps, named_signal, read_u32, write_u32};
use crate::{exit_code, ProcessRole, RuntimeState};

use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{close, dup, dup2, fork, pipe, ForkResult, Pid};
use thiserror::Error;

/// Descriptor the driver writes tokens to.
pub const FORKSRV_FD: RawFd = 198;
/// Slot the child's end of the relay pipe is moved to.
pub const TSL_FD: RawFd = FORKSRV_FD - 1;

pub const FS_OPT_ENABLED: u32 = 0x8000_0001;
pub const FS_OPT_MAPSIZE: u32 = 0x4000_0000;
pub const FS_OPT_SNAPSHOT: u32 = 0x2000_0000;
pub const FS_OPT_SHDMEM_FUZZ: u32 = 0x0100_0000;
pub const FS_OPT_NEWCMPLOG: u32 = 0x0200_0000;
pub const FS_OPT_MAX_MAPSIZE: usize = (0x00ff_fffe >> 1) + 1;

#[derive(Debug, Error)]
pub enum FsrvError {
    #[error("fuzzer does not support shared memory input, options: {0:#010x}")]
    ShmemInputUnsupported(u32),
    #[error("input shm: {0}")]
    InputShm(ShmError),
    #[error("control pipe closed")]
    PeerGone,
    #[error("relay pipe: {0}")]
    RelayPipe(Errno),
    #[error("fork: {0}")]
    Fork(Errno),
    #[error("failed to report child pid")]
    WritePid,
    #[error("waitpid: {0}")]
    Wait(Errno),
    #[error("failed to report child status")]
    WriteStatus,
    #[error("failed to reap killed child: {0}")]
    ReapKilled(Errno),
    #[error("no persistent iteration executed, check the persistent address")]
    NoPersistentIteration,
}

impl FsrvError {
    pub fn exit_code(&self) -> i32 {
        use FsrvError::*;
        match self {
            ShmemInputUnsupported(_) | InputShm(_) => exit_code::SHM,
            PeerGone => exit_code::CTL_CLOSED,
            RelayPipe(_) => exit_code::RELAY_PIPE,
            Fork(_) => exit_code::FORK,
            WritePid => exit_code::WRITE_PID,
            Wait(_) => exit_code::WAIT,
            WriteStatus => exit_code::WRITE_STATUS,
            ReapKilled(_) => exit_code::REAP_KILLED,
            NoPersistentIteration => exit_code::NO_PERSISTENT_ITER,
        }
    }
}

/// Descriptors shared with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    /// Tokens from the driver.
    pub ctl: RawFd,
    /// Handshake, pids and statuses to the driver.
    pub st: RawFd,
    /// Fixed slot of the child's relay descriptor.
    pub tsl: RawFd,
}

impl Default for Channels {
    fn default() -> Self {
        Self::with_ctl(FORKSRV_FD)
    }
}

impl Channels {
    /// Channels derived from the token descriptor, as the driver lays them out.
    pub fn with_ctl(ctl: RawFd) -> Self {
        Self {
            ctl,
            st: ctl + 1,
            tsl: ctl - 1,
        }
    }

    /// Are both driver descriptors open? They are not when running outside a fuzzer.
    pub fn is_open(&self) -> bool {
        fcntl(self.ctl, FcntlArg::F_GETFD).is_ok() && fcntl(self.st, FcntlArg::F_GETFD).is_ok()
    }
}

/// Capabilities advertised in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeStatus(u32);

impl HandshakeStatus {
    pub fn new(map_size: usize, shmem_fuzz: bool) -> Self {
        let mut status = 0;
        if map_size <= FS_OPT_MAX_MAPSIZE {
            status |= set_mapsize(map_size) | FS_OPT_MAPSIZE;
        }
        if shmem_fuzz {
            status |= FS_OPT_SHDMEM_FUZZ;
        }
        if status != 0 {
            status |= FS_OPT_ENABLED | FS_OPT_NEWCMPLOG;
        }
        Self(status)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Advertised map size, if any.
    pub fn map_size(self) -> Option<usize> {
        if self.0 & FS_OPT_MAPSIZE == 0 {
            return None;
        }
        let raw = (self.0 & 0x00ff_fffe) >> 1;
        Some(if raw == 0 { 0 } else { raw as usize + 1 })
    }

    pub fn shmem_fuzz(self) -> bool {
        self.0 & FS_OPT_SHDMEM_FUZZ != 0
    }
}

fn set_mapsize(sz: usize) -> u32 {
    if sz <= 1 || sz > FS_OPT_MAX_MAPSIZE {
        0
    } else {
        ((sz - 1) << 1) as u32
    }
}

/// Does the driver's option echo confirm shared memory input?
pub fn accepts_shmem_input(opts: u32) -> bool {
    let want = FS_OPT_ENABLED | FS_OPT_SHDMEM_FUZZ;
    opts & want == want
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    /// Stopped itself after a persistent run.
    Suspended,
    Terminated,
}

/// Raw wait status, relayed to the driver untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildStatus(pub i32);

impl ChildStatus {
    pub fn is_stopped(self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    pub fn describe(self) -> String {
        let s = self.0;
        if libc::WIFEXITED(s) {
            format!("exited with {}", libc::WEXITSTATUS(s))
        } else if libc::WIFSIGNALED(s) {
            format!("killed by {}", named_signal(libc::WTERMSIG(s)))
        } else if libc::WIFSTOPPED(s) {
            format!("stopped by {}", named_signal(libc::WSTOPSIG(s)))
        } else {
            format!("status {:#x}", s)
        }
    }
}

/// The one child of current fork cycle.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    relay: Option<File>,
    state: ChildState,
}

impl ChildHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn resume(&mut self) {
        if let Err(e) = kill(self.pid, Signal::SIGCONT) {
            // already dead, waitpid will tell.
            log::warn!("failed to resume {}: {}", self.pid, e);
        }
        self.state = ChildState::Running;
    }

    fn wait(&mut self, untraced: bool) -> Result<ChildStatus, Errno> {
        let flags = if untraced { libc::WUNTRACED } else { 0 };
        let status = wait_raw(self.pid, flags)?;
        self.state = if status.is_stopped() {
            ChildState::Suspended
        } else {
            ChildState::Terminated
        };
        Ok(status)
    }

    /// Collect a suspended child the driver has killed meanwhile.
    fn reap(mut self) -> Result<ChildStatus, Errno> {
        self.wait(false)
    }
}

fn wait_raw(pid: Pid, flags: libc::c_int) -> Result<ChildStatus, Errno> {
    let mut status = 0;
    loop {
        match Errno::result(unsafe { libc::waitpid(pid.as_raw(), &mut status, flags) }) {
            Ok(_) => return Ok(ChildStatus(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

enum Forked {
    /// Relay descriptor of the new child, None if caching is disabled.
    Child(Option<RawFd>),
    Parent(ChildHandle),
}

pub struct ForkServer {
    ctl: File,
    st: File,
    tsl_slot: RawFd,
    persistent: bool,
    relay: bool,
    debug_maps: bool,
    child: Option<ChildHandle>,
}

impl ForkServer {
    /// Take over the driver's descriptors.
    ///
    /// # Safety
    /// `channels.ctl` and `channels.st` must be open descriptors not owned by
    /// anybody else, they are closed when the server is dropped.
    pub unsafe fn from_channels(channels: Channels, config: &Config) -> Self {
        Self {
            ctl: File::from_raw_fd(channels.ctl),
            st: File::from_raw_fd(channels.st),
            tsl_slot: channels.tsl,
            persistent: config.is_persistent(),
            relay: !config.disable_cache,
            debug_maps: config.debug_maps,
            child: None,
        }
    }

    /// Serve the driver.
    ///
    /// Returns `ProcessRole::Child` in every forked child, which must go on
    /// running the target. Returns `ProcessRole::Controller` only if nobody
    /// listens on the status descriptor, the caller then runs the target
    /// once by itself. The controller never returns otherwise.
    pub fn run<E: TranslationEngine>(
        mut self,
        rt: &mut RuntimeState,
        engine: &mut E,
    ) -> Result<ProcessRole, FsrvError> {
        if self.debug_maps {
            match dump_maps() {
                Ok(maps) => log::info!("memory maps:\n{}", maps),
                Err(e) => log::warn!("failed to read maps: {}", e),
            }
        }

        let status = HandshakeStatus::new(rt.config().map_size, rt.shmem_fuzzing());
        log::debug!("sending status {:08x}", status.bits());
        if write_u32(&mut self.st, status.bits()).is_err() {
            log::info!("no fuzzer on the other side, running standalone");
            return Ok(ProcessRole::Controller);
        }

        if rt.shmem_fuzzing() {
            let opts = read_u32(&mut self.ctl).map_err(|_| FsrvError::PeerGone)?;
            if !accepts_shmem_input(opts) {
                return Err(FsrvError::ShmemInputUnsupported(opts));
            }
            rt.attach_input().map_err(FsrvError::InputShm)?;
        }

        let mut first_run = true;
        loop {
            let was_killed = read_u32(&mut self.ctl).map_err(|_| FsrvError::PeerGone)?;

            if was_killed != 0 {
                if let Some(child) = self.take_suspended() {
                    let pid = child.pid();
                    let status = child.reap().map_err(FsrvError::ReapKilled)?;
                    log::debug!("suspended child {} was killed: {}", pid, status.describe());
                }
            }

            let suspended = self.child.as_ref().map(|c| c.state) == Some(ChildState::Suspended);
            if suspended {
                if let Some(child) = self.child.as_mut() {
                    child.resume();
                }
            } else {
                // drop the finished handle before forking, its pipe must not leak.
                self.child = None;
                match self.fork_child()? {
                    Forked::Child(relay) => {
                        rt.enter_child(relay);
                        return Ok(ProcessRole::Child);
                    }
                    Forked::Parent(child) => self.child = Some(child),
                }
            }

            let child = match self.child.as_mut() {
                Some(child) => child,
                None => unreachable!("child handle set above"),
            };
            write_u32(&mut self.st, child.pid.as_raw() as u32).map_err(|_| FsrvError::WritePid)?;

            if let Some(relay) = child.relay.as_mut() {
                let stats = drain_relay(engine, relay);
                log::debug!(
                    "relay of {}: {} requests, {} translated, {} invalid, {} chained{}",
                    child.pid,
                    stats.requests,
                    stats.generated,
                    stats.invalid,
                    stats.chained,
                    if stats.end == RelayEnd::ExitMarker {
                        ", iteration done"
                    } else {
                        ""
                    }
                );
            }

            let status = child.wait(self.persistent).map_err(FsrvError::Wait)?;
            log::debug!("child {} {}", child.pid, status.describe());
            if !status.is_stopped() && first_run && self.persistent {
                return Err(FsrvError::NoPersistentIteration);
            }
            first_run = false;

            write_u32(&mut self.st, status.0 as u32).map_err(|_| FsrvError::WriteStatus)?;

            if child.state == ChildState::Terminated {
                self.child = None;
            }
        }
    }

    fn take_suspended(&mut self) -> Option<ChildHandle> {
        if self.child.as_ref().map(|c| c.state) == Some(ChildState::Suspended) {
            self.child.take()
        } else {
            None
        }
    }

    fn fork_child(&self) -> Result<Forked, FsrvError> {
        let relay = if self.relay {
            Some(self.open_relay().map_err(FsrvError::RelayPipe)?)
        } else {
            None
        };

        match unsafe { fork() }.map_err(FsrvError::Fork)? {
            ForkResult::Child => {
                if let Some(rd) = relay {
                    let _ = close(rd);
                }
                Ok(Forked::Child(relay.map(|_| self.tsl_slot)))
            }
            ForkResult::Parent { child } => {
                if relay.is_some() {
                    let _ = close(self.tsl_slot);
                }
                log::debug!("forked {}", child);
                Ok(Forked::Parent(ChildHandle {
                    pid: child,
                    relay: relay.map(|rd| unsafe { File::from_raw_fd(rd) }),
                    state: ChildState::Running,
                }))
            }
        }
    }

    /// Create the relay pipe with its write end at the fixed slot, returns the read end.
    fn open_relay(&self) -> Result<RawFd, Errno> {
        let (mut rd, wr) = pipe()?;
        if rd == self.tsl_slot {
            let moved = dup(rd)?;
            close(rd)?;
            rd = moved;
        }
        if wr != self.tsl_slot {
            dup2(wr, self.tsl_slot)?;
            close(wr)?;
        }
        Ok(rd)
    }
}
