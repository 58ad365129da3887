//! Drive a real controller process over pipes, the way a fuzzer does.
use qafl::config::{AddrRange, Config, PersistentConfig};
use qafl::cover::CoverageMap;
use qafl::engine::MemEngine;
use qafl::fsrv::{Channels, ForkServer, FS_OPT_ENABLED, FS_OPT_SHDMEM_FUZZ, TSL_FD};
use qafl::hook::PersistentHook;
use qafl::persistent::{LoopStep, NoCpu, PersistentLoop, SelfStop};
use qafl::shm::{ShmRegion, INPUT_LEN_SIZE, MAX_INPUT_SIZE};
use qafl::tsl::{BlockKey, TranslationEngine};
use qafl::utils::{read_u32, write_u32};
use qafl::{exit_code, RuntimeState};

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::process::Command;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, pipe, ForkResult, Pid};

// forking tests must not inherit each other's pipes.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn key(pc: u64) -> BlockKey {
    BlockKey::new(pc, 0, 0)
}

fn persistent(count: u32) -> Config {
    let mut p = PersistentConfig::new(0x1000);
    p.count = count;
    Config {
        persistent: Some(p),
        ..Default::default()
    }
}

/// Hook asking for the test case through shared memory.
struct ShmInputHook;

impl PersistentHook for ShmInputHook {
    fn init(&mut self) -> bool {
        true
    }

    fn run(&mut self, _: *mut c_void, _: u64, _: &[u8]) {}
}

/// Body of the controller process, `target` runs in every child.
fn controller<F>(ctl: RawFd, st: RawFd, config: Config, shm_input: bool, target: F) -> !
where
    F: FnOnce(&mut RuntimeState, &mut MemEngine) -> i32,
{
    let code = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut engine = MemEngine::new(vec![AddrRange::new(0x1000, 0x2000)]);
        let mut rt = RuntimeState::new(config.clone(), CoverageMap::private(config.map_size));
        if shm_input {
            rt.set_hook(Box::new(ShmInputHook));
        }
        let channels = Channels { ctl, st, tsl: TSL_FD };
        let server = unsafe { ForkServer::from_channels(channels, &config) };
        match server.run(&mut rt, &mut engine) {
            Ok(_) => target(&mut rt, &mut engine),
            Err(e) => e.exit_code(),
        }
    }))
    .unwrap_or(101);
    unsafe { libc::_exit(code) }
}

struct Driver {
    ctl: Option<File>,
    st: File,
    controller: Pid,
}

impl Driver {
    fn spawn<F>(config: Config, target: F) -> Self
    where
        F: FnOnce(&mut RuntimeState, &mut MemEngine) -> i32,
    {
        Self::spawn_with(config, false, target)
    }

    fn spawn_with<F>(config: Config, shm_input: bool, target: F) -> Self
    where
        F: FnOnce(&mut RuntimeState, &mut MemEngine) -> i32,
    {
        let (ctl_r, ctl_w) = pipe().unwrap();
        let (st_r, st_w) = pipe().unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let _ = close(ctl_w);
                let _ = close(st_r);
                controller(ctl_r, st_w, config, shm_input, target)
            }
            ForkResult::Parent { child } => {
                close(ctl_r).unwrap();
                close(st_w).unwrap();
                Driver {
                    ctl: Some(unsafe { File::from_raw_fd(ctl_w) }),
                    st: unsafe { File::from_raw_fd(st_r) },
                    controller: child,
                }
            }
        }
    }

    fn handshake(&mut self) -> u32 {
        read_u32(&mut self.st).unwrap()
    }

    /// Answer the handshake with the options the driver supports.
    fn echo(&mut self, opts: u32) {
        write_u32(self.ctl.as_mut().unwrap(), opts).unwrap();
    }

    fn request(&mut self, was_killed: u32) -> Pid {
        write_u32(self.ctl.as_mut().unwrap(), was_killed).unwrap();
        Pid::from_raw(read_u32(&mut self.st).unwrap() as i32)
    }

    fn status(&mut self) -> i32 {
        read_u32(&mut self.st).unwrap() as i32
    }

    fn run(&mut self, was_killed: u32) -> (Pid, i32) {
        let pid = self.request(was_killed);
        (pid, self.status())
    }

    /// Close the control pipe and collect the controller.
    fn finish(mut self) -> WaitStatus {
        self.ctl = None;
        waitpid(self.controller, None).unwrap()
    }
}

fn exited(status: i32) -> Option<i32> {
    if libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else {
        None
    }
}

fn stopped(status: i32) -> bool {
    libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) == libc::SIGSTOP
}

#[test]
fn relays_pid_and_status() {
    let _g = serial();
    let mut drv = Driver::spawn(Config::default(), |_, _| 3);
    assert_eq!(drv.handshake() & FS_OPT_ENABLED, FS_OPT_ENABLED);

    let (p1, st1) = drv.run(0);
    assert_ne!(p1, drv.controller);
    assert_eq!(exited(st1), Some(3));
    let (p2, st2) = drv.run(0);
    assert_ne!(p1, p2);
    assert_eq!(exited(st2), Some(3));

    let controller = drv.controller;
    assert_eq!(
        drv.finish(),
        WaitStatus::Exited(controller, exit_code::CTL_CLOSED)
    );
}

#[test]
fn signals_relayed_untouched() {
    let _g = serial();
    let mut drv = Driver::spawn(Config::default(), |_, _| {
        unsafe { libc::raise(libc::SIGSEGV) };
        0
    });
    drv.handshake();
    let (_, st) = drv.run(0);
    assert!(libc::WIFSIGNALED(st));
    assert_eq!(libc::WTERMSIG(st), libc::SIGSEGV);
    drv.finish();
}

#[test]
fn cache_warms_next_child() {
    let _g = serial();
    // every child reports what it inherited: blocks synthesized so far, +10 if chained.
    let mut drv = Driver::spawn(Config::default(), |rt, engine| {
        let generated = engine.generated() as i32;
        let chained = match (engine.lookup(&key(0x1000), 0), engine.lookup(&key(0x1100), 0)) {
            (Some(a), Some(b)) => engine.successor(a, 0) == Some(b),
            _ => false,
        };
        rt.request_translation(key(0x1000), 0, None);
        if generated >= 1 {
            rt.request_translation(key(0x1100), 0, Some((key(0x1000), 0)));
        }
        // never valid, must be skipped
        rt.request_translation(key(0x9000), 0, None);
        generated + if chained { 10 } else { 0 }
    });
    drv.handshake();

    let codes: Vec<_> = (0..4).map(|_| exited(drv.run(0).1).unwrap()).collect();
    assert_eq!(codes, vec![0, 1, 12, 12]);
    drv.finish();
}

#[test]
fn disabled_cache_stays_cold() {
    let _g = serial();
    let config = Config {
        disable_cache: true,
        ..Default::default()
    };
    let mut drv = Driver::spawn(config, |rt, engine| {
        rt.request_translation(key(0x1000), 0, None);
        engine.generated() as i32
    });
    drv.handshake();
    assert_eq!(exited(drv.run(0).1), Some(0));
    assert_eq!(exited(drv.run(0).1), Some(0));
    drv.finish();
}

fn persistent_target(rt: &mut RuntimeState, _: &mut MemEngine) -> i32 {
    let mut lp = PersistentLoop::new();
    loop {
        match lp.step(rt, &mut NoCpu, &mut SelfStop) {
            LoopStep::Continue => {
                assert_eq!(rt.coverage().as_slice()[0], 1);
                rt.trace_block(0x1000);
                rt.request_translation(key(0x1000), 0, None);
            }
            LoopStep::Exhausted => return 0,
        }
    }
}

#[test]
fn persistent_child_is_resumed() {
    let _g = serial();
    let mut drv = Driver::spawn(persistent(3), persistent_target);
    drv.handshake();

    let (pid, st) = drv.run(0);
    assert!(stopped(st));
    for _ in 0..2 {
        let (p, st) = drv.run(0);
        assert_eq!(p, pid);
        assert!(stopped(st));
    }
    let (p, st) = drv.run(0);
    assert_eq!(p, pid);
    assert_eq!(exited(st), Some(0));

    // budget used up, the next run gets a fresh child
    let (fresh, st) = drv.run(0);
    assert_ne!(fresh, pid);
    assert!(stopped(st));

    let _ = kill(fresh, Signal::SIGKILL);
    drv.finish();
}

#[test]
fn killed_suspended_child_is_replaced() {
    let _g = serial();
    let mut drv = Driver::spawn(persistent(10), persistent_target);
    drv.handshake();

    let (pid, st) = drv.run(0);
    assert!(stopped(st));
    // the driver timed out and killed it, just as it stopped
    kill(pid, Signal::SIGKILL).unwrap();
    let (fresh, st) = drv.run(1);
    assert_ne!(fresh, pid);
    assert!(stopped(st));

    let _ = kill(fresh, Signal::SIGKILL);
    drv.finish();
}

#[test]
fn persistent_without_iteration_is_fatal() {
    let _g = serial();
    let mut drv = Driver::spawn(persistent(10), |_, _| 0);
    drv.handshake();
    drv.request(0);
    assert!(read_u32(&mut drv.st).is_err());
    let controller = drv.controller;
    assert_eq!(
        drv.finish(),
        WaitStatus::Exited(controller, exit_code::NO_PERSISTENT_ITER)
    );
}

#[test]
fn standalone_without_driver() {
    let _g = serial();
    let (ctl_r, ctl_w) = pipe().unwrap();
    // every write to /dev/full fails
    let full = OpenOptions::new().write(true).open("/dev/full").unwrap();
    let st = full.into_raw_fd();
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let _ = close(ctl_w);
            controller(ctl_r, st, Config::default(), false, |rt, _| {
                if rt.is_child() {
                    1
                } else {
                    42
                }
            })
        }
        ForkResult::Parent { child } => {
            close(ctl_r).unwrap();
            close(st).unwrap();
            // no token is ever sent, the target still runs exactly once.
            assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 42));
            close(ctl_w).unwrap();
        }
    }
}

/// Input segment the driver owns, removed on drop.
struct InputSegment {
    id: i32,
}

impl InputSegment {
    fn with_input(input: &[u8]) -> Self {
        let size = INPUT_LEN_SIZE + MAX_INPUT_SIZE;
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        assert!(id >= 0);
        let mut region = ShmRegion::attach(&id.to_string(), size).unwrap();
        let buf = region.as_mut_slice();
        buf[..INPUT_LEN_SIZE].copy_from_slice(&(input.len() as u32).to_ne_bytes());
        buf[INPUT_LEN_SIZE..INPUT_LEN_SIZE + input.len()].copy_from_slice(input);
        InputSegment { id }
    }

    fn config(&self) -> Config {
        Config {
            shm_fuzz_id: Some(self.id.to_string()),
            ..Default::default()
        }
    }
}

impl Drop for InputSegment {
    fn drop(&mut self) {
        unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) };
    }
}

#[test]
fn shm_input_reaches_child() {
    let _g = serial();
    let seg = InputSegment::with_input(b"hello");
    let mut drv = Driver::spawn_with(seg.config(), true, |rt, _| {
        if rt.input_bytes() == b"hello" {
            0
        } else {
            1
        }
    });
    let status = drv.handshake();
    assert_eq!(status & FS_OPT_SHDMEM_FUZZ, FS_OPT_SHDMEM_FUZZ);
    drv.echo(FS_OPT_ENABLED | FS_OPT_SHDMEM_FUZZ);

    assert_eq!(exited(drv.run(0).1), Some(0));
    assert_eq!(exited(drv.run(0).1), Some(0));
    let controller = drv.controller;
    assert_eq!(
        drv.finish(),
        WaitStatus::Exited(controller, exit_code::CTL_CLOSED)
    );
}

#[test]
fn shm_input_refused_by_driver() {
    let _g = serial();
    let seg = InputSegment::with_input(b"hello");
    let mut drv = Driver::spawn_with(seg.config(), true, |_, _| 0);
    drv.handshake();
    // a driver without shm support echoes only the base flag.
    drv.echo(FS_OPT_ENABLED);
    assert!(read_u32(&mut drv.st).is_err());
    let controller = drv.controller;
    assert_eq!(
        drv.finish(),
        WaitStatus::Exited(controller, exit_code::SHM)
    );
}

#[test]
fn target_gets_default_sigpipe() {
    let _g = serial();
    // no driver descriptors, the binary runs the command once on its own.
    let out = Command::new(env!("CARGO_BIN_EXE_qafl-fsrv"))
        .args(&["cat", "/proc/self/status"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let status = String::from_utf8_lossy(&out.stdout);
    let ignored = status
        .lines()
        .find_map(|l| l.strip_prefix("SigIgn:"))
        .map(|mask| u64::from_str_radix(mask.trim(), 16).unwrap())
        .unwrap();
    assert_eq!(ignored & (1 << (libc::SIGPIPE - 1)), 0);
}
