//! Persistent mode: one child serves many runs without forking again.
//!
//! The emulator calls [`PersistentLoop::step`] every time the guest reaches
//! the persistent entry address. The first call only cleans up, later calls
//! mark the end of one run: the child stops itself and the controller resumes
//! it when the driver asks for the next run.
use crate::tsl::GuestUlong;
use crate::RuntimeState;

use std::ffi::c_void;
use std::io;
use std::mem;

use nix::libc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    FirstPass,
    Looping,
    Exhausted,
}

/// What the caller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    /// Run the target once more.
    Continue,
    /// Budget used up, the process must exit now.
    Exhausted,
}

/// How a child hands control back to the controller between runs.
pub trait Suspend {
    /// Block until the controller resumes us.
    fn suspend(&mut self) -> io::Result<()>;
}

/// Stop the whole process with `SIGSTOP`, returns after `SIGCONT`.
#[derive(Debug, Default)]
pub struct SelfStop;

impl Suspend for SelfStop {
    fn suspend(&mut self) -> io::Result<()> {
        signal_hook::low_level::raise(libc::SIGSTOP)
    }
}

/// Guest cpu state that survives between runs.
pub trait GuestCpu {
    type Regs: Clone;

    fn save_regs(&self) -> Self::Regs;

    fn restore_regs(&mut self, regs: &Self::Regs);

    /// Host address of guest address 0.
    fn guest_base(&self) -> u64 {
        0
    }

    /// Size of a guest word in bytes.
    fn word_bytes(&self) -> usize {
        mem::size_of::<GuestUlong>()
    }
}

/// Cpu without registers, for targets that need no snapshot.
#[derive(Debug, Default)]
pub struct NoCpu;

impl GuestCpu for NoCpu {
    type Regs = ();

    fn save_regs(&self) {}

    fn restore_regs(&mut self, _: &()) {}
}

#[derive(Debug)]
pub struct PersistentLoop<R> {
    phase: LoopPhase,
    /// Stops left, ignored when unlimited.
    remaining: u32,
    unlimited: bool,
    stack_offset: usize,
    saved_regs: Option<R>,
    stops: u64,
}

impl<R: Clone> Default for PersistentLoop<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone> PersistentLoop<R> {
    pub fn new() -> Self {
        Self {
            phase: LoopPhase::FirstPass,
            remaining: 0,
            unlimited: false,
            stack_offset: 0,
            saved_regs: None,
            stops: 0,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Stack adjustment applied when the return address is patched.
    pub fn stack_offset(&self) -> usize {
        self.stack_offset
    }

    /// Number of completed runs reported to the controller.
    pub fn stops(&self) -> u64 {
        self.stops
    }

    pub fn saved_regs(&self) -> Option<&R> {
        self.saved_regs.as_ref()
    }

    /// Advance the loop by one entry of the persistent address.
    pub fn step<C, S>(&mut self, rt: &mut RuntimeState, cpu: &mut C, suspend: &mut S) -> LoopStep
    where
        C: GuestCpu<Regs = R>,
        S: Suspend,
    {
        // standalone run, nobody to report to.
        if !rt.is_child() {
            return LoopStep::Continue;
        }
        // the controller only expects stops in persistent mode.
        let (count, save_gpr) = match rt.config().persistent.as_ref() {
            Some(p) => (p.count, p.save_gpr),
            None => return LoopStep::Continue,
        };

        match self.phase {
            LoopPhase::FirstPass => {
                self.first_pass(rt, cpu, count, save_gpr);
                LoopStep::Continue
            }
            LoopPhase::Looping => self.next_iteration(rt, cpu, suspend),
            LoopPhase::Exhausted => LoopStep::Exhausted,
        }
    }

    fn first_pass<C: GuestCpu<Regs = R>>(
        &mut self,
        rt: &mut RuntimeState,
        cpu: &mut C,
        count: u32,
        save_gpr: bool,
    ) {
        rt.reset_coverage();
        if save_gpr {
            self.saved_regs = Some(cpu.save_regs());
            self.run_hook(rt, cpu);
        }
        self.unlimited = count == 0;
        self.remaining = count;
        self.stack_offset = cpu.word_bytes();
        self.phase = LoopPhase::Looping;
        log::debug!(
            "persistent loop entered, budget: {}",
            if self.unlimited {
                "unlimited".to_string()
            } else {
                count.to_string()
            }
        );
    }

    fn next_iteration<C, S>(&mut self, rt: &mut RuntimeState, cpu: &mut C, suspend: &mut S) -> LoopStep
    where
        C: GuestCpu<Regs = R>,
        S: Suspend,
    {
        if !self.unlimited && self.remaining == 0 {
            return self.exhaust(rt);
        }
        self.remaining = self.remaining.saturating_sub(1);

        if !rt.has_hook() {
            if let Some(regs) = self.saved_regs.as_ref() {
                cpu.restore_regs(regs);
            }
        }

        if !rt.send_exit_marker() {
            log::debug!("relay gone, leaving persistent loop");
            return self.exhaust(rt);
        }
        if let Err(e) = suspend.suspend() {
            log::warn!("failed to stop: {}", e);
            return self.exhaust(rt);
        }
        self.stops += 1;

        self.run_hook(rt, cpu);
        rt.reset_coverage();
        LoopStep::Continue
    }

    fn run_hook<C: GuestCpu<Regs = R>>(&mut self, rt: &mut RuntimeState, cpu: &mut C) {
        if !rt.has_hook() {
            return;
        }
        if let Some(saved) = self.saved_regs.as_ref() {
            let mut regs = saved.clone();
            rt.run_hook(&mut regs as *mut R as *mut c_void, cpu.guest_base());
            cpu.restore_regs(&regs);
        }
    }

    fn exhaust(&mut self, rt: &mut RuntimeState) -> LoopStep {
        rt.coverage_mut().redirect_to_fallback();
        self.phase = LoopPhase::Exhausted;
        LoopStep::Exhausted
    }
}

/// Step the loop, exiting the process once it is exhausted.
pub fn persistent_loop<C, S>(
    lp: &mut PersistentLoop<C::Regs>,
    rt: &mut RuntimeState,
    cpu: &mut C,
    suspend: &mut S,
) where
    C: GuestCpu,
    S: Suspend,
{
    if lp.step(rt, cpu, suspend) == LoopStep::Exhausted {
        log::debug!("persistent loop exhausted after {} runs", lp.stops() + 1);
        std::process::exit(0);
    }
}
