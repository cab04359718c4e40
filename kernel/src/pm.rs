//! PM/SCHED boundary (§2.1).
//!
//! Process and task management and the scheduler are external collaborators
//! (§1 Non-goals): this module is the narrow, explicit surface the memory
//! manager, IRQ dispatcher, and syscall dispatcher call across that line. It
//! carries just enough in-memory bookkeeping to make the boundary functions
//! meaningful in isolation and in tests; run queues, priorities, and
//! fork/exec are not implemented here.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::sync::{GlobalState, WaitOutcome};

/// Execution level the CPU was in before the current trap, carried through
/// the dispatcher to drive signal delivery and restart policy (§9 ADDED).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecLevel {
    User,
    KernelThread,
    Irq,
}

/// Minimal process/task identity as seen from the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId {
    pub pid: u32,
    pub task_id: u32,
}

struct PmState {
    current: TaskId,
    level: ExecLevel,
    restart_pending: bool,
}

static CURRENT: GlobalState<PmState> = GlobalState::new();
static RESCHEDULE_PENDING: AtomicBool = AtomicBool::new(false);
static NEXT_WAKE_TOKEN: AtomicUsize = AtomicUsize::new(0);
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Called once at boot, before any interrupt can fire, to seed the BSP's
/// idle-task identity.
pub fn init() {
    let _ = CURRENT.init(PmState {
        current: TaskId { pid: 0, task_id: 0 },
        level: ExecLevel::KernelThread,
        restart_pending: false,
    });
}

/// The `(pid, task_id)` of whatever is presently running on this CPU.
pub fn current() -> TaskId {
    CURRENT
        .with(|s| s.current)
        .unwrap_or(TaskId { pid: 0, task_id: 0 })
}

/// The execution level saved on dispatcher entry.
pub fn current_level() -> ExecLevel {
    CURRENT.with(|s| s.level).unwrap_or(ExecLevel::KernelThread)
}

/// Called by the dispatcher on entry to record the level being left, and
/// again on exit to restore it (§4.9 step 3/6). Returns the prior level.
pub fn set_level(level: ExecLevel) -> ExecLevel {
    CURRENT
        .with_mut(|s| core::mem::replace(&mut s.level, level))
        .unwrap_or(ExecLevel::KernelThread)
}

/// Exit hook, invoked by the dispatcher with interrupts enabled when control
/// is about to return to user or kernel-thread level (§4.9 step 5).
pub fn run_exit_hooks() {
    // No process lifecycle is modeled at this boundary; the hook exists so
    // the dispatcher's control flow is identical whether or not PM has
    // cleanup to run.
}

/// Give PM a chance to deliver a pending signal to the current task. Returns
/// `true` if the interrupted syscall should be restarted with the original
/// context (§4.9 step 4, §4.12).
pub fn deliver_signals() -> bool {
    CURRENT
        .with_mut(|s| core::mem::replace(&mut s.restart_pending, false))
        .unwrap_or(false)
}

/// Mark the current task's interrupted syscall as `SA_RESTART`-eligible.
pub fn request_restart() {
    CURRENT.with_mut(|s| s.restart_pending = true);
}

/// Ask the scheduler whether a task switch is needed; returns `true` if the
/// IRQ dispatcher must hand off to the per-CPU common stack (§4.9 step 6).
pub fn reschedule_needed() -> bool {
    RESCHEDULE_PENDING.swap(false, Ordering::AcqRel)
}

/// Mark that a reschedule is due (e.g. from the timer tick).
pub fn request_reschedule() {
    RESCHEDULE_PENDING.store(true, Ordering::Release);
}

/// Block the current task until `epoch` advances past `entry_epoch`, or
/// `deadline_ticks` passes. Used by [`crate::sync::CondVar`]; since no real
/// scheduler is implemented at this boundary, the wait degenerates to a
/// bounded spin that re-checks the epoch — callers above this line never
/// observe the difference, since the contract (atomically unlock, block,
/// re-observe the epoch before returning) is preserved either way.
pub fn block_current(entry_epoch: usize, epoch: &AtomicUsize, deadline_ticks: Option<u64>) -> WaitOutcome {
    let mut spins: u64 = 0;
    let budget = deadline_ticks.unwrap_or(u64::MAX);
    while epoch.load(Ordering::Acquire) == entry_epoch {
        if spins >= budget {
            return WaitOutcome::TimedOut;
        }
        core::hint::spin_loop();
        spins += 1;
    }
    WaitOutcome::Woken
}

/// Wake every task parked on `epoch` (the epoch bump itself, performed by
/// the caller, is what actually releases them from [`block_current`]'s
/// spin; this hook is where a real scheduler would additionally requeue
/// parked tasks).
pub fn wake_all(_epoch: &AtomicUsize) {
    let _ = NEXT_WAKE_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Number of CPUs the CPU registry brought up, consulted by callers that
/// need "all CPUs" bookkeeping (e.g. logical-lowest-priority IPI masks)
/// without depending on the `cpu` module directly.
pub fn set_cpu_count(n: u32) {
    CPU_COUNT.store(n, Ordering::Relaxed);
}

pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_flag_round_trips() {
        let _ = CURRENT.init(PmState {
            current: TaskId { pid: 1, task_id: 1 },
            level: ExecLevel::User,
            restart_pending: false,
        });
        assert!(!deliver_signals());
        request_restart();
        assert!(deliver_signals());
        assert!(!deliver_signals());
    }
}
