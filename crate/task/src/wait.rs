//! Blocking and waking
//!
//! Synchronization primitives outside the task core (semaphores, mutexes,
//! message queues) are built on [`wait`] and the `wakeup_*` calls. The timer
//! collaborator drives [`timer_tick`], which ends [`sleep`]s.
//!
//! Lock order is kernel state first, then the wait queue.

use log::trace;
use spin::Mutex;

use crate::{
    ready_queue::TaskList,
    scheduler::{reschedule, schedule, with_scheduler, Scheduler},
    task::Home,
    KernelResult, TaskError, TaskId,
};

/// A queue of blocked tasks, usually a `static` owned by a primitive.
pub struct WaitQueue {
    pub(crate) list: Mutex<TaskList>,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue {
            list: Mutex::new(TaskList::EMPTY),
        }
    }

    /// Number of tasks blocked here
    pub fn len(&self) -> usize {
        interrupts::without_interrupts(|| self.list.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Which waiter a wakeup picks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePolicy {
    /// The longest waiting task
    Fifo,
    /// The most urgent task, longest waiting among equals
    Priority,
}

/// Blocks the current task on `queue` until a wakeup picks it.
///
/// Always gives up the processor, even if the task is woken right away.
/// A primitive that checks its condition inside
/// [`interrupts::without_interrupts`] can block from there without losing
/// a wakeup; the section is held again when the task resumes.
pub fn wait(queue: &'static WaitQueue) -> KernelResult<()> {
    block_current_on(Home::Waiting(queue), |s, index| {
        queue.list.lock().push_back(&mut s.tasks, index)
    })
}

/// Readies one waiter of `queue`. The woken task runs at the next
/// scheduling decision that favours it, never from inside this call.
pub fn wakeup_single(queue: &WaitQueue, policy: WakePolicy) -> Option<TaskId> {
    let woken = with_scheduler(|s| s.wake_one(queue, policy));
    if let Some(id) = woken {
        trace!("woke {}", id);
    }
    woken
}

/// Readies every waiter of `queue`, in the order `policy` dictates.
/// Returns how many woke.
pub fn wakeup_all(queue: &WaitQueue, policy: WakePolicy) -> usize {
    with_scheduler(|s| {
        let mut woken = 0;
        while s.wake_one(queue, policy).is_some() {
            woken += 1;
        }
        woken
    })
}

/// Blocks the current task for `ticks` timer ticks. `sleep(0)` just yields.
pub fn sleep(ticks: u64) -> KernelResult<()> {
    if ticks == 0 {
        with_scheduler(|s| s.current.ok_or(TaskError::NoCurrentTask))?;
        schedule();
        return Ok(());
    }
    block_current_on(Home::Sleeping, |s, index| {
        let deadline = s.ticks.saturating_add(ticks);
        s.tasks.at_mut(index).wake_at = deadline;
        s.sleepers.push_back(&mut s.tasks, index);
    })
}

/// Advances time by one tick and readies every sleeper that is due.
/// Called by the timer collaborator; returns how many tasks woke.
pub fn timer_tick() -> usize {
    with_scheduler(|s| {
        s.ticks += 1;
        s.wake_due()
    })
}

/// Ticks elapsed since `init`
pub fn ticks() -> u64 {
    with_scheduler(|s| s.ticks)
}

/// Ends a sleep early. Entry point for alarm callbacks.
pub fn wakeup_sleeping_task(id: TaskId) -> KernelResult<()> {
    with_scheduler(|s| {
        let tcb = s.tasks.get(id)?;
        if !matches!(tcb.home, Home::Sleeping) {
            return Err(tcb.invalid_state());
        }
        s.unlink(id.index());
        s.make_ready(id.index());
        Ok(())
    })
}

/// Moves the current task to `home`, lets `link` file its node there and
/// switches away. Returns once the task is readied and dispatched again.
fn block_current_on<F>(home: Home, link: F) -> KernelResult<()>
where
    F: FnOnce(&mut Scheduler, u32),
{
    interrupts::without_interrupts(|| {
        {
            let mut guard = Scheduler::get_scheduler();
            let scheduler = &mut *guard;
            let id = scheduler.block_current(home)?;
            link(scheduler, id.index());
            trace!("{} blocked", id);
        }
        // SAFETY: masked, guard dropped above.
        unsafe { reschedule() };
        Ok(())
    })
}
