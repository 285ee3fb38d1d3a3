use interrupts::Section;
use log::{debug, info, trace};
use spin::{Mutex, MutexGuard};

use crate::{
    config::{LOWEST_PRIORITY, MIN_STACK_SIZE},
    context_switch::{self, restore_context, ContextHandle, Frame, Saved},
    ready_queue::{ReadyQueue, TaskList},
    save_context,
    task::{Home, StackRegion, TaskInfo, TaskTable, Tcb},
    wait::{WaitQueue, WakePolicy},
    KernelResult, Priority, TaskEntry, TaskError, TaskId, TaskState,
};

/// Global scheduler so we can reach it from task code, the timer
/// collaborator and the wait primitives alike
static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Kernel state: every task, the containers they live in, and the one that
/// owns the processor. Only touched with interrupts masked.
pub(crate) struct Scheduler {
    initialized: bool,
    pub(crate) tasks: TaskTable,
    pub(crate) ready: ReadyQueue,
    pub(crate) sleepers: TaskList,
    pub(crate) current: Option<TaskId>,
    pub(crate) ticks: u64,
    /// Boot flow frozen by `start`, resumed by `shutdown`
    boot: Option<(ContextHandle, Section)>,
}

impl Scheduler {
    pub(crate) const fn new() -> Scheduler {
        Scheduler {
            initialized: false,
            tasks: TaskTable::new(),
            ready: ReadyQueue::new(),
            sleepers: TaskList::EMPTY,
            current: None,
            ticks: 0,
            boot: None,
        }
    }

    /// Get the scheduler from the static lock.
    ///
    /// Callers must already be inside a masked section.
    pub(crate) fn get_scheduler() -> MutexGuard<'static, Scheduler> {
        SCHEDULER.lock()
    }

    fn reset(&mut self) -> KernelResult<()> {
        if self.boot.is_some() {
            return Err(TaskError::AlreadyStarted);
        }
        self.teardown();
        self.ticks = 0;
        self.tasks.reserve()?;
        self.initialized = true;
        Ok(())
    }

    pub(crate) fn check_initialized(&self) -> KernelResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(TaskError::NotInitialized)
        }
    }

    /// Forgets every task, unlinking wait queues and retiring contexts.
    fn teardown(&mut self) {
        loop {
            let Some(id) = self.tasks.ids().next() else { break };
            self.unlink(id.index());
            if let Ok(tcb) = self.tasks.remove(id) {
                if let Some(context) = tcb.context {
                    context.retire();
                }
            }
        }
        self.ready.clear();
        self.sleepers = TaskList::EMPTY;
        self.current = None;
    }

    /// Takes the node out of whatever container holds it. The task ends up
    /// linked nowhere, with its home left for the caller to set.
    pub(crate) fn unlink(&mut self, index: u32) {
        let home = self.tasks.at(index).home;
        match home {
            Home::Ready => self.ready.remove(&mut self.tasks, index),
            Home::Waiting(queue) => queue.list.lock().remove(&mut self.tasks, index),
            Home::Sleeping => self.sleepers.remove(&mut self.tasks, index),
            Home::Current | Home::Held => {}
        }
    }

    /// Files a task that is linked nowhere at the tail of its bucket.
    pub(crate) fn make_ready(&mut self, index: u32) {
        let tcb = self.tasks.at_mut(index);
        debug_assert!(!tcb.node.is_queued(), "{} is still linked", tcb.id);
        tcb.home = Home::Ready;
        tcb.node.priority = tcb.priority;
        self.ready.push_back(&mut self.tasks, index);
    }

    /// Moves the current task to `home`. The caller links the node and then
    /// surrenders the processor.
    pub(crate) fn block_current(&mut self, home: Home) -> KernelResult<TaskId> {
        let id = self.current.ok_or(TaskError::NoCurrentTask)?;
        self.tasks.at_mut(id.index()).home = home;
        Ok(id)
    }

    /// Files the outgoing task's frozen context and masking state. A task
    /// that blocked itself stays where it went; one that merely yielded goes
    /// back to the ready queue behind its peers.
    fn park(&mut self, id: TaskId, context: ContextHandle, section: Section) {
        let tcb = self.tasks.at_mut(id.index());
        tcb.context = Some(context);
        tcb.section = section;
        if let Home::Current = tcb.home {
            self.make_ready(id.index());
        }
    }

    /// Makes the most urgent ready task current and hands back its context
    /// along with the masking state it has to resume in.
    fn pick_next(&mut self) -> Option<(ContextHandle, Section)> {
        let index = self.ready.pop_highest(&mut self.tasks)?;
        let tcb = self.tasks.at_mut(index);
        tcb.home = Home::Current;
        self.current = Some(tcb.id);
        trace!(
            "dispatching {} at {}, {} more ready",
            tcb.id,
            tcb.priority,
            self.ready.len()
        );
        let context = tcb
            .context
            .take()
            .expect("ready task without a saved context");
        Some((context, tcb.section))
    }

    /// Returns whether the caller suspended itself and must switch away.
    fn suspend(&mut self, id: TaskId) -> KernelResult<bool> {
        self.check_initialized()?;
        let tcb = self.tasks.get(id)?;
        let switch = match tcb.home {
            Home::Ready => false,
            Home::Current => true,
            _ => return Err(tcb.invalid_state()),
        };
        self.unlink(id.index());
        self.tasks.at_mut(id.index()).home = Home::Held;
        Ok(switch)
    }

    fn check_startable(&self) -> KernelResult<()> {
        self.check_initialized()?;
        if self.boot.is_some() || self.current.is_some() {
            return Err(TaskError::AlreadyStarted);
        }
        if !self.ready.is_ready(Priority::LOWEST) {
            return Err(TaskError::NoIdleTask);
        }
        Ok(())
    }

    /// Removes the first waiter `policy` selects and makes it ready.
    pub(crate) fn wake_one(&mut self, queue: &WaitQueue, policy: WakePolicy) -> Option<TaskId> {
        let index = {
            let mut list = queue.list.lock();
            let index = match policy {
                WakePolicy::Fifo => list.front()?,
                WakePolicy::Priority => list
                    .iter(&self.tasks)
                    .min_by_key(|&i| self.tasks.at(i).priority)?,
            };
            list.remove(&mut self.tasks, index);
            index
        };
        self.make_ready(index);
        Some(self.tasks.at(index).id)
    }

    /// Readies every sleeper whose deadline has passed, oldest sleeper
    /// first. Returns how many woke.
    pub(crate) fn wake_due(&mut self) -> usize {
        let now = self.ticks;
        let mut woken = 0;
        loop {
            let due = self
                .sleepers
                .iter(&self.tasks)
                .find(|&i| self.tasks.at(i).wake_at <= now);
            let Some(index) = due else { break };
            self.sleepers.remove(&mut self.tasks, index);
            self.make_ready(index);
            woken += 1;
        }
        woken
    }
}

/// Runs `f` on the kernel state with interrupts masked
pub(crate) fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    interrupts::without_interrupts(|| f(&mut Scheduler::get_scheduler()))
}

/// Resets the task core. Any task left over from a previous run is dropped
/// without being resumed.
pub fn init() -> KernelResult<()> {
    with_scheduler(Scheduler::reset)?;
    info!(
        "task core ready: {} priority levels, {} task slots",
        LOWEST_PRIORITY as usize + 1,
        crate::config::MAX_TASKS
    );
    Ok(())
}

/// Creates a ready task that will run `entry(arg)` on `stack`.
///
/// The block belongs to the task until `destroy_task` hands it back.
pub fn create_task(
    stack: &'static mut [u8],
    entry: TaskEntry,
    arg: usize,
    priority: u8,
) -> KernelResult<TaskId> {
    let priority = Priority::new(priority)?;
    let required = MIN_STACK_SIZE.max(context_switch::required_stack_size());
    if stack.len() < required {
        return Err(TaskError::StackTooSmall {
            provided: stack.len(),
            required,
        });
    }

    with_scheduler(|s| {
        s.check_initialized()?;
        let id = s.tasks.vacant()?;
        // SAFETY: the block is 'static and owned by the task from here on.
        let context =
            unsafe { context_switch::create_context(stack, task_bootstrap, id.index() as usize) }?;
        let stack = StackRegion::new(stack);
        debug!(
            "created {} at {} on {} bytes of stack ({} live)",
            id,
            priority,
            stack.len(),
            s.tasks.len() + 1
        );
        s.tasks.insert(Tcb::new(id, priority, context, entry, arg, stack));
        s.make_ready(id.index());
        Ok(id)
    })
}

/// Removes a task that is not running and hands its stack back.
pub fn destroy_task(id: TaskId) -> KernelResult<&'static mut [u8]> {
    with_scheduler(|s| {
        s.check_initialized()?;
        let tcb = s.tasks.get(id)?;
        if let Home::Current = tcb.home {
            return Err(tcb.invalid_state());
        }
        s.unlink(id.index());
        let tcb = s.tasks.remove(id)?;
        if let Some(context) = tcb.context {
            context.retire();
        }
        debug!("destroyed {}", id);
        // SAFETY: the context on the block was just retired.
        Ok(unsafe { tcb.stack.into_block() })
    })
}

/// Gives up the processor to the most urgent ready task.
///
/// A running task that is still runnable goes behind its peers of the same
/// priority, so a yield only switches if someone else is ready at least as
/// urgently. Outside of task context this does nothing.
///
/// May be called inside a masked section: the task gets its section back
/// when it resumes, while the next task runs in its own.
pub fn schedule() {
    interrupts::without_interrupts(|| {
        // SAFETY: masked, and no guard is alive in this closure.
        unsafe { reschedule() }
    })
}

/// Switches away from the current task and dispatches the next one.
///
/// Returns once the current task is resumed. Without a current task (the
/// boot flow before `start`) it does nothing.
///
/// # Safety
/// Must run inside a masked section and with no lock guard alive on the
/// caller's stack.
pub(crate) unsafe fn reschedule() {
    debug_assert!(interrupts::are_masked(), "switching with interrupts unmasked");

    let mut frame = Frame::EMPTY;
    let outgoing = Scheduler::get_scheduler().current;
    let Some(id) = outgoing else { return };

    match save_context!(frame) {
        Saved::Resumed => return,
        Saved::Suspended(context) => {
            let section = interrupts::current_section();
            Scheduler::get_scheduler().park(id, context, section)
        }
    }

    dispatch();
    panic!("{} blocked with no task ready, idle task missing", id);
}

/// Restores the most urgent ready task in its own masking state. Returns
/// only if none is ready.
unsafe fn dispatch() {
    let next = Scheduler::get_scheduler().pick_next();
    if let Some((context, section)) = next {
        interrupts::switch_section(section);
        restore_context(context);
    }
}

/// First code every task runs, on its own stack
extern "C" fn task_bootstrap(slot: usize) -> ! {
    let (entry, arg) = {
        let scheduler = Scheduler::get_scheduler();
        let tcb = scheduler.tasks.at(slot as u32);
        (tcb.entry, tcb.arg)
    };
    // Leave the section inherited from the dispatcher.
    // SAFETY: dispatch installed `Section::FRESH`, one level for us.
    unsafe { interrupts::release() };
    entry(arg)
}

/// Hands the processor to the task scheduler.
///
/// Requires an idle task ready at the lowest priority. The boot flow sleeps
/// here until some task calls [`shutdown`].
pub fn start() -> KernelResult<()> {
    let mut frame = Frame::EMPTY;

    // SAFETY: released below on every path; `shutdown` reinstates this level.
    unsafe { interrupts::hold() };
    let startable = Scheduler::get_scheduler().check_startable();
    if let Err(err) = startable {
        unsafe { interrupts::release() };
        return Err(err);
    }

    match unsafe { save_context!(frame) } {
        Saved::Resumed => {
            // The boot section, as `shutdown` reinstated it.
            unsafe { interrupts::release() };
            info!("scheduler stopped");
            return Ok(());
        }
        Saved::Suspended(context) => {
            let section = interrupts::current_section();
            Scheduler::get_scheduler().boot = Some((context, section));
        }
    }

    info!("scheduler started");
    unsafe { dispatch() };
    panic!("idle task vanished before the first dispatch");
}

/// Stops scheduling, drops every task and resumes the boot flow inside
/// [`start`].
///
/// # Panics
/// If the scheduler was never started.
pub fn shutdown() -> ! {
    // SAFETY: the boot section replaces ours before the switch.
    unsafe { interrupts::hold() };
    let boot = {
        let mut scheduler = Scheduler::get_scheduler();
        scheduler.teardown();
        scheduler.boot.take()
    };
    match boot {
        // SAFETY: the boot frame lives in `start`, which has not returned.
        // Whatever sections the task held are dropped with it.
        Some((context, section)) => unsafe {
            interrupts::switch_section(section);
            restore_context(context)
        },
        None => panic!("shutdown without a running scheduler"),
    }
}

/// The task owning the processor, `None` outside of task context
pub fn get_current_task() -> Option<TaskId> {
    with_scheduler(|s| s.current)
}

/// Most urgent level with a ready task
pub fn highest_ready_priority() -> Option<Priority> {
    with_scheduler(|s| s.ready.highest_ready_priority())
}

/// Sets a task's priority. Never preempts.
///
/// A ready task moves to the tail of its new bucket. A waiting task keeps
/// its place in the wait queue; priority wakeups read the new value.
pub fn change_priority(id: TaskId, priority: u8) -> KernelResult<()> {
    let priority = Priority::new(priority)?;
    with_scheduler(|s| {
        s.check_initialized()?;
        let tcb = s.tasks.get_mut(id)?;
        let old = core::mem::replace(&mut tcb.priority, priority);
        if let Home::Ready = tcb.home {
            s.ready.remove(&mut s.tasks, id.index());
            s.make_ready(id.index());
        }
        debug!("{} priority {} -> {}", id, old, priority);
        Ok(())
    })
}

pub fn get_priority(id: TaskId) -> KernelResult<Priority> {
    with_scheduler(|s| Ok(s.tasks.get(id)?.priority))
}

/// Records the task's nominal period in ticks. Metadata only.
pub fn set_period(id: TaskId, period: Option<u32>) -> KernelResult<()> {
    with_scheduler(|s| {
        s.tasks.get_mut(id)?.period = period;
        Ok(())
    })
}

pub fn get_period(id: TaskId) -> KernelResult<Option<u32>> {
    with_scheduler(|s| Ok(s.tasks.get(id)?.period))
}

/// Takes a task off the processor until [`resume_task`].
///
/// A ready task leaves its bucket. The current task may suspend itself and
/// gives up the processor. Blocked tasks cannot be suspended.
pub fn suspend_task(id: TaskId) -> KernelResult<()> {
    interrupts::without_interrupts(|| {
        let switch = Scheduler::get_scheduler().suspend(id)?;
        debug!("suspended {}", id);
        if switch {
            // SAFETY: masked, guard dropped above.
            unsafe { reschedule() };
        }
        Ok(())
    })
}

/// Puts a suspended task back at the tail of its ready bucket. It runs at
/// the next scheduling decision that favours it.
pub fn resume_task(id: TaskId) -> KernelResult<()> {
    with_scheduler(|s| {
        s.check_initialized()?;
        let tcb = s.tasks.get(id)?;
        if !matches!(tcb.home, Home::Held) {
            return Err(tcb.invalid_state());
        }
        s.make_ready(id.index());
        debug!("resumed {}", id);
        Ok(())
    })
}

pub fn task_info(id: TaskId) -> KernelResult<TaskInfo> {
    with_scheduler(|s| Ok(s.tasks.get(id)?.info()))
}

/// Prints the frozen registers of a task that is not running.
pub fn dump_context(id: TaskId) -> KernelResult<()> {
    with_scheduler(|s| {
        let tcb = s.tasks.get(id)?;
        match &tcb.context {
            Some(context) => {
                printer::println!(
                    "{} frame @ {:#x}, resumes at {:#x}",
                    id,
                    context.addr(),
                    context.frame().program_counter()
                );
                printer::println!("{}", context.frame());
                Ok(())
            }
            None => Err(TaskError::InvalidState {
                task: id,
                state: TaskState::Running,
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, vec, vec::Vec};

    fn spin(_: usize) -> ! {
        loop {}
    }

    /// Builds a scheduler holding tasks at `levels` without running anything.
    fn populated(levels: &[u8]) -> (Scheduler, Vec<TaskId>) {
        let mut s = Scheduler::new();
        s.reset().unwrap();
        let ids = levels
            .iter()
            .map(|&level| {
                let id = s.tasks.vacant().unwrap();
                let stack: &'static mut [u8] = Box::leak(vec![0u8; 4096].into_boxed_slice());
                let context =
                    unsafe { context_switch::create_context(stack, task_bootstrap, 0) }.unwrap();
                s.tasks.insert(Tcb::new(
                    id,
                    Priority::new(level).unwrap(),
                    context,
                    spin,
                    0,
                    StackRegion::new(stack),
                ));
                s.make_ready(id.index());
                id
            })
            .collect();
        (s, ids)
    }

    fn dispatch_order(s: &mut Scheduler) -> Vec<TaskId> {
        let mut order = Vec::new();
        while let Some((context, _)) = s.pick_next() {
            let id = s.current.unwrap();
            s.tasks.at_mut(id.index()).home = Home::Held;
            context.retire();
            order.push(id);
        }
        order
    }

    #[test]
    fn picks_most_urgent_then_fifo() {
        let (mut s, ids) = populated(&[4, 2, 4, 2]);
        assert_eq!(
            s.ready.highest_ready_priority(),
            Some(Priority::new(2).unwrap())
        );
        assert_eq!(dispatch_order(&mut s), [ids[1], ids[3], ids[0], ids[2]]);
    }

    #[test]
    fn yielding_task_goes_behind_its_peers() {
        let (mut s, ids) = populated(&[1, 1]);
        let (context, section) = s.pick_next().unwrap();
        assert_eq!(section, Section::FRESH);
        assert_eq!(s.current, Some(ids[0]));
        assert_eq!(s.tasks.at(ids[0].index()).state(), TaskState::Running);

        s.park(ids[0], context, section);
        assert_eq!(s.tasks.at(ids[0].index()).state(), TaskState::Ready);
        assert_eq!(dispatch_order(&mut s), [ids[1], ids[0]]);
    }

    #[test]
    fn blocked_task_is_not_requeued() {
        let (mut s, ids) = populated(&[1]);
        let (context, section) = s.pick_next().unwrap();
        s.block_current(Home::Held).unwrap();
        s.park(ids[0], context, section);
        assert_eq!(s.ready.len(), 0);
        assert!(s.pick_next().is_none());
    }

    #[test]
    fn priority_change_moves_to_the_new_tail() {
        let (mut s, ids) = populated(&[3, 5]);
        let tcb = s.tasks.get_mut(ids[0]).unwrap();
        tcb.priority = Priority::new(5).unwrap();
        s.ready.remove(&mut s.tasks, ids[0].index());
        s.make_ready(ids[0].index());
        assert_eq!(dispatch_order(&mut s), [ids[1], ids[0]]);
    }

    #[test]
    fn due_sleepers_wake_in_order() {
        let (mut s, ids) = populated(&[2, 2, 2]);
        for (id, deadline) in ids.iter().zip([3, 1, 2]) {
            s.ready.remove(&mut s.tasks, id.index());
            let tcb = s.tasks.at_mut(id.index());
            tcb.home = Home::Sleeping;
            tcb.wake_at = deadline;
            s.sleepers.push_back(&mut s.tasks, id.index());
        }
        s.ticks = 2;
        assert_eq!(s.wake_due(), 2);
        assert_eq!(s.sleepers.len(), 1);
        assert_eq!(dispatch_order(&mut s), [ids[1], ids[2]]);
    }

    #[test]
    fn priority_wakeup_takes_the_most_urgent_waiter() {
        static QUEUE: WaitQueue = WaitQueue::new();
        let (mut s, ids) = populated(&[6, 2, 2, 4]);
        for id in &ids {
            s.ready.remove(&mut s.tasks, id.index());
            s.tasks.at_mut(id.index()).home = Home::Waiting(&QUEUE);
            QUEUE.list.lock().push_back(&mut s.tasks, id.index());
        }

        assert_eq!(s.wake_one(&QUEUE, WakePolicy::Priority), Some(ids[1]));
        assert_eq!(s.wake_one(&QUEUE, WakePolicy::Fifo), Some(ids[0]));
        assert_eq!(s.wake_one(&QUEUE, WakePolicy::Priority), Some(ids[2]));
        assert_eq!(QUEUE.list.lock().len(), 1);
        assert_eq!(s.tasks.at(ids[1].index()).state(), TaskState::Ready);

        s.teardown();
        assert!(QUEUE.list.lock().is_empty());
    }

    #[test]
    fn start_needs_an_idle_task() {
        let (s, _) = populated(&[0, 10]);
        assert_eq!(s.check_startable(), Err(TaskError::NoIdleTask));
        let (s, _) = populated(&[0, LOWEST_PRIORITY]);
        assert_eq!(s.check_startable(), Ok(()));
        assert_eq!(Scheduler::new().check_startable(), Err(TaskError::NotInitialized));
    }

    #[test]
    fn teardown_empties_everything() {
        let (mut s, ids) = populated(&[0, 1, 2]);
        s.teardown();
        assert_eq!(s.tasks.len(), 0);
        assert_eq!(s.ready.highest_ready_priority(), None);
        assert!(ids.iter().all(|&id| s.tasks.get(id).is_err()));
    }
}
