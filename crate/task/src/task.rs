//! Task control blocks and the table that owns them

use alloc::vec::Vec;
use core::ptr::NonNull;

use interrupts::Section;

use crate::{
    config::MAX_TASKS,
    context_switch::ContextHandle,
    ready_queue::{Node, NodeArena},
    wait::WaitQueue,
    KernelResult, Priority, TaskEntry, TaskError, TaskId, TaskState,
};

/// The container a task's node currently belongs to.
///
/// Exactly one at any time; the task's [`TaskState`] is derived from it.
#[derive(Clone, Copy)]
pub(crate) enum Home {
    /// The current task, linked nowhere
    Current,
    /// Its priority bucket in the ready queue
    Ready,
    /// A wait queue
    Waiting(&'static WaitQueue),
    /// The timer's sleep list
    Sleeping,
    /// Suspended; held by the table slot alone
    Held,
}

/// Where a task is, as seen from outside the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    Current,
    Ready,
    Waiting,
    Sleeping,
    Suspended,
}

/// Snapshot returned by `task_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub state: TaskState,
    pub priority: Priority,
    pub period: Option<u32>,
    pub residence: Residence,
}

/// Stack block lent to a task for its whole lifetime
pub(crate) struct StackRegion(NonNull<[u8]>);

// SAFETY: the block is `'static` memory handed over by `create_task` and is
// only ever touched from the one core the kernel runs on.
unsafe impl Send for StackRegion {}

impl StackRegion {
    pub(crate) fn new(block: &'static mut [u8]) -> StackRegion {
        StackRegion(NonNull::from(block))
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// Hands the block back.
    ///
    /// # Safety
    /// No context may run on the block any more.
    pub(crate) unsafe fn into_block(self) -> &'static mut [u8] {
        &mut *self.0.as_ptr()
    }
}

/// Task control block
pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) home: Home,
    pub(crate) priority: Priority,
    pub(crate) period: Option<u32>,
    /// Frozen context; `None` exactly while the task runs
    pub(crate) context: Option<ContextHandle>,
    /// Masked-section state the task blocked in, reinstated on dispatch
    pub(crate) section: Section,
    pub(crate) node: Node,
    /// Tick at which a sleeping task becomes ready again
    pub(crate) wake_at: u64,
    pub(crate) entry: TaskEntry,
    pub(crate) arg: usize,
    pub(crate) stack: StackRegion,
}

impl Tcb {
    pub(crate) fn new(
        id: TaskId,
        priority: Priority,
        context: ContextHandle,
        entry: TaskEntry,
        arg: usize,
        stack: StackRegion,
    ) -> Tcb {
        Tcb {
            id,
            // Not linked yet; the creator files it.
            home: Home::Held,
            priority,
            period: None,
            context: Some(context),
            section: Section::FRESH,
            node: Node::new(priority),
            wake_at: 0,
            entry,
            arg,
            stack,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        match self.home {
            Home::Current => TaskState::Running,
            Home::Ready => TaskState::Ready,
            Home::Waiting(_) | Home::Sleeping | Home::Held => TaskState::Waiting,
        }
    }

    pub(crate) fn residence(&self) -> Residence {
        match self.home {
            Home::Current => Residence::Current,
            Home::Ready => Residence::Ready,
            Home::Waiting(_) => Residence::Waiting,
            Home::Sleeping => Residence::Sleeping,
            Home::Held => Residence::Suspended,
        }
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            state: self.state(),
            priority: self.priority,
            period: self.period,
            residence: self.residence(),
        }
    }

    pub(crate) fn invalid_state(&self) -> TaskError {
        TaskError::InvalidState {
            task: self.id,
            state: self.state(),
        }
    }
}

struct Slot {
    generation: u32,
    tcb: Option<Tcb>,
}

/// Fixed-capacity arena of task control blocks
pub(crate) struct TaskTable {
    slots: Vec<Slot>,
    live: usize,
}

impl TaskTable {
    pub(crate) const fn new() -> TaskTable {
        TaskTable {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Reserves room for `MAX_TASKS` slots so that creation never allocates.
    pub(crate) fn reserve(&mut self) -> KernelResult<()> {
        let missing = MAX_TASKS.saturating_sub(self.slots.len());
        self.slots
            .try_reserve_exact(missing)
            .map_err(|_| TaskError::OutOfMemory)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Id the next `insert` will receive
    pub(crate) fn vacant(&self) -> KernelResult<TaskId> {
        if let Some(index) = self.slots.iter().position(|slot| slot.tcb.is_none()) {
            return Ok(TaskId::new(index as u32, self.slots[index].generation));
        }
        if self.slots.len() < MAX_TASKS {
            Ok(TaskId::new(self.slots.len() as u32, 0))
        } else {
            Err(TaskError::TaskTableFull)
        }
    }

    /// Stores a block built for the id `vacant` handed out.
    pub(crate) fn insert(&mut self, tcb: Tcb) {
        let index = tcb.id.index as usize;
        if index == self.slots.len() {
            self.slots.push(Slot {
                generation: tcb.id.generation,
                tcb: None,
            });
        }
        let slot = &mut self.slots[index];
        assert!(
            slot.tcb.is_none() && slot.generation == tcb.id.generation,
            "{} does not name a vacant slot",
            tcb.id
        );
        slot.tcb = Some(tcb);
        self.live += 1;
    }

    /// Frees the slot, making every copy of `id` stale.
    pub(crate) fn remove(&mut self, id: TaskId) -> KernelResult<Tcb> {
        self.get(id)?;
        let slot = &mut self.slots[id.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        slot.tcb.take().ok_or(TaskError::NoSuchTask(id))
    }

    pub(crate) fn get(&self, id: TaskId) -> KernelResult<&Tcb> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.tcb.as_ref())
            .ok_or(TaskError::NoSuchTask(id))
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> KernelResult<&mut Tcb> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.tcb.as_mut())
            .ok_or(TaskError::NoSuchTask(id))
    }

    /// Block at a slot the kernel knows to be occupied.
    ///
    /// # Panics
    /// If the slot is empty.
    pub(crate) fn at(&self, index: u32) -> &Tcb {
        match self.slots.get(index as usize).and_then(|s| s.tcb.as_ref()) {
            Some(tcb) => tcb,
            None => panic!("task slot {} is empty", index),
        }
    }

    pub(crate) fn at_mut(&mut self, index: u32) -> &mut Tcb {
        match self.slots.get_mut(index as usize).and_then(|s| s.tcb.as_mut()) {
            Some(tcb) => tcb,
            None => panic!("task slot {} is empty", index),
        }
    }

    /// Ids of every live task, in slot order
    pub(crate) fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.tcb.as_ref().map(|tcb| tcb.id))
    }
}

impl NodeArena for TaskTable {
    fn node(&self, index: u32) -> &Node {
        &self.at(index).node
    }

    fn node_mut(&mut self, index: u32) -> &mut Node {
        &mut self.at_mut(index).node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_switch::create_context;
    use alloc::{boxed::Box, vec};

    fn spin(_: usize) -> ! {
        loop {}
    }

    extern "C" fn trampoline(_: usize) -> ! {
        unreachable!()
    }

    fn block(table: &TaskTable, priority: u8) -> Tcb {
        let id = table.vacant().unwrap();
        let stack: &'static mut [u8] = Box::leak(vec![0u8; 4096].into_boxed_slice());
        let context = unsafe { create_context(stack, trampoline, 0) }.unwrap();
        Tcb::new(
            id,
            Priority::new(priority).unwrap(),
            context,
            spin,
            0,
            StackRegion::new(stack),
        )
    }

    #[test]
    fn freed_slot_is_reused_with_a_new_generation() {
        let mut table = TaskTable::new();
        table.reserve().unwrap();

        let first = block(&table, 3);
        let a = first.id;
        table.insert(first);
        let second = block(&table, 3);
        let b = second.id;
        table.insert(second);
        assert_eq!((a.index(), b.index()), (0, 1));

        let removed = table.remove(a).unwrap();
        removed.context.unwrap().retire();
        assert_eq!(table.get(a).err(), Some(TaskError::NoSuchTask(a)));
        assert_eq!(table.remove(a).err(), Some(TaskError::NoSuchTask(a)));

        let third = block(&table, 3);
        let c = third.id;
        table.insert(third);
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(table.len(), 2);
        assert_eq!(table.ids().collect::<Vec<_>>(), [c, b]);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = TaskTable::new();
        table.reserve().unwrap();
        for _ in 0..MAX_TASKS {
            let tcb = block(&table, 1);
            table.insert(tcb);
        }
        assert_eq!(table.vacant(), Err(TaskError::TaskTableFull));
    }

    #[test]
    fn state_follows_the_home() {
        let table = TaskTable::new();
        let mut tcb = block(&table, 5);
        assert_eq!(tcb.residence(), Residence::Suspended);
        tcb.home = Home::Current;
        assert_eq!(tcb.state(), TaskState::Running);
        tcb.home = Home::Sleeping;
        assert_eq!(tcb.info().state, TaskState::Waiting);
        assert_eq!(tcb.info().residence, Residence::Sleeping);
        assert_eq!(tcb.stack.len(), 4096);
    }
}
