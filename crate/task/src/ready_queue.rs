//! Multi-level ready queue
//!
//! One FIFO bucket per priority level plus a bitmap of non-empty buckets,
//! so the most urgent ready level is a single trailing-zeros away. Buckets
//! (and wait queues) are index-linked lists threaded through nodes stored in
//! the task table; a node is in at most one list at a time.

use crate::{config::PRIORITY_LEVELS, Priority};

/// Queue link embedded in every task control block
#[derive(Debug, Clone)]
pub(crate) struct Node {
    prev: Option<u32>,
    next: Option<u32>,
    queued: bool,
    /// Priority the node was filed under
    pub(crate) priority: Priority,
}

impl Node {
    pub(crate) const fn new(priority: Priority) -> Node {
        Node {
            prev: None,
            next: None,
            queued: false,
            priority,
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued
    }
}

/// Storage the lists thread through
pub(crate) trait NodeArena {
    fn node(&self, index: u32) -> &Node;
    fn node_mut(&mut self, index: u32) -> &mut Node;
}

/// FIFO of task table indices
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TaskList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl TaskList {
    pub(crate) const EMPTY: TaskList = TaskList {
        head: None,
        tail: None,
        len: 0,
    };

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn front(&self) -> Option<u32> {
        self.head
    }

    /// Appends `index` at the tail.
    ///
    /// # Panics
    /// If the node already sits in a list.
    pub(crate) fn push_back<A: NodeArena>(&mut self, arena: &mut A, index: u32) {
        let node = arena.node_mut(index);
        assert!(!node.queued, "task node {} is already queued", index);
        node.queued = true;
        node.prev = self.tail;
        node.next = None;

        match self.tail {
            Some(tail) => arena.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub(crate) fn pop_front<A: NodeArena>(&mut self, arena: &mut A) -> Option<u32> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Unlinks `index`, which must be a member of this list.
    pub(crate) fn remove<A: NodeArena>(&mut self, arena: &mut A, index: u32) {
        let node = arena.node_mut(index);
        debug_assert!(node.queued, "task node {} is not queued", index);
        let (prev, next) = (node.prev.take(), node.next.take());
        node.queued = false;

        match prev {
            Some(prev) => arena.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub(crate) fn iter<'a, A: NodeArena>(&self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            arena,
            cursor: self.head,
        }
    }
}

pub(crate) struct Iter<'a, A> {
    arena: &'a A,
    cursor: Option<u32>,
}

impl<'a, A: NodeArena> Iterator for Iter<'a, A> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let index = self.cursor?;
        self.cursor = self.arena.node(index).next;
        Some(index)
    }
}

/// Readiness index: bit `p` is set while bucket `p` is non-empty
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyBitmap(u64);

impl ReadyBitmap {
    pub const fn new() -> ReadyBitmap {
        ReadyBitmap(0)
    }

    pub fn mark_ready(&mut self, priority: Priority) {
        self.0 |= 1 << priority.level();
    }

    pub fn mark_empty(&mut self, priority: Priority) {
        self.0 &= !(1 << priority.level());
    }

    pub fn is_ready(&self, priority: Priority) -> bool {
        self.0 & (1 << priority.level()) != 0
    }

    /// Numerically smallest ready level
    pub fn highest(&self) -> Option<Priority> {
        if self.0 == 0 {
            None
        } else {
            Some(Priority::from_level(self.0.trailing_zeros() as u8))
        }
    }
}

/// Per-priority FIFO buckets with O(1) selection
pub(crate) struct ReadyQueue {
    buckets: [TaskList; PRIORITY_LEVELS],
    ready: ReadyBitmap,
}

impl ReadyQueue {
    pub(crate) const fn new() -> ReadyQueue {
        ReadyQueue {
            buckets: [TaskList::EMPTY; PRIORITY_LEVELS],
            ready: ReadyBitmap::new(),
        }
    }

    /// Files `index` at the tail of the bucket its node's priority names.
    pub(crate) fn push_back<A: NodeArena>(&mut self, arena: &mut A, index: u32) {
        let priority = arena.node(index).priority;
        self.buckets[priority.index()].push_back(arena, index);
        self.ready.mark_ready(priority);
    }

    /// Takes the head of the most urgent non-empty bucket.
    pub(crate) fn pop_highest<A: NodeArena>(&mut self, arena: &mut A) -> Option<u32> {
        let priority = self.ready.highest()?;
        let bucket = &mut self.buckets[priority.index()];
        let index = bucket.pop_front(arena);
        if bucket.is_empty() {
            self.ready.mark_empty(priority);
        }
        index
    }

    pub(crate) fn remove<A: NodeArena>(&mut self, arena: &mut A, index: u32) {
        let priority = arena.node(index).priority;
        let bucket = &mut self.buckets[priority.index()];
        bucket.remove(arena, index);
        if bucket.is_empty() {
            self.ready.mark_empty(priority);
        }
    }

    pub(crate) fn highest_ready_priority(&self) -> Option<Priority> {
        self.ready.highest()
    }

    pub(crate) fn is_ready(&self, priority: Priority) -> bool {
        self.ready.is_ready(priority)
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(TaskList::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.buckets = [TaskList::EMPTY; PRIORITY_LEVELS];
        self.ready = ReadyBitmap::new();
    }
}
