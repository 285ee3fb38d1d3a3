#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use task::{config::LOWEST_PRIORITY, TaskEntry, TaskId};

/// The kernel is a singleton, so tests in one binary take turns.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub const STACK_SIZE: usize = 64 * 1024;

pub fn stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; STACK_SIZE].into_boxed_slice())
}

/// Stands in for the timer interrupt: every idle pass is one tick.
pub fn idle(_: usize) -> ! {
    loop {
        task::timer_tick();
        task::schedule();
    }
}

/// Fresh kernel holding an idle task
pub fn boot() -> TaskId {
    task::init().unwrap();
    task::create_task(stack(), idle, 0, LOWEST_PRIORITY).unwrap()
}

pub fn spawn(entry: TaskEntry, arg: usize, priority: u8) -> TaskId {
    task::create_task(stack(), entry, arg, priority).unwrap()
}

/// Parks the calling task for good.
pub fn park() -> ! {
    static PARKED: task::WaitQueue = task::WaitQueue::new();
    loop {
        let _ = task::wait(&PARKED);
    }
}

/// Append-only record shared between tasks and the test body
pub struct Trace(Mutex<Vec<String>>);

impl Trace {
    pub const fn new() -> Trace {
        Trace(Mutex::new(Vec::new()))
    }

    pub fn push(&self, event: impl Into<String>) {
        self.lock().push(event.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ids handed from the test body to the tasks it spawned
pub struct Roster(Mutex<Vec<TaskId>>);

impl Roster {
    pub const fn new() -> Roster {
        Roster(Mutex::new(Vec::new()))
    }

    pub fn set(&self, ids: &[TaskId]) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = ids.to_vec();
    }

    pub fn get(&self, slot: usize) -> TaskId {
        self.0.lock().unwrap_or_else(|e| e.into_inner())[slot]
    }
}
