//! Hosted walk through the scheduler: three tasks and an idle task share
//! the processor until one of them shuts the kernel down.

use std::{fmt, io::Write as _};

use eos::{
    println,
    task::{self, WaitQueue, WakePolicy},
};
use log::LevelFilter;

const STACK_SIZE: usize = 64 * 1024;

static EVENT: WaitQueue = WaitQueue::new();
static PARKED: WaitQueue = WaitQueue::new();

/// Console sink writing to the process' stdout
struct Stdout;

impl fmt::Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::io::stdout()
            .write_all(s.as_bytes())
            .map_err(|_| fmt::Error)
    }
}

fn stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; STACK_SIZE].into_boxed_slice())
}

fn x(_: usize) -> ! {
    println!("X: running, waking Y");
    task::wakeup_single(&EVENT, WakePolicy::Fifo);
    task::schedule();
    println!("X: back after Y and Z, sleeping 10");
    let _ = task::sleep(10);
    println!("X: shutting down at tick {}", task::ticks());
    task::shutdown()
}

fn y(_: usize) -> ! {
    println!("Y: waiting for X");
    let _ = task::wait(&EVENT);
    println!("Y: woken at tick {}, sleeping 5", task::ticks());
    let _ = task::sleep(5);
    println!("Y: up at tick {}", task::ticks());
    park()
}

fn z(_: usize) -> ! {
    println!("Z: running");
    park()
}

fn park() -> ! {
    loop {
        let _ = task::wait(&PARKED);
    }
}

fn main() {
    eos::init_logger(Box::leak(Box::new(Stdout)), LevelFilter::Info)
        .expect("console registered twice");
    eos::init().expect("task core failed to initialize");

    eos::spawn_idle(stack()).expect("no room for the idle task");
    let spawned = [(x as task::TaskEntry, 2), (y, 1), (z, 2)]
        .into_iter()
        .map(|(entry, priority)| task::create_task(stack(), entry, 0, priority))
        .collect::<Result<Vec<_>, _>>()
        .expect("task creation failed");
    for id in &spawned {
        task::dump_context(*id).expect("fresh task has a context");
    }

    task::start().expect("scheduler refused to start");
    println!("main: scheduler stopped after {} ticks", task::ticks());
}
