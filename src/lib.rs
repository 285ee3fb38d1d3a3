#![cfg_attr(not(test), no_std)]

use core::fmt;

use log::LevelFilter;

pub use printer::{print, println, AlreadyInitialized};
pub use task;
use task::{config::LOWEST_PRIORITY, KernelResult, TaskId};

/// 1. Reset the task core and reserve the task table
/// 2. Report the tick source the idle task relies on
pub fn init() -> KernelResult<()> {
    task::init()?;
    if cfg!(target_os = "none") {
        log::info!("idle task waits for the timer interrupt");
    } else {
        log::info!("hosted build, idle task drives the tick");
    }
    Ok(())
}

/// Registers the console sink and routes `log` records to it
pub fn init_logger(
    sink: &'static mut (dyn fmt::Write + Send),
    level: LevelFilter,
) -> Result<(), AlreadyInitialized> {
    printer::init_logger(sink, level)
}

/// Creates the idle task `task::start` requires, at the lowest priority.
pub fn spawn_idle(stack: &'static mut [u8]) -> KernelResult<TaskId> {
    task::create_task(stack, idle_loop, 0, LOWEST_PRIORITY)
}

/// Body of the idle task: wait for something to happen, then let whatever
/// became ready run.
///
/// Without a timer interrupt on hosted builds, each pass counts as a tick.
pub fn idle_loop(_: usize) -> ! {
    loop {
        interrupts::wait_for_interrupt();
        #[cfg(not(target_os = "none"))]
        task::timer_tick();
        task::schedule();
    }
}
