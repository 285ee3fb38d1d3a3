use std::sync::{Mutex, MutexGuard};

use eos::task::{self, Residence, TaskId, TaskState, WaitQueue, WakePolicy};

static SERIAL: Mutex<()> = Mutex::new(());
static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn record(event: &'static str) {
    TRACE.lock().unwrap().push(event);
}

fn stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; 64 * 1024].into_boxed_slice())
}

fn park() -> ! {
    static PARKED: WaitQueue = WaitQueue::new();
    loop {
        let _ = task::wait(&PARKED);
    }
}

fn boot() {
    eos::init().unwrap();
    eos::spawn_idle(stack()).unwrap();
    TRACE.lock().unwrap().clear();
}

static EVENT: WaitQueue = WaitQueue::new();
static OBSERVED: Mutex<Vec<(TaskState, Residence)>> = Mutex::new(Vec::new());
static IDS: Mutex<Vec<TaskId>> = Mutex::new(Vec::new());

fn x(_: usize) -> ! {
    record("X");
    let y = IDS.lock().unwrap()[1];
    let info = task::task_info(y).unwrap();
    OBSERVED.lock().unwrap().push((info.state, info.residence));
    task::wakeup_single(&EVENT, WakePolicy::Fifo);
    record("X yields");
    task::schedule();
    record("X again");
    task::shutdown()
}

fn y(_: usize) -> ! {
    record("Y");
    task::wait(&EVENT).unwrap();
    record("Y woken");
    park()
}

fn z(_: usize) -> ! {
    record("Z");
    park()
}

/// X:2, Y:1, Z:2. Y runs first and waits, then X runs ahead of Z.
#[test]
fn test_priority_scenario() {
    let _serial = serial();
    boot();
    let ids = vec![
        task::create_task(stack(), x, 0, 2).unwrap(),
        task::create_task(stack(), y, 0, 1).unwrap(),
        task::create_task(stack(), z, 0, 2).unwrap(),
    ];
    *IDS.lock().unwrap() = ids;

    task::start().unwrap();

    assert_eq!(
        *TRACE.lock().unwrap(),
        ["Y", "X", "X yields", "Y woken", "Z", "X again"]
    );
    assert_eq!(
        *OBSERVED.lock().unwrap(),
        [(TaskState::Waiting, Residence::Waiting)]
    );
    assert_eq!(task::get_current_task(), None);
}

static WOKE_AT: Mutex<Option<u64>> = Mutex::new(None);

fn sleeper(_: usize) -> ! {
    let start = task::ticks();
    task::sleep(5).unwrap();
    *WOKE_AT.lock().unwrap() = Some(task::ticks() - start);
    task::shutdown()
}

fn watcher(_: usize) -> ! {
    // Only runs once the sleeper is off the processor.
    record("watcher");
    assert_eq!(task::highest_ready_priority(), Some(task::Priority::LOWEST));
    park()
}

/// The idle task drives the tick on hosted builds.
#[test]
fn test_sleep_scenario() {
    let _serial = serial();
    boot();
    task::create_task(stack(), sleeper, 0, 3).unwrap();
    task::create_task(stack(), watcher, 0, 4).unwrap();

    task::start().unwrap();

    assert_eq!(*WOKE_AT.lock().unwrap(), Some(5));
    assert_eq!(*TRACE.lock().unwrap(), ["watcher"]);
}
