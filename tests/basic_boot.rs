use std::{
    fmt,
    sync::{Mutex, Once},
};

use eos::{print, println};
use log::LevelFilter;

static CAPTURED: Mutex<String> = Mutex::new(String::new());
static CONSOLE: Once = Once::new();

/// Sink keeping everything printed so tests can look at it
struct Capture;

impl fmt::Write for Capture {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        CAPTURED.lock().unwrap().push_str(s);
        Ok(())
    }
}

fn console() {
    CONSOLE.call_once(|| {
        eos::init_logger(Box::leak(Box::new(Capture)), LevelFilter::Debug).unwrap();
    });
}

fn captured() -> String {
    CAPTURED.lock().unwrap().clone()
}

#[test]
fn test_println() {
    console();
    println!("test_println output {}", 42);
    assert!(captured().contains("test_println output 42\n"));
}

#[test]
fn test_print() {
    console();
    print!("test_print output");
    assert!(captured().contains("test_print output"));
}

#[test]
fn test_second_console_is_refused() {
    console();
    let again = eos::init_logger(Box::leak(Box::new(Capture)), LevelFilter::Trace);
    assert_eq!(again, Err(eos::AlreadyInitialized));
    assert!(printer::is_initialized());
}

#[test]
fn test_init_logs_through_the_console() {
    console();
    eos::init().unwrap();
    let out = captured();
    assert!(out.contains("task core ready"), "{}", out);
    assert!(out.contains("[INFO ]"), "{}", out);
}
