//! Kernel console
//!
//! A single global [`Writer`] forwards formatted text to whatever sink the
//! platform registers at boot (a UART, a framebuffer, or stdout on a hosted
//! build). The same writer backs the `log` facade.
#![no_std]

use conquer_once::spin::OnceCell;
use core::fmt;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// The global Writer instance used by `print!` and the `log` crate.
pub static WRITER: OnceCell<Mutex<Writer>> = OnceCell::uninit();

static LOGGER: KernelLogger = KernelLogger;

/// Error returned when the console was already set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyInitialized;

impl fmt::Display for AlreadyInitialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("console already initialized")
    }
}

/// Forwards text to the registered sink
pub struct Writer {
    sink: &'static mut (dyn fmt::Write + Send),
}

impl Writer {
    /// Creates a new Writer on top of the given sink.
    pub fn new(sink: &'static mut (dyn fmt::Write + Send)) -> Writer {
        Self { sink }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.sink.write_str(s)
    }
}

/// Registers the console sink. Only the first registration wins.
pub fn init_writer(sink: &'static mut (dyn fmt::Write + Send)) -> Result<(), AlreadyInitialized> {
    WRITER
        .try_init_once(|| Mutex::new(Writer::new(sink)))
        .map_err(|_| AlreadyInitialized)
}

/// Registers the console sink and installs it as the `log` backend.
pub fn init_logger(
    sink: &'static mut (dyn fmt::Write + Send),
    level: LevelFilter,
) -> Result<(), AlreadyInitialized> {
    init_writer(sink)?;
    log::set_logger(&LOGGER).map_err(|_| AlreadyInitialized)?;
    log::set_max_level(level);
    Ok(())
}

/// Returns true once a sink is registered
pub fn is_initialized() -> bool {
    WRITER.get().is_some()
}

/// Formats argument and calls the _print function
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Concatenation an endl and calls print macro
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Print function that the macros are derived from
///
/// Text is dropped until a sink is registered.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    interrupts::without_interrupts(|| {
        if let Some(writer) = WRITER.get() {
            let _ = writer.lock().write_fmt(args);
        }
    });
}

/// `log` backend writing one line per record to the console
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{:<5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}
