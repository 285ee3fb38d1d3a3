//! Compile-time kernel configuration

/// Number of priority levels, one ready bucket each. The readiness index is
/// a single 64-bit word, so this cannot exceed 64.
pub const PRIORITY_LEVELS: usize = 64;

/// Numerically largest (least urgent) priority. The idle task lives here.
pub const LOWEST_PRIORITY: u8 = (PRIORITY_LEVELS - 1) as u8;

/// Only 64 tasks may exist at once
pub const MAX_TASKS: usize = 64;

/// Smallest stack accepted by `create_task`, context image included
pub const MIN_STACK_SIZE: usize = 1024;

const _: () = assert!(PRIORITY_LEVELS <= 64 && PRIORITY_LEVELS > 0);
const _: () = assert!(MAX_TASKS <= u32::MAX as usize);
