//! Common types and utilities shared across the journal crates.

pub mod collections;
pub mod id128;
pub mod system;
pub mod time;

pub use time::{DualTimestamp, Microseconds, RealtimeClock, monotonic_now};

pub use collections::{HashMap, HashSet, VecDeque};

pub use system::{hostname, load_boot_id, load_machine_id};
