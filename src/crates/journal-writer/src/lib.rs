//! Journal directory writer with rotation, retention and rate limiting
//!
//! This crate drives the append path of `journal-core` for a whole
//! directory: it keeps a system file and per-user files open, rotates
//! them when they fill up or age, vacuums archived files to stay within
//! the retention limits and suppresses message floods.
//!
//! ## Usage
//!
//! ```no_run
//! use journal_writer::{Config, Engine, RetentionPolicy, RotationPolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rotation = RotationPolicy::default().with_max_file_size(64 * 1024 * 1024);
//! let retention = RetentionPolicy::default().with_max_use(1024 * 1024 * 1024);
//!
//! let mut config = Config::new("/var/log/journal")
//!     .with_rotation_policy(rotation)
//!     .with_retention_policy(retention);
//! config.load_settings("[Journal]\nRateLimitBurst=500\n")?;
//!
//! let mut engine = Engine::open(config)?;
//! engine.dispatch(
//!     &[b"MESSAGE=Hello, journal!" as &[u8], b"PRIORITY=6"],
//!     6,
//!     Some(1000),
//!     None,
//! );
//! engine.sync();
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
mod rate_limit;
mod vacuum;

pub use config::{
    Config, RateLimitPolicy, RetentionPolicy, RotationPolicy, SYSTEM_UID_MAX, SplitMode,
    parse_level,
};
pub use engine::{Engine, Outcome};
pub use error::{Result, WriterError};
pub use rate_limit::{RateLimiter, Verdict, burst_modulate};
pub use vacuum::{VacuumLimits, VacuumReport, vacuum};
