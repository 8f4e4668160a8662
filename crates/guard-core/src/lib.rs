//! Foundational utilities shared across the outbound guard crates.
//!
//! Provides the injectable clock, durable atomic writes, and the locked JSON
//! record store every stateful component persists through.

pub mod atomic_io;
pub mod clock;
pub mod state_store;

pub use atomic_io::write_text_atomic;
pub use clock::{
    ceil_ms_to_secs, current_unix_timestamp_ms, is_expired_unix, secs_to_ms,
    utc_date_for_unix_ms, Clock, ManualClock, SystemClock,
};
pub use state_store::{StateStore, StoreError, DEFAULT_LOCK_TIMEOUT};
