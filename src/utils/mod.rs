//! Small shared helpers.

pub mod time;

pub use time::{deadline_after, now_millis};
