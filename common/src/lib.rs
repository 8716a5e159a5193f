//! Shared configuration, clock abstraction, error taxonomy and logging
//! setup used by both `store` and `client`. Grounded on the teacher's
//! `common` crate, which played the same "shared plumbing" role for its
//! `client`/`server` split.

pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;

pub use clock::{Clock, SystemClock, TestClock};
pub use config::ClientConfig;
pub use errors::{CoreError, Reason};
