#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]
//!
//! # Threading Notes
//!
//! The runtime is cooperative and effectively single-threaded: every
//! operation on engine state runs inside [`critical`], including drains
//! fired by the background driver thread. Dispatched callbacks already
//! hold the critical section and may re-enter it freely.

pub mod clock;
mod critical;
mod driver;
pub mod queue;
pub mod registry;
pub mod stamp;

pub use clock::{Clock, ParseClockError, Priority};
pub use critical::critical;
pub use queue::{Dispatch, DispatchToken, Queue, QueueId};

#[doc = include_str!("../README.md")]
mod readme {}
