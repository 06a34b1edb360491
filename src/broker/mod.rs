//! Publish/subscribe transport used to cross unit and process boundaries.
//!
//! The runtime only depends on the [`Broker`] trait. [`LocalBroker`] is the
//! in-process implementation backed by one broadcast channel per path.

pub mod address;
pub mod broker;
pub mod local;

pub use broker::{Broker, Envelope, Subscription};
pub use local::LocalBroker;
