//! Message delivery discipline shared by all actors.

pub mod delivery;

pub use delivery::{Delivery, MessageClass, deliver};
