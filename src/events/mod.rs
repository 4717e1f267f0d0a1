//! Event transport between agents.
//!
//! - [`Message`]: immutable, clocked message
//! - [`MessageBus`]: FIFO publish/subscribe with per-sender circuit breakers
//! - [`Subscriber`]: async receiver trait

pub mod message;
pub mod message_bus;

pub use message::Message;
pub use message_bus::{BusError, MessageBus, Subscriber, SubscriberError};
