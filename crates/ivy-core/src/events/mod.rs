//! In-process publish/subscribe fabric, keyed by project.

mod hub;
mod types;

pub use hub::{EventHub, LogSubscription, Subscription};
pub use types::Event;
