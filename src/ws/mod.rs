pub mod hub;
pub mod messages;

pub use hub::SubscriptionHub;
pub use messages::{Channel, ClientMessage, OutboundMessage};
