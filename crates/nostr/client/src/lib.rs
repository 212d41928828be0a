//! Single-connection Nostr relay client.
//!
//! One [`RelayConnection`] owns one WebSocket to one relay and multiplexes
//! subscriptions and publish acknowledgements over it:
//! - connection is opened lazily, concurrent `connect` calls share one attempt
//! - inbound frames are dispatched in arrival order and events are signature
//!   checked before any callback sees them
//! - `list`/`get` wrap a subscription with a timeout

pub mod config;
mod dispatch;
pub mod error;
pub mod listeners;
pub mod message;
pub mod publish;
pub mod relay;
mod request;
pub mod subscription;
pub mod verify;

pub use config::RelayConfig;
pub use error::{ClientError, Result};
pub use listeners::ListenerId;
pub use message::{ClientMessage, RelayMessage, parse_relay_message};
pub use publish::{Pub, PublishConfirmation};
pub use relay::{ConnectionState, RelayConnection};
pub use request::RequestOptions;
pub use subscription::{AlreadyHaveEvent, EventCallback, Subscription, SubscriptionOptions};
pub use verify::{EventVerifier, SchnorrVerifier};
