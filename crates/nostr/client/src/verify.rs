//! Signature verification seam.

use async_trait::async_trait;
use nostr::Event;
use tracing::warn;

/// Decides whether an inbound event's signature is valid.
///
/// Called once per event before any subscription callback sees it, unless
/// the subscription skips verification.
#[async_trait]
pub trait EventVerifier: Send + Sync {
    async fn verify(&self, event: &Event) -> bool;
}

/// BIP-340 Schnorr verification on the blocking thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchnorrVerifier;

#[async_trait]
impl EventVerifier for SchnorrVerifier {
    async fn verify(&self, event: &Event) -> bool {
        let event = event.clone();
        match tokio::task::spawn_blocking(move || nostr::verify_signature(&event)).await {
            Ok(valid) => valid,
            Err(error) => {
                warn!("signature verification task failed: {}", error);
                false
            }
        }
    }
}
