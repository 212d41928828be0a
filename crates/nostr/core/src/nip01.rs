//! NIP-01 event identity and signatures.
//!
//! An event's `id` is the hex SHA-256 of the canonical array
//! `[0, pubkey, created_at, kind, tags, content]` serialized without
//! whitespace, and `sig` is a BIP-340 Schnorr signature over that id.

use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// NIP-01 error types
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid hex in {field}: {message}")]
    InvalidHex { field: &'static str, message: String },

    #[error("invalid event structure: {0}")]
    InvalidStructure(String),

    #[error("event id mismatch: declared {declared}, computed {computed}")]
    IdMismatch { declared: String, computed: String },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("system clock is before the unix epoch")]
    Clock,
}

pub type Result<T> = std::result::Result<T, Nip01Error>;

/// A signed Nostr event as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Hex x-only public key of the author.
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Hex Schnorr signature over `id`.
    pub sig: String,
}

/// Event fields that still need an author, id and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

pub fn unix_now_secs() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|_| Nip01Error::Clock)
}

fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32]> {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let serialized = serde_json::to_string(&canonical)?;
    Ok(Sha256::digest(serialized.as_bytes()).into())
}

/// Compute the hex event id from the event's signed fields.
///
/// The declared `id` and `sig` are ignored.
pub fn get_event_hash(event: &Event) -> Result<String> {
    let hash = canonical_hash(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )?;
    Ok(hex::encode(hash))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

fn check_structure(event: &Event) -> Result<()> {
    if !is_lower_hex(&event.id, 64) {
        return Err(Nip01Error::InvalidStructure(
            "id must be 64 lowercase hex characters".to_string(),
        ));
    }
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidStructure(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }
    Ok(())
}

fn check_id(event: &Event) -> Result<()> {
    check_structure(event)?;
    let computed = get_event_hash(event)?;
    if computed != event.id {
        return Err(Nip01Error::IdMismatch {
            declared: event.id.clone(),
            computed,
        });
    }
    Ok(())
}

fn check_signature(event: &Event) -> Result<()> {
    let id_bytes: [u8; 32] = decode_fixed(&event.id, "id")?;
    let pubkey_bytes: [u8; 32] = decode_fixed(&event.pubkey, "pubkey")?;
    let sig_bytes: [u8; 64] = decode_fixed(&event.sig, "sig")?;

    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|error| Nip01Error::InvalidSignature(error.to_string()))?;
    let public_key = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|error| Nip01Error::InvalidSignature(error.to_string()))?;
    let message = Message::from_digest(id_bytes);

    Secp256k1::verification_only()
        .verify_schnorr(&signature, &message, &public_key)
        .map_err(|error| Nip01Error::InvalidSignature(error.to_string()))
}

fn decode_fixed<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N]> {
    let bytes = hex::decode(value).map_err(|error| Nip01Error::InvalidHex {
        field,
        message: error.to_string(),
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| Nip01Error::InvalidHex {
        field,
        message: format!("expected {} bytes, got {}", N, bytes.len()),
    })
}

/// True when the event is well formed and its id matches its content.
pub fn validate_event(event: &Event) -> bool {
    check_id(event).is_ok()
}

/// True when `sig` is a valid Schnorr signature over `id` by `pubkey`.
///
/// Does not recompute the id; pair with [`validate_event`].
pub fn verify_signature(event: &Event) -> bool {
    check_signature(event).is_ok()
}

/// Full integrity check reporting which part failed.
pub fn verify_event(event: &Event) -> Result<()> {
    check_id(event)?;
    check_signature(event)
}

fn keypair(secret_key: &[u8; 32]) -> Result<Keypair> {
    let secp = Secp256k1::signing_only();
    Keypair::from_seckey_slice(&secp, secret_key)
        .map_err(|error| Nip01Error::InvalidSecretKey(error.to_string()))
}

pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String> {
    let (public_key, _parity) = keypair(secret_key)?.x_only_public_key();
    Ok(hex::encode(public_key.serialize()))
}

/// Fill in author, id and signature for a template.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event> {
    let keypair = keypair(secret_key)?;
    let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
    let hash = canonical_hash(
        &pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    )?;

    let secp = Secp256k1::signing_only();
    let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(hash), &keypair);

    Ok(Event {
        id: hex::encode(hash),
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: signature.to_string(),
    })
}
