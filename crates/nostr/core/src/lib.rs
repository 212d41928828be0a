pub mod filter;
pub mod nip01;
mod tag_parsing;

pub use filter::{Filter, match_filters};
pub use nip01::{
    Event, EventTemplate, Nip01Error, finalize_event, get_event_hash, get_public_key_hex,
    unix_now_secs, validate_event, verify_event, verify_signature,
};
