//! The wire format: the RAINS data model, its canonical byte encoding and
//! total section ordering, and the length-delimited CBOR framing used on the
//! TLS transport.

pub mod canonical;
pub mod codec;
pub mod message;

pub use canonical::{compare_sections, encode_message, encode_section, sort_message};
pub use message::*;
