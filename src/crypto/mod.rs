//! The signature engine: signing and verification over Ed25519 and
//! ECDSA-P256/P384.

mod sign;

pub use sign::{sign, verify, PrivateKey, SignError};
