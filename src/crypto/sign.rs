//! `sign`/`verify` over the canonical byte form of a section or message.

use std::fmt;

use bytes::Bytes;
use ring::rand::SystemRandom;
use ring::signature::{
    self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey,
};

use crate::wire::message::{PublicKey, Signature, SignatureAlgorithm, SignatureData};

/// A keypair able to produce signatures under one [`SignatureAlgorithm`].
///
/// `Ed448` has no variant: there is no supported primitive, so any attempt
/// to construct or use one fails with [`SignError::UnsupportedAlgorithm`].
pub enum PrivateKey {
    Ed25519(Ed25519KeyPair),
    EcdsaP256(EcdsaKeyPair),
    EcdsaP384(EcdsaKeyPair),
}

impl PrivateKey {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PrivateKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
            PrivateKey::EcdsaP256(_) => SignatureAlgorithm::EcdsaP256Sha256,
            PrivateKey::EcdsaP384(_) => SignatureAlgorithm::EcdsaP384Sha384,
        }
    }

    /// Load a keypair from a PKCS#8 document under the given algorithm.
    pub fn from_pkcs8(algorithm: SignatureAlgorithm, pkcs8: &[u8]) -> Result<Self, SignError> {
        let rng = SystemRandom::new();
        match algorithm {
            SignatureAlgorithm::Ed25519 => Ed25519KeyPair::from_pkcs8(pkcs8)
                .map(PrivateKey::Ed25519)
                .map_err(|_| SignError::PrimitiveFailure),
            SignatureAlgorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
                    .map(PrivateKey::EcdsaP256)
                    .map_err(|_| SignError::PrimitiveFailure)
            }
            SignatureAlgorithm::EcdsaP384Sha384 => {
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P384_SHA384_FIXED_SIGNING, pkcs8, &rng)
                    .map(PrivateKey::EcdsaP384)
                    .map_err(|_| SignError::PrimitiveFailure)
            }
            SignatureAlgorithm::Ed448 => Err(SignError::UnsupportedAlgorithm),
        }
    }

    pub fn public_key_bytes(&self) -> Bytes {
        let bytes = match self {
            PrivateKey::Ed25519(kp) => kp.public_key().as_ref().to_vec(),
            PrivateKey::EcdsaP256(kp) => kp.public_key().as_ref().to_vec(),
            PrivateKey::EcdsaP384(kp) => kp.public_key().as_ref().to_vec(),
        };
        Bytes::from(bytes)
    }
}

/// A failure of the signing primitive itself, distinct from a failed
/// *verification* (which is reported as `false`, not an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignError {
    /// No supported primitive exists for the requested algorithm (`Ed448`).
    UnsupportedAlgorithm,
    /// The key material's algorithm does not match `sig.algorithm`.
    KeyTypeMismatch,
    /// The underlying cryptographic primitive rejected the operation.
    PrimitiveFailure,
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignError::UnsupportedAlgorithm => "no signing primitive for this algorithm",
            SignError::KeyTypeMismatch => "key algorithm does not match the signature's",
            SignError::PrimitiveFailure => "the cryptographic primitive rejected the operation",
        })
    }
}

impl std::error::Error for SignError {}

/// Append `sig.metadata()` to `canonical_bytes`, sign under `key`, and
/// write the raw signature into `sig.data`.
pub fn sign(key: &PrivateKey, canonical_bytes: &[u8], sig: &mut Signature) -> Result<(), SignError> {
    if key.algorithm() != sig.algorithm {
        return Err(SignError::KeyTypeMismatch);
    }
    let mut message = canonical_bytes.to_vec();
    message.extend_from_slice(sig.metadata().as_bytes());

    sig.data = match key {
        PrivateKey::Ed25519(kp) => {
            let raw = kp.sign(&message);
            SignatureData::EdBytes(Bytes::copy_from_slice(raw.as_ref()))
        }
        PrivateKey::EcdsaP256(kp) => ecdsa_sign(kp, &message, 32)?,
        PrivateKey::EcdsaP384(kp) => ecdsa_sign(kp, &message, 48)?,
    };
    Ok(())
}

fn ecdsa_sign(kp: &EcdsaKeyPair, message: &[u8], field_len: usize) -> Result<SignatureData, SignError> {
    let rng = SystemRandom::new();
    let raw = kp
        .sign(&rng, message)
        .map_err(|_| SignError::PrimitiveFailure)?;
    let raw = raw.as_ref();
    if raw.len() != field_len * 2 {
        return Err(SignError::PrimitiveFailure);
    }
    Ok(SignatureData::EcdsaPair {
        r: Bytes::copy_from_slice(&raw[..field_len]),
        s: Bytes::copy_from_slice(&raw[field_len..]),
    })
}

/// Verify `sig` over `canonical_bytes` under `key`. Never errors: an
/// unsupported algorithm, a key/algorithm mismatch, an empty signature, or
/// a failed cryptographic check all report `false`.
pub fn verify(key: &PublicKey, canonical_bytes: &[u8], sig: &Signature) -> bool {
    if key.algorithm != sig.algorithm {
        return false;
    }
    if sig.data.is_empty() {
        return false;
    }
    let mut message = canonical_bytes.to_vec();
    message.extend_from_slice(sig.metadata().as_bytes());

    match (sig.algorithm, &sig.data) {
        (SignatureAlgorithm::Ed25519, SignatureData::EdBytes(raw)) => {
            UnparsedPublicKey::new(&signature::ED25519, &key.key[..])
                .verify(&message, raw)
                .is_ok()
        }
        (SignatureAlgorithm::EcdsaP256Sha256, SignatureData::EcdsaPair { r, s }) => {
            verify_ecdsa(&signature::ECDSA_P256_SHA256_FIXED, &key.key, r, s, &message)
        }
        (SignatureAlgorithm::EcdsaP384Sha384, SignatureData::EcdsaPair { r, s }) => {
            verify_ecdsa(&signature::ECDSA_P384_SHA384_FIXED, &key.key, r, s, &message)
        }
        _ => false,
    }
}

fn verify_ecdsa(
    alg: &'static dyn ring::signature::VerificationAlgorithm,
    key_bytes: &[u8],
    r: &[u8],
    s: &[u8],
    message: &[u8],
) -> bool {
    let mut raw = Vec::with_capacity(r.len() + s.len());
    raw.extend_from_slice(r);
    raw.extend_from_slice(s);
    UnparsedPublicKey::new(alg, key_bytes).verify(message, &raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::{KeySpace, SignatureAlgorithm};

    fn fresh_signature(algorithm: SignatureAlgorithm) -> Signature {
        Signature {
            key_space: KeySpace::Rains,
            algorithm,
            key_phase: 0,
            valid_since: 0,
            valid_until: 1_000,
            data: SignatureData::Empty,
        }
    }

    #[test]
    fn ed25519_sign_then_verify_round_trips() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = PrivateKey::from_pkcs8(SignatureAlgorithm::Ed25519, pkcs8.as_ref()).unwrap();
        let public = PublicKey {
            algorithm: SignatureAlgorithm::Ed25519,
            key_phase: 0,
            valid_since: 0,
            valid_until: 1_000,
            key: key.public_key_bytes(),
        };

        let mut sig = fresh_signature(SignatureAlgorithm::Ed25519);
        sign(&key, b"hello", &mut sig).unwrap();
        assert!(verify(&public, b"hello", &sig));
        assert!(!verify(&public, b"goodbye", &sig));
    }

    #[test]
    fn empty_signature_data_never_verifies() {
        let sig = fresh_signature(SignatureAlgorithm::Ed25519);
        let public = PublicKey {
            algorithm: SignatureAlgorithm::Ed25519,
            key_phase: 0,
            valid_since: 0,
            valid_until: 1_000,
            key: Bytes::new(),
        };
        assert!(!verify(&public, b"hello", &sig));
    }

    #[test]
    fn ed448_is_unsupported() {
        let err = PrivateKey::from_pkcs8(SignatureAlgorithm::Ed448, &[]).unwrap_err();
        assert_eq!(err, SignError::UnsupportedAlgorithm);
    }

    #[test]
    fn algorithm_mismatch_verifies_false_not_error() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = PrivateKey::from_pkcs8(SignatureAlgorithm::Ed25519, pkcs8.as_ref()).unwrap();
        let mismatched_public = PublicKey {
            algorithm: SignatureAlgorithm::EcdsaP256Sha256,
            key_phase: 0,
            valid_since: 0,
            valid_until: 1_000,
            key: key.public_key_bytes(),
        };
        let mut sig = fresh_signature(SignatureAlgorithm::Ed25519);
        sign(&key, b"hello", &mut sig).unwrap();
        assert!(!verify(&mismatched_public, b"hello", &sig));
    }
}
