// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! ECDSA P-256 with little-endian coordinates
//!
//! The attestation key lives in little-endian form inside the sealed blob and
//! the signing primitive speaks little-endian; the quote carries big-endian
//! coordinates. The `*_wire` conversions are the only place the byte order
//! flips.

use p256::ecdsa::{
    signature::{Signer as _, Verifier as _},
    Signature, SigningKey, VerifyingKey,
};
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of one field element or scalar
pub const COORD_SIZE: usize = 32;

/// ECC primitive failure
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("ecdsa p-256: {0}")]
pub struct EccError(&'static str);

/// Private scalar, little-endian
pub type PrivateKeyLe = Zeroizing<[u8; COORD_SIZE]>;

/// Public point with little-endian coordinates
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyLe {
    /// x coordinate
    pub x: [u8; COORD_SIZE],
    /// y coordinate
    pub y: [u8; COORD_SIZE],
}

/// Signature with little-endian components
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SignatureLe {
    /// r component
    pub r: [u8; COORD_SIZE],
    /// s component
    pub s: [u8; COORD_SIZE],
}

/// Reverse the byte order of a 32 byte value.
pub fn swap_endianness(value: &[u8; COORD_SIZE]) -> [u8; COORD_SIZE] {
    let mut out = *value;
    out.reverse();
    out
}

fn split_wire(bytes: &[u8; 2 * COORD_SIZE]) -> ([u8; COORD_SIZE], [u8; COORD_SIZE]) {
    let mut a = [0u8; COORD_SIZE];
    let mut b = [0u8; COORD_SIZE];
    a.copy_from_slice(&bytes[..COORD_SIZE]);
    b.copy_from_slice(&bytes[COORD_SIZE..]);
    (swap_endianness(&a), swap_endianness(&b))
}

fn join_wire(a: &[u8; COORD_SIZE], b: &[u8; COORD_SIZE]) -> [u8; 2 * COORD_SIZE] {
    let mut out = [0u8; 2 * COORD_SIZE];
    out[..COORD_SIZE].copy_from_slice(&swap_endianness(a));
    out[COORD_SIZE..].copy_from_slice(&swap_endianness(b));
    out
}

impl PublicKeyLe {
    /// Big-endian `x || y`
    pub fn to_wire(&self) -> [u8; 2 * COORD_SIZE] {
        join_wire(&self.x, &self.y)
    }

    /// From big-endian `x || y`
    pub fn from_wire(bytes: &[u8; 2 * COORD_SIZE]) -> Self {
        let (x, y) = split_wire(bytes);
        Self { x, y }
    }
}

impl SignatureLe {
    /// Big-endian `r || s`
    pub fn to_wire(&self) -> [u8; 2 * COORD_SIZE] {
        join_wire(&self.r, &self.s)
    }

    /// From big-endian `r || s`
    pub fn from_wire(bytes: &[u8; 2 * COORD_SIZE]) -> Self {
        let (r, s) = split_wire(bytes);
        Self { r, s }
    }
}

fn signing_key(private: &[u8; COORD_SIZE]) -> Result<SigningKey, EccError> {
    let be = Zeroizing::new(swap_endianness(private));
    SigningKey::from_slice(be.as_ref()).map_err(|_| EccError("invalid private scalar"))
}

/// Compute the public point of a little-endian private scalar.
pub fn public_key(private: &[u8; COORD_SIZE]) -> Result<PublicKeyLe, EccError> {
    let point = signing_key(private)?
        .verifying_key()
        .to_encoded_point(false);
    let (Some(x), Some(y)) = (point.x(), point.y()) else {
        return Err(EccError("public key is the identity"));
    };
    let mut wire = [0u8; 2 * COORD_SIZE];
    wire[..COORD_SIZE].copy_from_slice(x);
    wire[COORD_SIZE..].copy_from_slice(y);
    Ok(PublicKeyLe::from_wire(&wire))
}

/// Sign `message` (SHA-256, deterministic nonce).
pub fn sign(private: &[u8; COORD_SIZE], message: &[u8]) -> Result<SignatureLe, EccError> {
    let signature: Signature = signing_key(private)?
        .try_sign(message)
        .map_err(|_| EccError("signing failed"))?;
    let mut wire = [0u8; 2 * COORD_SIZE];
    wire.copy_from_slice(&signature.to_bytes());
    Ok(SignatureLe::from_wire(&wire))
}

/// Verify `signature` over `message`.
///
/// Returns `Ok(false)` for a well-formed key and a signature that does not
/// verify, including signatures with out-of-range components.
pub fn verify(
    public: &PublicKeyLe,
    message: &[u8],
    signature: &SignatureLe,
) -> Result<bool, EccError> {
    let mut sec1 = [0u8; 1 + 2 * COORD_SIZE];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(&public.to_wire());
    let key =
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| EccError("invalid public key"))?;
    let Ok(signature) = Signature::from_slice(&signature.to_wire()) else {
        return Ok(false);
    };
    Ok(key.verify(message, &signature).is_ok())
}
