// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Attestation key derivation
//!
//! The key is a pure function of the signer-bound seal key at the sealing TCB:
//! the seal key is expanded to a 320 bit seed with CMAC-AES-128 in counter mode
//! (NIST SP 800-108), and the seed is reduced into `[1, n - 1]`.

use super::QeStatus;
use crate::{
    ecc,
    hardware::Hardware,
    report::{KeyRequest, KEYNAME_SEAL, KEYPOLICY_MRSIGNER, SEAL_ATTRIBUTE_MASK},
    tcb::SealTcb,
};
use aes::Aes128;
use bytemuck::Zeroable;
use cmac::{Cmac, Mac};
use num_bigint::BigUint;
use num_traits::One;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// `"TDQE-ATT-KEY" || 0x00 || L`, with `L = 320` the seed size in bits
const ATT_KEY_LABEL: [u8; 15] = *b"TDQE-ATT-KEY\x00\x01\x40";
const SEED_ROUNDS: u8 = 3;
const SEED_SIZE: usize = 40;

const ATT_KEY_ID: [u8; 32] = *b"tdqe attestation key derivation!";
const QE_ID_KEY_ID: [u8; 32] = *b"tdqe platform identifier derive!";

/// P-256 group order minus one, big-endian
const P256_ORDER_MINUS_ONE: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84, 0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63, 0x25, 0x50,
];

/// A derived attestation key
pub struct AttestationKey {
    /// little-endian private scalar
    pub private: ecc::PrivateKeyLe,
    /// big-endian `x || y`
    pub public: [u8; 64],
}

fn seal_key_request(tcb: &SealTcb, key_id: [u8; 32]) -> KeyRequest {
    KeyRequest {
        key_name: KEYNAME_SEAL,
        key_policy: KEYPOLICY_MRSIGNER,
        isv_svn: tcb.isv_svn,
        cpu_svn: tcb.cpu_svn,
        attribute_mask: SEAL_ATTRIBUTE_MASK,
        key_id,
        ..Zeroable::zeroed()
    }
}

fn expand_seed(seal_key: &[u8; 16]) -> Result<Zeroizing<[u8; SEED_SIZE]>, QeStatus> {
    let mut stream = Zeroizing::new([0u8; 16 * SEED_ROUNDS as usize]);
    for (counter, block) in (1..=SEED_ROUNDS).zip(stream.chunks_exact_mut(16)) {
        let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(seal_key)
            .map_err(|_| QeStatus::CryptoError)?;
        mac.update(&[counter]);
        mac.update(&ATT_KEY_LABEL);
        block.copy_from_slice(&mac.finalize().into_bytes());
    }
    let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
    seed.copy_from_slice(&stream[..SEED_SIZE]);
    Ok(seed)
}

/// Reduce a big-endian seed into a little-endian scalar in `[1, n - 1]`.
fn scalar_from_seed(seed: &[u8; SEED_SIZE]) -> Zeroizing<[u8; 32]> {
    let mut le = Zeroizing::new(*seed);
    le.reverse();
    let order_minus_one = BigUint::from_bytes_be(&P256_ORDER_MINUS_ONE);
    let d = BigUint::from_bytes_le(&le[..]) % order_minus_one + BigUint::one();

    let mut scalar = Zeroizing::new([0u8; 32]);
    let bytes = Zeroizing::new(d.to_bytes_le());
    scalar[..bytes.len()].copy_from_slice(&bytes);
    scalar
}

/// Derive the attestation key for the sealing TCB `tcb`.
pub fn derive_attestation_key(
    hw: &dyn Hardware,
    tcb: &SealTcb,
) -> Result<AttestationKey, QeStatus> {
    let seal_key = Zeroizing::new(hw.get_key(&seal_key_request(tcb, ATT_KEY_ID))?);
    let seed = expand_seed(&seal_key)?;
    let private = scalar_from_seed(&seed);
    let public = ecc::public_key(&private)
        .map_err(|_| QeStatus::CryptoError)?
        .to_wire();
    Ok(AttestationKey { private, public })
}

/// Derive the 16 byte platform identifier.
pub fn derive_qe_id(hw: &dyn Hardware, tcb: &SealTcb) -> Result<[u8; 16], QeStatus> {
    let key = Zeroizing::new(hw.get_key(&seal_key_request(tcb, QE_ID_KEY_ID))?);
    let digest = Sha256::digest(&key[..]);
    let mut qe_id = [0u8; 16];
    qe_id.copy_from_slice(&digest[..16]);
    Ok(qe_id)
}

/// `SHA-256(public_key || auth_data)`
pub fn key_fingerprint(public_key: &[u8; 64], auth_data: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(auth_data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn label_block_is_sixteen_bytes() {
        assert_eq!(1 + ATT_KEY_LABEL.len(), 16);
        assert_eq!(u16::from_be_bytes([ATT_KEY_LABEL[13], ATT_KEY_LABEL[14]]), 320);
    }

    #[test]
    fn scalar_is_in_range() {
        let ones = scalar_from_seed(&[0xff; SEED_SIZE]);
        assert_ne!(*ones, [0u8; 32]);
        assert!(ecc::public_key(&ones).is_ok());

        let zero = scalar_from_seed(&[0u8; SEED_SIZE]);
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(*zero, one);
    }

    #[test]
    fn derivation_is_deterministic_per_tcb() {
        let platform = SimPlatform::default();
        let qe = platform.qe_hardware();
        let tcb = platform.qe_seal_tcb();

        let a = derive_attestation_key(&qe, &tcb).unwrap();
        let b = derive_attestation_key(&qe, &tcb).unwrap();
        assert_eq!(*a.private, *b.private);
        assert_eq!(a.public, b.public);

        platform.set_cpu_svn([9; 16]);
        let c = derive_attestation_key(&qe, &platform.qe_seal_tcb()).unwrap();
        assert_ne!(a.public, c.public);
    }

    #[test]
    fn public_key_matches_private() {
        let platform = SimPlatform::default();
        let qe = platform.qe_hardware();
        let key = derive_attestation_key(&qe, &platform.qe_seal_tcb()).unwrap();
        let public = ecc::PublicKeyLe::from_wire(&key.public);
        let sig = ecc::sign(&key.private, b"body").unwrap();
        assert!(ecc::verify(&public, b"body", &sig).unwrap());
    }

    #[test]
    fn qe_id_is_stable() {
        let platform = SimPlatform::default();
        let qe = platform.qe_hardware();
        let tcb = platform.qe_seal_tcb();
        assert_eq!(derive_qe_id(&qe, &tcb).unwrap(), derive_qe_id(&qe, &tcb).unwrap());
    }

    #[test]
    fn fingerprint_commits_to_auth_data() {
        let a = key_fingerprint(&[1; 64], &[0; 32]);
        let b = key_fingerprint(&[1; 64], &[1; 32]);
        assert_ne!(a, b);
    }
}
