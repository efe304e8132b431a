// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Sealed attestation key blob
//!
//! ```text
//! SealedHeader | AES-128-GCM(RecordSecret) | RecordPlain
//! ```
//!
//! The plaintext record is authenticated as additional data, the secret
//! section is encrypted. The key comes from the hardware seal key bound to the
//! signer identity and the sealing TCB carried in the header's key request.

use super::QeStatus;
use crate::{
    hardware::{Hardware, HwError},
    report::{
        KeyRequest, Report, TargetInfo, KEYNAME_SEAL, KEYPOLICY_MRSIGNER, SEAL_ATTRIBUTE_MASK,
    },
    tcb::{CertTcb, SealTcb},
};
use bytemuck::{bytes_of, Pod, Zeroable};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use std::fmt::{Debug, Formatter};
use tracing::{debug, trace};
use zeroize::{Zeroize, Zeroizing};

/// Layout version of [`RecordPlain`]
pub const ATT_KEY_VERSION: u16 = 1;

const TAG_LEN: usize = 16;

/// Authenticated, unencrypted part of the attestation key record
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct RecordPlain {
    pub key_kind: u16,
    pub key_version: u16,
    pub cert_cpu_svn: [u8; 16],
    pub cert_pce_isv_svn: u16,
    pub cert_pce_id: u16,
    pub raw_cpu_svn: [u8; 16],
    pub raw_pce_isv_svn: u16,
    pub raw_pce_id: u16,
    pub pce_target_info: TargetInfo,
    pub qe_report: Report,
    pub qe_report_cert_sig: [u8; 64],
    pub public_key: [u8; 64],
    pub key_fingerprint: [u8; 32],
    pub seal_cpu_svn: [u8; 16],
    pub seal_isv_svn: u16,
    pub auth_data: [u8; 32],
    pub qe_id: [u8; 16],
    pub reserved: [u8; 64],
}

impl RecordPlain {
    /// TCB the certifier signature was issued for
    pub fn cert_tcb(&self) -> CertTcb {
        CertTcb {
            cpu_svn: self.cert_cpu_svn,
            pce_isv_svn: self.cert_pce_isv_svn,
            pce_id: self.cert_pce_id,
        }
    }

    #[allow(missing_docs)]
    pub fn set_cert_tcb(&mut self, tcb: &CertTcb) {
        self.cert_cpu_svn = tcb.cpu_svn;
        self.cert_pce_isv_svn = tcb.pce_isv_svn;
        self.cert_pce_id = tcb.pce_id;
    }

    /// Platform TCB at certification time
    pub fn raw_tcb(&self) -> CertTcb {
        CertTcb {
            cpu_svn: self.raw_cpu_svn,
            pce_isv_svn: self.raw_pce_isv_svn,
            pce_id: self.raw_pce_id,
        }
    }

    #[allow(missing_docs)]
    pub fn set_raw_tcb(&mut self, tcb: &CertTcb) {
        self.raw_cpu_svn = tcb.cpu_svn;
        self.raw_pce_isv_svn = tcb.pce_isv_svn;
        self.raw_pce_id = tcb.pce_id;
    }

    /// TCB the record is currently sealed under
    pub fn seal_tcb(&self) -> SealTcb {
        SealTcb {
            cpu_svn: self.seal_cpu_svn,
            isv_svn: self.seal_isv_svn,
        }
    }

    #[allow(missing_docs)]
    pub fn set_seal_tcb(&mut self, tcb: &SealTcb) {
        self.seal_cpu_svn = tcb.cpu_svn;
        self.seal_isv_svn = tcb.isv_svn;
    }

    /// A record with a certifier signature
    pub fn is_certified(&self) -> bool {
        self.qe_report_cert_sig != [0; 64]
    }
}

/// Encrypted part of the attestation key record
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct RecordSecret {
    /// little-endian P-256 scalar
    pub private_key: [u8; 32],
    pub crypto_suite: u8,
    pub encrypted_ppid: [u8; 384],
}

impl Zeroize for RecordSecret {
    fn zeroize(&mut self) {
        bytemuck::bytes_of_mut(self).zeroize();
    }
}

impl Debug for RecordSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordSecret { .. }")
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SealedHeader {
    key_request: KeyRequest,
    plaintext_len: u32,
    secret_len: u32,
    iv: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
}

const HEADER_LEN: usize = size_of::<SealedHeader>();
const SECRET_LEN: usize = size_of::<RecordSecret>();
const PLAIN_LEN: usize = size_of::<RecordPlain>();

/// Size of every sealed blob
pub const SEALED_BLOB_SIZE: usize = HEADER_LEN + SECRET_LEN + PLAIN_LEN;

/// Result of [`unseal`]
pub struct Unsealed {
    /// The authenticated record, with the sealing TCB updated on reseal
    pub plain: RecordPlain,
    /// The decrypted secret
    pub secret: Zeroizing<RecordSecret>,
    /// New blob bytes if the sealing TCB advanced
    pub resealed: Option<Vec<u8>>,
}

fn random<const N: usize>() -> Result<[u8; N], QeStatus> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out).map_err(|_| QeStatus::CryptoError)?;
    Ok(out)
}

fn aead_key(key: &[u8; 16]) -> Result<LessSafeKey, QeStatus> {
    UnboundKey::new(&AES_128_GCM, key)
        .map(LessSafeKey::new)
        .map_err(|_| QeStatus::CryptoError)
}

/// Seal `plain` and `secret` under the sealing TCB recorded in `plain`.
pub fn seal(
    hw: &dyn Hardware,
    plain: &RecordPlain,
    secret: &RecordSecret,
) -> Result<Vec<u8>, QeStatus> {
    let tcb = plain.seal_tcb();
    let key_request = KeyRequest {
        key_name: KEYNAME_SEAL,
        key_policy: KEYPOLICY_MRSIGNER,
        isv_svn: tcb.isv_svn,
        cpu_svn: tcb.cpu_svn,
        attribute_mask: SEAL_ATTRIBUTE_MASK,
        key_id: random()?,
        ..Zeroable::zeroed()
    };
    let seal_key = Zeroizing::new(hw.get_key(&key_request)?);
    let iv: [u8; NONCE_LEN] = random()?;

    let mut ciphertext = Zeroizing::new(bytes_of(secret).to_vec());
    let tag = aead_key(&seal_key)?
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(bytes_of(plain)),
            ciphertext.as_mut_slice(),
        )
        .map_err(|_| QeStatus::CryptoError)?;

    let mut header = SealedHeader {
        key_request,
        plaintext_len: PLAIN_LEN as u32,
        secret_len: SECRET_LEN as u32,
        iv,
        tag: [0; TAG_LEN],
    };
    header.tag.copy_from_slice(tag.as_ref());

    let mut blob = Vec::with_capacity(SEALED_BLOB_SIZE);
    blob.extend_from_slice(bytes_of(&header));
    blob.extend_from_slice(&ciphertext);
    blob.extend_from_slice(bytes_of(plain));
    trace!(len = blob.len(), "sealed attestation key record");
    Ok(blob)
}

/// Unseal `blob`, resealing it if `current` differs from its sealing TCB.
///
/// Every integrity failure maps to [`QeStatus::InvalidBlob`].
pub fn unseal(hw: &dyn Hardware, blob: &[u8], current: &SealTcb) -> Result<Unsealed, QeStatus> {
    if blob.len() != SEALED_BLOB_SIZE {
        return Err(QeStatus::InvalidBlob);
    }
    let header: SealedHeader = bytemuck::pod_read_unaligned(&blob[..HEADER_LEN]);
    if header.plaintext_len as usize != PLAIN_LEN || header.secret_len as usize != SECRET_LEN {
        return Err(QeStatus::InvalidBlob);
    }

    let key_request = header.key_request;
    let seal_key = Zeroizing::new(hw.get_key(&key_request).map_err(|e| match e {
        HwError::BoundaryLost => QeStatus::BoundaryLost,
        HwError::OutOfMemory => QeStatus::OutOfMemory,
        _ => QeStatus::InvalidBlob,
    })?);

    let plaintext = &blob[HEADER_LEN + SECRET_LEN..];
    let mut in_out = Zeroizing::new(Vec::with_capacity(SECRET_LEN + TAG_LEN));
    in_out.extend_from_slice(&blob[HEADER_LEN..HEADER_LEN + SECRET_LEN]);
    in_out.extend_from_slice(&{ header.tag });

    let secret_bytes = aead_key(&seal_key)?
        .open_in_place(
            Nonce::assume_unique_for_key(header.iv),
            Aad::from(plaintext),
            in_out.as_mut_slice(),
        )
        .map_err(|_| QeStatus::InvalidBlob)?;
    let secret: Zeroizing<RecordSecret> =
        Zeroizing::new(bytemuck::pod_read_unaligned(secret_bytes));
    let mut plain: RecordPlain = bytemuck::pod_read_unaligned(plaintext);

    if plain.seal_tcb()
        != (SealTcb {
            cpu_svn: key_request.cpu_svn,
            isv_svn: key_request.isv_svn,
        })
    {
        return Err(QeStatus::InvalidBlob);
    }

    let resealed = if plain.seal_tcb() != *current {
        debug!("sealing TCB advanced, resealing attestation key record");
        plain.set_seal_tcb(current);
        Some(seal(hw, &plain, &secret)?)
    } else {
        None
    };

    Ok(Unsealed {
        plain,
        secret,
        resealed,
    })
}
