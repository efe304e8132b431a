// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! The quoting enclave
//!
//! Code in this module runs inside the isolated boundary. It only talks to the
//! platform through [`Hardware`] and reports failures as [`QeStatus`] codes,
//! which the host side translates exactly once.

pub mod assemble;
pub mod blob;
pub mod keygen;

use crate::{
    hardware::{Hardware, HwError},
    report::{Report, ReportBody, TargetInfo, TdReport, REPORT_DATA_SIZE},
    tcb::{CertTcb, SealTcb},
    util::pad,
};
use blob::{RecordPlain, RecordSecret, ATT_KEY_VERSION};
use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Size of the owner supplied auth data
pub const AUTH_DATA_SIZE: usize = 32;
/// Size of the companion report nonce
pub const NONCE_SIZE: usize = 16;
/// Size of the encrypted platform identifier
pub const ENCRYPTED_PPID_SIZE: usize = 384;

/// Status codes returned across the quoting enclave boundary
#[repr(u32)]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum QeStatus {
    #[error("invalid parameter")]
    InvalidParameter = 1,
    #[error("out of enclave memory")]
    OutOfMemory = 2,
    #[error("enclave lost")]
    BoundaryLost = 3,
    #[error("invalid attestation key blob")]
    InvalidBlob = 4,
    #[error("crypto primitive failure")]
    CryptoError = 5,
    #[error("invalid TD report")]
    InvalidReport = 6,
    #[error("unsupported attestation key kind")]
    UnsupportedKeyKind = 7,
    #[error("invalid certification data")]
    InvalidCertData = 8,
    #[error("unexpected enclave failure")]
    Unexpected = 0xff,
}

impl From<HwError> for QeStatus {
    fn from(e: HwError) -> Self {
        match e {
            HwError::InvalidParameter => Self::InvalidParameter,
            HwError::OutOfMemory => Self::OutOfMemory,
            HwError::BoundaryLost => Self::BoundaryLost,
            HwError::InvalidSvn | HwError::MacMismatch | HwError::Unexpected => Self::Unexpected,
        }
    }
}

/// The certification key type an attestation key is certified for
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum CertKeyType {
    /// Cleartext platform identifier
    PpidCleartext = 1,
    /// Platform identifier encrypted with RSA-2048
    PpidRsa2048Encrypted = 2,
    /// Platform identifier encrypted with RSA-3072
    PpidRsa3072Encrypted = 3,
}

/// The encrypted platform identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPpid {
    /// Encryption scheme
    pub crypto_suite: u8,
    /// Ciphertext
    pub data: [u8; ENCRYPTED_PPID_SIZE],
}

/// A freshly generated, not yet certified attestation key
pub struct AttKeyStaging {
    /// Sealed record without certification data; never persisted
    pub blob: Vec<u8>,
    /// Self report targeted at the certifier, committing to the key fingerprint
    pub qe_report: Report,
    /// Platform identifier
    pub qe_id: [u8; 16],
}

/// Certification to store into a blob
pub struct CertificationInput {
    /// TCB the certifier signed for
    pub cert_tcb: CertTcb,
    /// Platform TCB at certification time
    pub raw_tcb: CertTcb,
    /// Certifier target the self report was produced for
    pub pce_target_info: TargetInfo,
    /// The certified self report
    pub qe_report: Report,
    /// Certifier signature over the self report body, big-endian `r || s`
    pub signature: [u8; 64],
    /// Encrypted platform identifier, if freshly fetched
    pub ppid: Option<EncryptedPpid>,
}

/// A sealed, certified record
pub struct SealedRecord {
    /// Sealed blob
    pub blob: Vec<u8>,
    /// Its plaintext part
    pub record: RecordPlain,
}

/// Result of [`QuotingEnclave::verify_blob`]
pub struct BlobInfo {
    /// Plaintext part of the record
    pub record: RecordPlain,
    /// TCB of the running enclave
    pub current_tcb: SealTcb,
    /// New blob bytes if the sealing TCB advanced
    pub resealed: Option<Vec<u8>>,
    /// Encrypted platform identifier, if requested
    pub encrypted_ppid: Option<EncryptedPpid>,
}

/// Request for a companion report binding a quote to a nonce
#[derive(Copy, Clone, Debug)]
pub struct QeReportRequest {
    /// Caller chosen nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The enclave the companion report is targeted at
    pub target_info: TargetInfo,
}

/// Result of [`QuotingEnclave::gen_quote`]
pub struct GeneratedQuote {
    /// Bytes written to the quote buffer
    pub len: usize,
    /// Companion report, if requested
    pub qe_report: Option<Report>,
    /// New blob bytes if the sealing TCB advanced
    pub resealed: Option<Vec<u8>>,
}

pub(crate) fn self_identity(hw: &dyn Hardware) -> Result<ReportBody, QeStatus> {
    Ok(hw.create_report(&TargetInfo::zeroed(), &[0; REPORT_DATA_SIZE])?.body)
}

pub(crate) fn current_seal_tcb(hw: &dyn Hardware) -> Result<SealTcb, QeStatus> {
    let identity = self_identity(hw)?;
    Ok(SealTcb {
        cpu_svn: identity.cpu_svn,
        isv_svn: identity.isv_svn,
    })
}

/// Entry points of a loaded quoting enclave
#[derive(Clone)]
pub struct QuotingEnclave {
    hw: Arc<dyn Hardware>,
}

impl QuotingEnclave {
    /// Wrap a loaded boundary
    pub fn new(hw: Arc<dyn Hardware>) -> Self {
        Self { hw }
    }

    /// The underlying boundary
    pub fn hardware(&self) -> Arc<dyn Hardware> {
        self.hw.clone()
    }

    /// Report body of the running enclave
    pub fn identity(&self) -> Result<ReportBody, QeStatus> {
        self_identity(&*self.hw)
    }

    /// Target info for reports addressed to this enclave
    pub fn target_info(&self) -> Result<TargetInfo, QeStatus> {
        Ok(TargetInfo::from(&self.identity()?))
    }

    /// Derive the attestation key and seal it uncertified.
    pub fn gen_att_key(
        &self,
        kind: CertKeyType,
        auth_data: &[u8; AUTH_DATA_SIZE],
        pce_target_info: &TargetInfo,
    ) -> Result<AttKeyStaging, QeStatus> {
        if kind != CertKeyType::PpidRsa3072Encrypted {
            return Err(QeStatus::UnsupportedKeyKind);
        }
        let hw = &*self.hw;
        let seal_tcb = current_seal_tcb(hw)?;
        let key = keygen::derive_attestation_key(hw, &seal_tcb)?;
        let qe_id = keygen::derive_qe_id(hw, &seal_tcb)?;
        let fingerprint = keygen::key_fingerprint(&key.public, auth_data);
        let report_data = pad(&fingerprint).map_err(|_| QeStatus::Unexpected)?;
        let qe_report = hw.create_report(pce_target_info, &report_data)?;

        let mut record = RecordPlain::zeroed();
        record.key_kind = kind as u16;
        record.key_version = ATT_KEY_VERSION;
        record.pce_target_info = *pce_target_info;
        record.qe_report = qe_report;
        record.public_key = key.public;
        record.key_fingerprint = fingerprint;
        record.set_seal_tcb(&seal_tcb);
        record.auth_data = *auth_data;
        record.qe_id = qe_id;

        let mut secret = Zeroizing::new(RecordSecret::zeroed());
        secret.private_key = *key.private;

        let blob = blob::seal(hw, &record, &secret)?;
        debug!(qe_id = %hex::encode(qe_id), "generated attestation key");
        Ok(AttKeyStaging {
            blob,
            qe_report,
            qe_id,
        })
    }

    /// Produce a fresh self report for the key in `blob`, targeted at the certifier.
    pub fn self_report(
        &self,
        blob: &[u8],
        pce_target_info: &TargetInfo,
    ) -> Result<Report, QeStatus> {
        let hw = &*self.hw;
        let unsealed = blob::unseal(hw, blob, &current_seal_tcb(hw)?)?;
        let report_data =
            pad(&{ unsealed.plain.key_fingerprint }).map_err(|_| QeStatus::Unexpected)?;
        Ok(hw.create_report(pce_target_info, &report_data)?)
    }

    /// Patch the certification fields of `blob` and reseal it.
    pub fn store_cert_data(
        &self,
        blob: &[u8],
        cert: &CertificationInput,
    ) -> Result<SealedRecord, QeStatus> {
        let hw = &*self.hw;
        let identity = self_identity(hw)?;
        let current = SealTcb {
            cpu_svn: identity.cpu_svn,
            isv_svn: identity.isv_svn,
        };
        let blob::Unsealed {
            plain: mut record,
            mut secret,
            ..
        } = blob::unseal(hw, blob, &current)?;

        let body = &cert.qe_report.body;
        if body.mr_enclave != identity.mr_enclave
            || body.mr_signer != identity.mr_signer
            || body.isv_prod_id != identity.isv_prod_id
            || body.report_data[..32] != record.key_fingerprint
        {
            debug!("certified report does not belong to this key");
            return Err(QeStatus::InvalidParameter);
        }
        if cert.signature == [0; 64] {
            return Err(QeStatus::InvalidCertData);
        }

        record.set_cert_tcb(&cert.cert_tcb);
        record.set_raw_tcb(&cert.raw_tcb);
        record.pce_target_info = cert.pce_target_info;
        record.qe_report = cert.qe_report;
        record.qe_report_cert_sig = cert.signature;
        record.set_seal_tcb(&current);
        if let Some(ppid) = &cert.ppid {
            secret.crypto_suite = ppid.crypto_suite;
            secret.encrypted_ppid = ppid.data;
        }

        let blob = blob::seal(hw, &record, &secret)?;
        Ok(SealedRecord { blob, record })
    }

    /// Unseal a certified blob and report its plaintext part.
    pub fn verify_blob(&self, blob: &[u8], want_ppid: bool) -> Result<BlobInfo, QeStatus> {
        let hw = &*self.hw;
        let current_tcb = current_seal_tcb(hw)?;
        let unsealed = blob::unseal(hw, blob, &current_tcb)?;
        if !unsealed.plain.is_certified() {
            return Err(QeStatus::InvalidBlob);
        }
        let encrypted_ppid = want_ppid.then(|| EncryptedPpid {
            crypto_suite: unsealed.secret.crypto_suite,
            data: unsealed.secret.encrypted_ppid,
        });
        Ok(BlobInfo {
            record: unsealed.plain,
            current_tcb,
            resealed: unsealed.resealed,
            encrypted_ppid,
        })
    }

    /// Assemble and sign a quote for `td_report` into `quote`.
    pub fn gen_quote(
        &self,
        blob: &[u8],
        td_report: &TdReport,
        request: Option<&QeReportRequest>,
        pck_cert_chain: Option<&[u8]>,
        quote: &mut [u8],
    ) -> Result<GeneratedQuote, QeStatus> {
        assemble::assemble(&*self.hw, blob, td_report, request, pck_cert_chain, quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn generated_key_is_bound_to_report() {
        let platform = SimPlatform::default();
        let qe = QuotingEnclave::new(Arc::new(platform.qe_hardware()));
        let pce_target = platform.pce_target_info();
        let auth_data = [0x5a; 32];

        let staging = qe
            .gen_att_key(CertKeyType::PpidRsa3072Encrypted, &auth_data, &pce_target)
            .unwrap();
        let hw = platform.qe_hardware();
        let unsealed =
            blob::unseal(&hw, &staging.blob, &current_seal_tcb(&hw).unwrap()).unwrap();
        let record = unsealed.plain;
        assert_eq!(
            { record.key_fingerprint },
            keygen::key_fingerprint(&{ record.public_key }, &auth_data)
        );
        assert_eq!(
            staging.qe_report.report_data_hash(),
            &{ record.key_fingerprint }[..]
        );
        assert!(!record.is_certified());

        // an uncertified key is not usable
        assert_eq!(
            qe.verify_blob(&staging.blob, false).err(),
            Some(QeStatus::InvalidBlob)
        );
    }

    #[test]
    fn unsupported_key_kind() {
        let platform = SimPlatform::default();
        let qe = QuotingEnclave::new(Arc::new(platform.qe_hardware()));
        assert_eq!(
            qe.gen_att_key(
                CertKeyType::PpidCleartext,
                &[0; 32],
                &platform.pce_target_info()
            )
            .err(),
            Some(QeStatus::UnsupportedKeyKind)
        );
    }

    #[test]
    fn store_rejects_foreign_report() {
        let platform = SimPlatform::default();
        let qe = QuotingEnclave::new(Arc::new(platform.qe_hardware()));
        let pce_target = platform.pce_target_info();
        let staging = qe
            .gen_att_key(CertKeyType::PpidRsa3072Encrypted, &[0; 32], &pce_target)
            .unwrap();

        let mut qe_report = staging.qe_report;
        qe_report.body.report_data[0] ^= 1;
        let cert = CertificationInput {
            cert_tcb: CertTcb::default(),
            raw_tcb: CertTcb::default(),
            pce_target_info: pce_target,
            qe_report,
            signature: [1; 64],
            ppid: None,
        };
        assert_eq!(
            qe.store_cert_data(&staging.blob, &cert).err(),
            Some(QeStatus::InvalidParameter)
        );
    }
}
