// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Quote assembly inside the quoting enclave

use super::{blob, GeneratedQuote, QeReportRequest, QeStatus, AUTH_DATA_SIZE};
use crate::{
    ecc::{self, PublicKeyLe},
    hardware::{Hardware, HwError},
    quote::{
        quote_size, signature_data_size, CertDataType, CertificationData, Data, Encode, Header,
        PpidRsa3072Payload, QEReportCertificationData, SignatureData, TDReport10,
        ATT_KEY_TYPE_ECDSA_P256, PPID_RSA3072_PAYLOAD_LEN, QE_VENDOR_ID_INTEL, QUOTE_VERSION,
        SIGNATURE_OFFSET, SIGNED_REGION_LEN, TEE_TYPE_TDX,
    },
    report::{
        TdReport, REPORT_DATA_SIZE, TD_REPORT_MAX_VERSION, TD_REPORT_SUBTYPE, TD_REPORT_TEE_TYPE,
    },
    util::pad,
};
use bytemuck::bytes_of;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Check the structure tags, the hardware MAC and both sub-hashes of `report`.
pub(crate) fn validate_td_report(hw: &dyn Hardware, report: &TdReport) -> Result<(), QeStatus> {
    let report_type = &report.report_mac.report_type;
    if report_type.tee_type != TD_REPORT_TEE_TYPE
        || report_type.subtype != TD_REPORT_SUBTYPE
        || report_type.version > TD_REPORT_MAX_VERSION
    {
        debug!(?report_type, "unexpected TD report type");
        return Err(QeStatus::InvalidReport);
    }

    hw.verify_td_report(report).map_err(|e| match e {
        HwError::BoundaryLost => QeStatus::BoundaryLost,
        HwError::OutOfMemory => QeStatus::OutOfMemory,
        _ => QeStatus::InvalidReport,
    })?;

    if report.tee_tcb_info_hash() != report.report_mac.tee_tcb_info_hash
        || report.td_info_hash() != report.report_mac.tee_info_hash
    {
        debug!("TD report sub-hash mismatch");
        return Err(QeStatus::InvalidReport);
    }
    Ok(())
}

/// The inner certification section carried by a quote.
pub(crate) fn cert_section(
    pck_cert_chain: Option<&[u8]>,
    plain: &blob::RecordPlain,
    secret: &blob::RecordSecret,
) -> CertificationData {
    match pck_cert_chain {
        Some(chain) => CertificationData::new(CertDataType::PckCertChain, chain.to_vec()),
        None => {
            let payload = PpidRsa3072Payload {
                encrypted_ppid: secret.encrypted_ppid,
                cpu_svn: plain.cert_cpu_svn,
                pce_isv_svn: plain.cert_pce_isv_svn,
                pce_id: plain.cert_pce_id,
            };
            CertificationData::new(
                CertDataType::PpidRsa3072Encrypted,
                bytes_of(&payload).to_vec(),
            )
        }
    }
}

/// Size of a quote carrying `pck_cert_chain`, or the PPID fallback.
pub fn quote_size_for(pck_cert_chain: Option<&[u8]>) -> usize {
    quote_size(
        AUTH_DATA_SIZE,
        pck_cert_chain.map_or(PPID_RSA3072_PAYLOAD_LEN, <[u8]>::len),
    )
}

pub(crate) fn assemble(
    hw: &dyn Hardware,
    sealed: &[u8],
    td_report: &TdReport,
    request: Option<&QeReportRequest>,
    pck_cert_chain: Option<&[u8]>,
    quote: &mut [u8],
) -> Result<GeneratedQuote, QeStatus> {
    validate_td_report(hw, td_report)?;

    let current = super::current_seal_tcb(hw)?;
    let unsealed = blob::unseal(hw, sealed, &current)?;
    let plain = unsealed.plain;
    if !plain.is_certified() {
        return Err(QeStatus::InvalidBlob);
    }

    let cert = cert_section(pck_cert_chain, &plain, &unsealed.secret);
    let size = quote_size(AUTH_DATA_SIZE, cert.body.data.len());
    if quote.len() < size {
        debug!(needed = size, got = quote.len(), "quote buffer too small");
        return Err(QeStatus::InvalidParameter);
    }
    let quote = &mut quote[..size];

    let mut user_data = [0u8; 20];
    user_data[..16].copy_from_slice(&{ plain.qe_id });
    let header = Header {
        version: QUOTE_VERSION,
        attestation_key_type: ATT_KEY_TYPE_ECDSA_P256,
        tee_type: TEE_TYPE_TDX,
        qe_svn: plain.qe_report.body.isv_svn,
        pce_svn: plain.cert_pce_isv_svn,
        qe_vendor_id: QE_VENDOR_ID_INTEL,
        user_data,
    };
    let body = TDReport10::from(td_report);
    {
        let mut out = &mut quote[..SIGNED_REGION_LEN];
        header
            .encode(&mut out)
            .and_then(|_| body.encode(&mut out))
            .map_err(|_| QeStatus::Unexpected)?;
    }

    let signature = ecc::sign(&unsealed.secret.private_key, &quote[..SIGNED_REGION_LEN])
        .map_err(|_| QeStatus::CryptoError)?;
    let public = PublicKeyLe::from_wire(&{ plain.public_key });
    let verified = ecc::verify(&public, &quote[..SIGNED_REGION_LEN], &signature)
        .map_err(|_| QeStatus::CryptoError)?;
    if !verified {
        warn!("attestation key signature failed self-verification");
        getrandom::fill(&mut quote[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 64])
            .map_err(|_| QeStatus::CryptoError)?;
        return Err(QeStatus::CryptoError);
    }

    let signature_data = SignatureData {
        ecdsa_signature: signature.to_wire(),
        ecdsa_attestation_key: plain.public_key,
        qe_report_data: QEReportCertificationData {
            qe_report: bytemuck::cast(plain.qe_report.body),
            qe_report_signature: plain.qe_report_cert_sig,
            qe_auth_data: Data::new(plain.auth_data.to_vec()),
            certification_data: cert,
        },
    };
    debug_assert_eq!(
        signature_data.encoded_len(),
        signature_data_size(
            AUTH_DATA_SIZE,
            signature_data.qe_report_data.certification_data.body.data.len(),
        )
    );
    {
        let mut out = &mut quote[SIGNED_REGION_LEN..];
        (signature_data.encoded_len() as u32)
            .encode(&mut out)
            .and_then(|_| signature_data.encode(&mut out))
            .map_err(|_| QeStatus::Unexpected)?;
    }

    let qe_report = match request {
        Some(request) => {
            let mut hasher = Sha256::new();
            hasher.update(request.nonce);
            hasher.update(&*quote);
            let report_data: [u8; REPORT_DATA_SIZE] =
                pad(&hasher.finalize()).map_err(|_| QeStatus::Unexpected)?;
            Some(hw.create_report(&request.target_info, &report_data)?)
        }
        None => None,
    };

    Ok(GeneratedQuote {
        len: size,
        qe_report,
        resealed: unsealed.resealed,
    })
}
