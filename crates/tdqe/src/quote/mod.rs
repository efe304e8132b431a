// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Quote envelope wire format
//!
//! A version 4 ECDSA P-256 TDX quote:
//!
//! ```text
//! Header (48) | TD report body (584) | u32 len | signature data
//! signature data = sig (64) | attestation key (64)
//!                | u16 type = 6 | u32 len | QE report certification data
//! QE report certification data = QE report (384) | QE report sig (64)
//!                | u16 len | auth data | u16 type | u32 len | payload
//! ```
//!
//! All integers are little-endian.

pub mod error;

use crate::report::TdReport;
use bytemuck::{bytes_of, AnyBitPattern, NoUninit, Pod, Zeroable};
use error::{EnvelopeContext as _, EnvelopeError};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    io::{Read, Write},
};
use tracing::trace;

/// Quote format version produced by this crate
pub const QUOTE_VERSION: u16 = 4;
/// Attestation key type ECDSA-256 with P-256
pub const ATT_KEY_TYPE_ECDSA_P256: u16 = 2;
#[allow(missing_docs)]
pub const TEE_TYPE_TDX: u32 = 0x00000081;
/// Vendor id of the Intel quoting enclave
pub const QE_VENDOR_ID_INTEL: [u8; 16] = [
    0x93, 0x9a, 0x72, 0x33, 0xf7, 0x9c, 0x4c, 0xa9, 0x94, 0x0a, 0x0d, 0xb3, 0x95, 0x7f, 0x06, 0x07,
];

#[allow(missing_docs)]
pub const HEADER_BYTE_LEN: usize = 48;
#[allow(missing_docs)]
pub const TD_REPORT10_BYTE_LEN: usize = 584;
/// Bytes covered by the attestation key signature
pub const SIGNED_REGION_LEN: usize = HEADER_BYTE_LEN + TD_REPORT10_BYTE_LEN;
#[allow(missing_docs)]
pub const ENCLAVE_REPORT_BYTE_LEN: usize = 384;
#[allow(missing_docs)]
pub const ECDSA_SIGNATURE_BYTE_LEN: usize = 64;
#[allow(missing_docs)]
pub const ECDSA_PUBKEY_BYTE_LEN: usize = 64;
#[allow(missing_docs)]
pub const QE_REPORT_SIG_BYTE_LEN: usize = ECDSA_SIGNATURE_BYTE_LEN;
/// Size of the `u16` auth data length field
pub const AUTH_DATA_HEADER_LEN: usize = 2;
/// Size of a certification data header (`u16` type, `u32` length)
pub const CERT_DATA_HEADER_LEN: usize = 6;
/// Size of the PPID fallback certification payload
pub const PPID_RSA3072_PAYLOAD_LEN: usize = 404;

/// Offset of the signature in an encoded quote
pub const SIGNATURE_OFFSET: usize = SIGNED_REGION_LEN + 4;

/// Size of the signature data for the given auth data and certification payload sizes.
pub const fn signature_data_size(auth_data_len: usize, cert_payload_len: usize) -> usize {
    ECDSA_SIGNATURE_BYTE_LEN
        + ECDSA_PUBKEY_BYTE_LEN
        + CERT_DATA_HEADER_LEN
        + ENCLAVE_REPORT_BYTE_LEN
        + QE_REPORT_SIG_BYTE_LEN
        + AUTH_DATA_HEADER_LEN
        + auth_data_len
        + CERT_DATA_HEADER_LEN
        + cert_payload_len
}

/// Size of the complete quote for the given auth data and certification payload sizes.
pub const fn quote_size(auth_data_len: usize, cert_payload_len: usize) -> usize {
    SIGNED_REGION_LEN + 4 + signature_data_size(auth_data_len, cert_payload_len)
}

/// Certification data types
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CertDataType {
    PpidCleartext = 1,
    PpidRsa2048Encrypted = 2,
    PpidRsa3072Encrypted = 3,
    PckCertificate = 4,
    PckCertChain = 5,
    QeReportCertificationData = 6,
}

mod serde_bytes {
    use serde::Deserialize;

    pub(crate) trait FromBytes {
        fn from_bytes(bytes: Vec<u8>) -> Option<Self>
        where
            Self: Sized;
    }
    impl FromBytes for Vec<u8> {
        fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
            Some(bytes)
        }
    }
    impl<const N: usize> FromBytes for [u8; N] {
        fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
            bytes.try_into().ok()
        }
    }

    pub(crate) fn serialize<S: serde::Serializer>(
        data: impl AsRef<[u8]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let hex_str = hex::encode(data);
        serializer.serialize_str(&hex_str)
    }

    pub(crate) fn deserialize<'de, D: serde::Deserializer<'de>, T: FromBytes>(
        deserializer: D,
    ) -> Result<T, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex_str).map_err(serde::de::Error::custom)?;
        T::from_bytes(bytes).ok_or_else(|| serde::de::Error::custom("invalid bytes"))
    }
}

/// Read a value in LE format.
pub trait Decode: Sized {
    /// Attempt to deserialise the value from input.
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError>;
}

/// Write a value in LE format.
pub trait Encode {
    /// Number of bytes [`Encode::encode`] writes
    fn encoded_len(&self) -> usize;
    /// Serialise the value to output.
    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError>;
}

impl<T: AnyBitPattern> Decode for T {
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError> {
        let mut bytes = vec![0u8; size_of::<T>()];
        input.read_exact(&mut bytes).context("parsing bytes")?;
        bytemuck::try_pod_read_unaligned(&bytes).map_err(Into::into)
    }
}

impl<T: NoUninit> Encode for T {
    fn encoded_len(&self) -> usize {
        size_of::<T>()
    }

    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError> {
        output
            .write_all(bytemuck::bytes_of(self))
            .context("writing bytes")
    }
}

/// Length prefixed byte section
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Data<T> {
    pub data: Vec<u8>,
    _marker: core::marker::PhantomData<T>,
}

impl<T> Data<T> {
    /// Wrap `data`
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            _marker: core::marker::PhantomData,
        }
    }
}

impl<T> Serialize for Data<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(&self.data, serializer)
    }
}

impl<'de, T> Deserialize<'de> for Data<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_bytes::deserialize(deserializer).map(Data::new)
    }
}

impl<T: Decode + Into<u64>> Decode for Data<T> {
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError> {
        let len = T::decode(input)?;
        let mut data = vec![0u8; len.into() as usize];
        input.read_exact(&mut data).context("reading bytes")?;
        Ok(Data::new(data))
    }
}

impl<T: Encode + TryFrom<usize>> Encode for Data<T> {
    fn encoded_len(&self) -> usize {
        size_of::<T>() + self.data.len()
    }

    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError> {
        let len = T::try_from(self.data.len())
            .map_err(|_| EnvelopeError::SectionSize(format!("{} bytes", self.data.len())))?;
        len.encode(output)?;
        output.write_all(&self.data).context("writing section")
    }
}

#[allow(missing_docs)]
#[derive(Pod, Zeroable, Debug, Serialize, Deserialize, Copy, Clone)]
#[repr(C, packed)]
pub struct Header {
    pub version: u16,
    pub attestation_key_type: u16,
    pub tee_type: u32,
    pub qe_svn: u16,
    pub pce_svn: u16,
    #[serde(with = "serde_bytes")]
    pub qe_vendor_id: [u8; 16],
    #[serde(with = "serde_bytes")]
    pub user_data: [u8; 20],
}

#[derive(Pod, Zeroable, Debug, Copy, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
#[repr(C, packed)]
pub struct TDReport10 {
    #[serde(with = "serde_bytes")]
    pub tee_tcb_svn: [u8; 16],
    #[serde(with = "serde_bytes")]
    pub mr_seam: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub mr_signer_seam: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub seam_attributes: [u8; 8],
    #[serde(with = "serde_bytes")]
    pub td_attributes: [u8; 8],
    #[serde(with = "serde_bytes")]
    pub xfam: [u8; 8],
    #[serde(with = "serde_bytes")]
    pub mr_td: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub mr_config_id: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub mr_owner: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub mr_owner_config: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub rt_mr0: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub rt_mr1: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub rt_mr2: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub rt_mr3: [u8; 48],
    #[serde(with = "serde_bytes")]
    pub report_data: [u8; 64],
}

impl From<&TdReport> for TDReport10 {
    fn from(report: &TdReport) -> Self {
        let tcb = &report.tee_tcb_info;
        let td = &report.td_info;
        Self {
            tee_tcb_svn: tcb.tee_tcb_svn,
            mr_seam: tcb.mr_seam,
            mr_signer_seam: tcb.mr_signer_seam,
            seam_attributes: tcb.attributes,
            td_attributes: td.attributes,
            xfam: td.xfam,
            mr_td: td.mr_td,
            mr_config_id: td.mr_config_id,
            mr_owner: td.mr_owner,
            mr_owner_config: td.mr_owner_config,
            rt_mr0: td.rtmr[0],
            rt_mr1: td.rtmr[1],
            rt_mr2: td.rtmr[2],
            rt_mr3: td.rtmr[3],
            report_data: report.report_mac.report_data,
        }
    }
}

impl Display for TDReport10 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn space_or_newline(f: &mut Formatter<'_>) -> std::fmt::Result {
            if f.alternate() {
                writeln!(f)
            } else {
                write!(f, " ")
            }
        }
        write!(f, "mrtd: {}", hex::encode(self.mr_td))?;
        space_or_newline(f)?;
        write!(f, "rtmr0: {}", hex::encode(self.rt_mr0))?;
        space_or_newline(f)?;
        write!(f, "rtmr1: {}", hex::encode(self.rt_mr1))?;
        space_or_newline(f)?;
        write!(f, "rtmr2: {}", hex::encode(self.rt_mr2))?;
        space_or_newline(f)?;
        write!(f, "rtmr3: {}", hex::encode(self.rt_mr3))?;
        space_or_newline(f)?;
        write!(f, "reportdata: {}", hex::encode(self.report_data.as_slice()))
    }
}

/// Typed certification data section
#[allow(missing_docs)]
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CertificationData {
    pub cert_type: u16,
    pub body: Data<u32>,
}

impl CertificationData {
    /// Section of `cert_type` carrying `body`
    pub fn new(cert_type: CertDataType, body: Vec<u8>) -> Self {
        Self {
            cert_type: cert_type as u16,
            body: Data::new(body),
        }
    }
}

impl Decode for CertificationData {
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError> {
        Ok(Self {
            cert_type: Decode::decode(input)?,
            body: Decode::decode(input)?,
        })
    }
}

impl Encode for CertificationData {
    fn encoded_len(&self) -> usize {
        self.cert_type.encoded_len() + self.body.encoded_len()
    }

    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError> {
        self.cert_type.encode(output)?;
        self.body.encode(output)
    }
}

impl core::fmt::Debug for CertificationData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let body_str = String::from_utf8_lossy(&self.body.data);
        f.debug_struct("CertificationData")
            .field("cert_type", &self.cert_type)
            .field("body", &body_str)
            .finish()
    }
}

/// Payload of a [`CertDataType::PpidRsa3072Encrypted`] section
#[derive(Pod, Zeroable, Debug, Copy, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
#[repr(C, packed)]
pub struct PpidRsa3072Payload {
    #[serde(with = "serde_bytes")]
    pub encrypted_ppid: [u8; 384],
    #[serde(with = "serde_bytes")]
    pub cpu_svn: [u8; 16],
    pub pce_isv_svn: u16,
    pub pce_id: u16,
}

/// The QE report, its certifier signature and the inner certification data
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QEReportCertificationData {
    #[serde(with = "serde_bytes")]
    pub qe_report: [u8; ENCLAVE_REPORT_BYTE_LEN],
    #[serde(with = "serde_bytes")]
    pub qe_report_signature: [u8; QE_REPORT_SIG_BYTE_LEN],
    pub qe_auth_data: Data<u16>,
    pub certification_data: CertificationData,
}

impl Decode for QEReportCertificationData {
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError> {
        Ok(Self {
            qe_report: Decode::decode(input)?,
            qe_report_signature: Decode::decode(input)?,
            qe_auth_data: Decode::decode(input)?,
            certification_data: Decode::decode(input)?,
        })
    }
}

impl Encode for QEReportCertificationData {
    fn encoded_len(&self) -> usize {
        ENCLAVE_REPORT_BYTE_LEN
            + QE_REPORT_SIG_BYTE_LEN
            + self.qe_auth_data.encoded_len()
            + self.certification_data.encoded_len()
    }

    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError> {
        self.qe_report.encode(output)?;
        self.qe_report_signature.encode(output)?;
        self.qe_auth_data.encode(output)?;
        self.certification_data.encode(output)
    }
}

/// Signature data of a version 4 quote
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SignatureData {
    #[serde(with = "serde_bytes")]
    pub ecdsa_signature: [u8; ECDSA_SIGNATURE_BYTE_LEN],
    #[serde(with = "serde_bytes")]
    pub ecdsa_attestation_key: [u8; ECDSA_PUBKEY_BYTE_LEN],
    pub qe_report_data: QEReportCertificationData,
}

impl Decode for SignatureData {
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError> {
        let ecdsa_signature = Decode::decode(input)?;
        let ecdsa_attestation_key = Decode::decode(input)?;
        let certification_data: CertificationData = Decode::decode(input)?;
        if certification_data.cert_type != CertDataType::QeReportCertificationData as u16 {
            return Err(EnvelopeError::CertificationDataType(
                certification_data.cert_type,
            ));
        }
        let qe_report_data =
            QEReportCertificationData::decode(&mut &certification_data.body.data[..])?;
        Ok(SignatureData {
            ecdsa_signature,
            ecdsa_attestation_key,
            qe_report_data,
        })
    }
}

impl Encode for SignatureData {
    fn encoded_len(&self) -> usize {
        ECDSA_SIGNATURE_BYTE_LEN
            + ECDSA_PUBKEY_BYTE_LEN
            + CERT_DATA_HEADER_LEN
            + self.qe_report_data.encoded_len()
    }

    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError> {
        self.ecdsa_signature.encode(output)?;
        self.ecdsa_attestation_key.encode(output)?;
        (CertDataType::QeReportCertificationData as u16).encode(output)?;
        let len = u32::try_from(self.qe_report_data.encoded_len())
            .map_err(|_| EnvelopeError::SectionSize("QE report certification data".into()))?;
        len.encode(output)?;
        self.qe_report_data.encode(output)
    }
}

/// A version 4 TDX quote
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct Quote {
    pub header: Header,
    pub report: TDReport10,
    pub signature_data: SignatureData,
}

impl Decode for Quote {
    fn decode<I: Read>(input: &mut I) -> Result<Self, EnvelopeError> {
        let header = Header::decode(input)?;
        trace!(?header);
        if header.version != QUOTE_VERSION {
            return Err(EnvelopeError::QuoteVersion(header.version));
        }
        if header.tee_type != TEE_TYPE_TDX {
            return Err(EnvelopeError::InvalidTeeType(header.tee_type));
        }
        let report = TDReport10::decode(input)?;
        let data = Data::<u32>::decode(input)?;
        let signature_data = SignatureData::decode(&mut &data.data[..])?;
        Ok(Quote {
            header,
            report,
            signature_data,
        })
    }
}

impl Encode for Quote {
    fn encoded_len(&self) -> usize {
        SIGNED_REGION_LEN + 4 + self.signature_data.encoded_len()
    }

    fn encode<O: Write>(&self, output: &mut O) -> Result<(), EnvelopeError> {
        self.header.encode(output)?;
        self.report.encode(output)?;
        let len = u32::try_from(self.signature_data.encoded_len())
            .map_err(|_| EnvelopeError::SectionSize("signature data".into()))?;
        len.encode(output)?;
        self.signature_data.encode(output)
    }
}

impl Quote {
    /// Parse a quote from a byte slice.
    pub fn parse(quote: &[u8]) -> Result<Self, EnvelopeError> {
        let mut input = quote;
        Quote::decode(&mut input)
    }

    /// The bytes covered by the attestation key signature
    pub fn signed_region(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNED_REGION_LEN);
        out.extend_from_slice(bytes_of(&self.header));
        out.extend_from_slice(bytes_of(&self.report));
        out
    }

    /// The inner certification data
    pub fn certification_data(&self) -> &CertificationData {
        &self.signature_data.qe_report_data.certification_data
    }

    /// The PPID fallback payload, if the quote carries one
    pub fn ppid_payload(&self) -> Option<PpidRsa3072Payload> {
        let cert = self.certification_data();
        if cert.cert_type != CertDataType::PpidRsa3072Encrypted as u16 {
            return None;
        }
        bytemuck::try_pod_read_unaligned(&cert.body.data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testaso::testaso;

    testaso! {
        struct Header: 1, 48 => {
            version: 0,
            attestation_key_type: 2,
            tee_type: 4,
            qe_svn: 8,
            pce_svn: 10,
            qe_vendor_id: 12,
            user_data: 28
        }
        struct TDReport10: 1, 584 => {
            tee_tcb_svn: 0,
            mr_seam: 16,
            mr_signer_seam: 64,
            seam_attributes: 112,
            td_attributes: 120,
            xfam: 128,
            mr_td: 136,
            mr_config_id: 184,
            mr_owner: 232,
            mr_owner_config: 280,
            rt_mr0: 328,
            rt_mr1: 376,
            rt_mr2: 424,
            rt_mr3: 472,
            report_data: 520
        }
        struct PpidRsa3072Payload: 1, 404 => {
            encrypted_ppid: 0,
            cpu_svn: 384,
            pce_isv_svn: 400,
            pce_id: 402
        }
    }

    fn sample(payload: Vec<u8>, cert_type: CertDataType) -> Quote {
        Quote {
            header: Header {
                version: QUOTE_VERSION,
                attestation_key_type: ATT_KEY_TYPE_ECDSA_P256,
                tee_type: TEE_TYPE_TDX,
                qe_svn: 3,
                pce_svn: 11,
                qe_vendor_id: QE_VENDOR_ID_INTEL,
                user_data: [0xaa; 20],
            },
            report: TDReport10::zeroed(),
            signature_data: SignatureData {
                ecdsa_signature: [1; 64],
                ecdsa_attestation_key: [2; 64],
                qe_report_data: QEReportCertificationData {
                    qe_report: [3; ENCLAVE_REPORT_BYTE_LEN],
                    qe_report_signature: [4; 64],
                    qe_auth_data: Data::new((0..32).collect()),
                    certification_data: CertificationData::new(cert_type, payload),
                },
            },
        }
    }

    #[test]
    fn encoded_len_matches_size_formula() {
        let quote = sample(vec![0; PPID_RSA3072_PAYLOAD_LEN], CertDataType::PpidRsa3072Encrypted);
        let mut out = Vec::new();
        quote.encode(&mut out).unwrap();
        assert_eq!(out.len(), quote.encoded_len());
        assert_eq!(out.len(), quote_size(32, PPID_RSA3072_PAYLOAD_LEN));
        assert_eq!(&out[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 64], &[1; 64]);
    }

    #[test]
    fn parse_reads_nested_sections() {
        let chain = b"-----BEGIN CERTIFICATE-----\n".to_vec();
        let quote = sample(chain.clone(), CertDataType::PckCertChain);
        let mut out = Vec::new();
        quote.encode(&mut out).unwrap();

        let parsed = Quote::parse(&out).unwrap();
        assert_eq!({ parsed.header.pce_svn }, 11);
        assert_eq!(parsed.certification_data().cert_type, 5);
        assert_eq!(parsed.certification_data().body.data, chain);
        assert_eq!(parsed.signature_data, quote.signature_data);
        assert_eq!(parsed.signed_region(), out[..SIGNED_REGION_LEN]);
        assert!(parsed.ppid_payload().is_none());
    }

    #[test]
    fn parse_rejects_wrong_version_and_truncation() {
        let quote = sample(vec![0; 8], CertDataType::PckCertChain);
        let mut out = Vec::new();
        quote.encode(&mut out).unwrap();

        let mut wrong = out.clone();
        wrong[0] = 3;
        assert!(matches!(
            Quote::parse(&wrong),
            Err(EnvelopeError::QuoteVersion(3))
        ));

        assert!(Quote::parse(&out[..out.len() - 1]).is_err());
    }

    #[test]
    fn encode_into_short_slice_fails() {
        let quote = sample(vec![0; 8], CertDataType::PckCertChain);
        let mut buf = vec![0u8; quote.encoded_len() - 1];
        let mut out = &mut buf[..];
        assert!(quote.encode(&mut out).is_err());
    }
}
