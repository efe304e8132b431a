// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Hardware report structures
//!
//! Binary layouts of the SGX local report, target info and key request, and
//! of the TDX TD report. They are exchanged with the hardware as-is, so every
//! field offset is pinned by a layout test.

use bytemuck::{bytes_of, Pod, Zeroable};
use sha2::{Digest, Sha384};

/// Size of the caller supplied report data
pub const REPORT_DATA_SIZE: usize = 64;

/// Key name for the sealing key
pub const KEYNAME_SEAL: u16 = 4;
/// Key name for the report MAC key
pub const KEYNAME_REPORT: u16 = 3;

/// Derive the key from the enclave measurement
pub const KEYPOLICY_MRENCLAVE: u16 = 0x0001;
/// Derive the key from the enclave signer measurement
pub const KEYPOLICY_MRSIGNER: u16 = 0x0002;

/// Attribute mask applied to every seal key derivation
pub const SEAL_ATTRIBUTE_MASK: [u8; 16] = [
    0x0b, 0, 0, 0, 0, 0, 0, 0xff, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// TEE type of a TDX TD report
pub const TD_REPORT_TEE_TYPE: u8 = 0x81;
/// Report sub type of a TDX TD report
pub const TD_REPORT_SUBTYPE: u8 = 0;
/// Highest supported TD report version
pub const TD_REPORT_MAX_VERSION: u8 = 1;

/// SGX enclave report body
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct ReportBody {
    pub cpu_svn: [u8; 16],
    pub misc_select: u32,
    pub reserved1: [u8; 28],
    pub attributes: [u8; 16],
    pub mr_enclave: [u8; 32],
    pub reserved2: [u8; 32],
    pub mr_signer: [u8; 32],
    pub reserved3: [u8; 96],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub reserved4: [u8; 60],
    pub report_data: [u8; REPORT_DATA_SIZE],
}

/// SGX local report: a MACed [`ReportBody`]
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct Report {
    pub body: ReportBody,
    pub key_id: [u8; 32],
    pub mac: [u8; 16],
}

impl Report {
    /// The first 32 bytes of the report data
    pub fn report_data_hash(&self) -> &[u8] {
        &self.body.report_data[..32]
    }
}

/// Descriptor of the enclave a report is targeted at
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct TargetInfo {
    pub mr_enclave: [u8; 32],
    pub attributes: [u8; 16],
    pub reserved1: [u8; 2],
    pub config_svn: u16,
    pub misc_select: u32,
    pub reserved2: [u8; 8],
    pub config_id: [u8; 64],
    pub reserved3: [u8; 384],
}

impl From<&ReportBody> for TargetInfo {
    fn from(body: &ReportBody) -> Self {
        Self {
            mr_enclave: body.mr_enclave,
            attributes: body.attributes,
            misc_select: body.misc_select,
            ..Zeroable::zeroed()
        }
    }
}

/// Request for a hardware derived key
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct KeyRequest {
    pub key_name: u16,
    pub key_policy: u16,
    pub isv_svn: u16,
    pub reserved1: u16,
    pub cpu_svn: [u8; 16],
    pub attribute_mask: [u8; 16],
    pub key_id: [u8; 32],
    pub misc_mask: u32,
    pub config_svn: u16,
    pub reserved2: [u8; 434],
}

/// Type header of a [`TdReport`]
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct ReportType {
    pub tee_type: u8,
    pub subtype: u8,
    pub version: u8,
    pub reserved: u8,
}

/// MACed part of a [`TdReport`]
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct ReportMacStruct {
    pub report_type: ReportType,
    pub reserved1: [u8; 12],
    pub cpu_svn: [u8; 16],
    pub tee_tcb_info_hash: [u8; 48],
    pub tee_info_hash: [u8; 48],
    pub report_data: [u8; REPORT_DATA_SIZE],
    pub reserved2: [u8; 32],
    pub mac: [u8; 32],
}

impl ReportMacStruct {
    /// Bytes covered by the MAC
    pub fn mac_input(&self) -> &[u8] {
        let bytes = bytes_of(self);
        &bytes[..bytes.len() - 32]
    }
}

/// TCB info of the TDX module
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct TeeTcbInfo {
    pub valid: [u8; 8],
    pub tee_tcb_svn: [u8; 16],
    pub mr_seam: [u8; 48],
    pub mr_signer_seam: [u8; 48],
    pub attributes: [u8; 8],
    pub tee_tcb_svn2: [u8; 16],
    pub reserved: [u8; 95],
}

/// Measurements of the trust domain
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct TdInfo {
    pub attributes: [u8; 8],
    pub xfam: [u8; 8],
    pub mr_td: [u8; 48],
    pub mr_config_id: [u8; 48],
    pub mr_owner: [u8; 48],
    pub mr_owner_config: [u8; 48],
    pub rtmr: [[u8; 48]; 4],
    pub serv_td_hash: [u8; 48],
    pub reserved: [u8; 64],
}

/// Hardware report produced by a trust domain
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct TdReport {
    pub report_mac: ReportMacStruct,
    pub tee_tcb_info: TeeTcbInfo,
    pub reserved: [u8; 17],
    pub td_info: TdInfo,
}

impl TdReport {
    /// SHA-384 over the TEE TCB info, as embedded in the MAC struct
    pub fn tee_tcb_info_hash(&self) -> [u8; 48] {
        Sha384::digest(bytes_of(&self.tee_tcb_info)).into()
    }

    /// SHA-384 over the TD info, as embedded in the MAC struct
    pub fn td_info_hash(&self) -> [u8; 48] {
        Sha384::digest(bytes_of(&self.td_info)).into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use testaso::testaso;

    testaso! {
        struct ReportBody: 4, 384 => {
            cpu_svn: 0,
            misc_select: 16,
            reserved1: 20,
            attributes: 48,
            mr_enclave: 64,
            reserved2: 96,
            mr_signer: 128,
            reserved3: 160,
            isv_prod_id: 256,
            isv_svn: 258,
            reserved4: 260,
            report_data: 320
        }
        struct Report: 4, 432 => {
            body: 0,
            key_id: 384,
            mac: 416
        }
        struct TargetInfo: 4, 512 => {
            mr_enclave: 0,
            attributes: 32,
            reserved1: 48,
            config_svn: 50,
            misc_select: 52,
            reserved2: 56,
            config_id: 64,
            reserved3: 128
        }
        struct KeyRequest: 4, 512 => {
            key_name: 0,
            key_policy: 2,
            isv_svn: 4,
            reserved1: 6,
            cpu_svn: 8,
            attribute_mask: 24,
            key_id: 40,
            misc_mask: 72,
            config_svn: 76,
            reserved2: 78
        }
        struct ReportMacStruct: 1, 256 => {
            report_type: 0,
            reserved1: 4,
            cpu_svn: 16,
            tee_tcb_info_hash: 32,
            tee_info_hash: 80,
            report_data: 128,
            reserved2: 192,
            mac: 224
        }
        struct TeeTcbInfo: 1, 239 => {
            valid: 0,
            tee_tcb_svn: 8,
            mr_seam: 24,
            mr_signer_seam: 72,
            attributes: 120,
            tee_tcb_svn2: 128,
            reserved: 144
        }
        struct TdInfo: 1, 512 => {
            attributes: 0,
            xfam: 8,
            mr_td: 16,
            mr_config_id: 64,
            mr_owner: 112,
            mr_owner_config: 160,
            rtmr: 208,
            serv_td_hash: 400,
            reserved: 448
        }
        struct TdReport: 1, 1024 => {
            report_mac: 0,
            tee_tcb_info: 256,
            reserved: 495,
            td_info: 512
        }
    }

    #[test]
    fn target_info_from_body() {
        let mut body = ReportBody::zeroed();
        body.mr_enclave = [7; 32];
        body.attributes = [3; 16];
        body.misc_select = 5;
        body.isv_svn = 9;

        let target = TargetInfo::from(&body);
        assert_eq!(target.mr_enclave, [7; 32]);
        assert_eq!(target.attributes, [3; 16]);
        assert_eq!(target.misc_select, 5);
        assert_eq!(target.config_id, [0; 64]);
    }

    #[test]
    fn mac_input_excludes_mac() {
        let mac_struct = ReportMacStruct::zeroed();
        assert_eq!(mac_struct.mac_input().len(), 224);
    }
}
