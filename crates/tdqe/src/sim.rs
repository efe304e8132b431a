// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Software simulated platform
//!
//! [`SimPlatform`] stands in for the TDX module, the quoting enclave, the
//! platform certifier and a requesting enclave. All secrets derive from one
//! platform root, so two handles to the same platform agree on every key.
//! Security versions can be raised and faults injected to exercise the
//! lifecycle paths.

use crate::{
    error::{QuoteContext as _, QuoteError},
    hardware::{BoundaryLoader, Hardware, HwError, LoadError},
    pce::{Certifier, CertifierLoader, PceIdentity, PceStatus, PlatformInfo},
    qe::{CertKeyType, CertificationInput, EncryptedPpid, QuotingEnclave, ENCRYPTED_PPID_SIZE},
    report::{
        KeyRequest, Report, ReportBody, ReportType, TargetInfo, TdReport, KEYNAME_REPORT,
        KEYNAME_SEAL, KEYPOLICY_MRENCLAVE, KEYPOLICY_MRSIGNER, REPORT_DATA_SIZE,
        TD_REPORT_SUBTYPE, TD_REPORT_TEE_TYPE,
    },
    tcb::{CertTcb, CpuSvn, SealTcb},
};
use aes::Aes128;
use bytemuck::{bytes_of, Zeroable};
use cmac::{Cmac, Mac};
use p256::ecdsa::{signature::Signer as _, Signature, SigningKey, VerifyingKey};
use ring::hmac;
use sha2::{Digest, Sha256};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tracing::{debug, trace};

/// Product id of the quoting enclave
pub const QE_PROD_ID: u16 = 2;
/// Product id of the platform certifier
pub const PCE_PROD_ID: u16 = 1;
/// Certifier id reported by the simulated certifier
pub const SIM_PCE_ID: u16 = 0;

const REQUESTER_PROD_ID: u16 = 0x10;
const PPID_CRYPTO_SUITE: u8 = 1;
// INIT | MODE64 | PROVISION_KEY
const PROVISIONING_ATTRIBUTES: u8 = 0x15;
// INIT | MODE64
const TENANT_ATTRIBUTES: u8 = 0x05;

/// Call counters of a simulated platform
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Quoting enclave instances created
    pub qe_loads: u64,
    /// Certifier instances created
    pub pce_loads: u64,
    /// Certifier identity calls
    pub pce_identity_calls: u64,
    /// Certifier platform info calls
    pub platform_info_calls: u64,
    /// Successful certifier signatures
    pub certifications: u64,
}

struct State {
    root: [u8; 32],
    cpu_svn: CpuSvn,
    qe_isv_svn: u16,
    pce_isv_svn: u16,
    pending_loss: u32,
    failing_load: Option<LoadError>,
    certifier_latency: Duration,
    stats: SimStats,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    Qe,
    Pce,
    Requester,
}

impl Role {
    fn name(self) -> &'static [u8] {
        match self {
            Role::Qe => b"quoting enclave",
            Role::Pce => b"platform certifier",
            Role::Requester => b"requester",
        }
    }

    fn mr_enclave(self) -> [u8; 32] {
        Sha256::new()
            .chain_update(b"tdqe-sim mrenclave ")
            .chain_update(self.name())
            .finalize()
            .into()
    }

    fn mr_signer(self) -> [u8; 32] {
        let signer: &[u8] = match self {
            Role::Qe | Role::Pce => b"platform vendor",
            Role::Requester => b"tenant",
        };
        Sha256::new()
            .chain_update(b"tdqe-sim mrsigner ")
            .chain_update(signer)
            .finalize()
            .into()
    }

    fn isv_prod_id(self) -> u16 {
        match self {
            Role::Qe => QE_PROD_ID,
            Role::Pce => PCE_PROD_ID,
            Role::Requester => REQUESTER_PROD_ID,
        }
    }
}

fn cmac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], HwError> {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|_| HwError::Unexpected)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// A simulated platform; clones share state
#[derive(Clone)]
pub struct SimPlatform {
    state: Arc<Mutex<State>>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl SimPlatform {
    /// A platform whose root secret derives from `seed`
    pub fn with_seed(seed: u64) -> Self {
        let root = Sha256::new()
            .chain_update(b"tdqe simulated platform root")
            .chain_update(seed.to_le_bytes())
            .finalize()
            .into();
        Self {
            state: Arc::new(Mutex::new(State {
                root,
                cpu_svn: [1; 16],
                qe_isv_svn: 4,
                pce_isv_svn: 13,
                pending_loss: 0,
                failing_load: None,
                certifier_latency: Duration::ZERO,
                stats: SimStats::default(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hardware(&self, role: Role) -> SimHardware {
        SimHardware {
            platform: self.clone(),
            role,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A fresh quoting enclave instance
    pub fn qe_hardware(&self) -> SimHardware {
        self.hardware(Role::Qe)
    }

    /// A fresh certifier enclave instance
    pub fn pce_hardware(&self) -> SimHardware {
        self.hardware(Role::Pce)
    }

    /// Loader creating quoting enclave instances
    pub fn qe_loader(&self) -> SimQeLoader {
        SimQeLoader {
            platform: self.clone(),
        }
    }

    /// Loader creating certifier instances
    pub fn pce_loader(&self) -> SimPceLoader {
        SimPceLoader {
            platform: self.clone(),
        }
    }

    /// Current CPU SVN
    pub fn cpu_svn(&self) -> CpuSvn {
        self.state().cpu_svn
    }

    /// Apply a microcode update
    pub fn set_cpu_svn(&self, cpu_svn: CpuSvn) {
        debug!(cpu_svn = %hex::encode(cpu_svn), "simulated CPU SVN change");
        self.state().cpu_svn = cpu_svn;
    }

    /// Install a certifier with ISV SVN `svn`
    ///
    /// Callers that cache the certifier identity see the new SVN after
    /// reloading the certifier.
    pub fn set_pce_isv_svn(&self, svn: u16) {
        self.state().pce_isv_svn = svn;
    }

    /// Install a quoting enclave with ISV SVN `svn`
    pub fn set_qe_isv_svn(&self, svn: u16) {
        self.state().qe_isv_svn = svn;
    }

    /// Sealing TCB of the quoting enclave
    pub fn qe_seal_tcb(&self) -> SealTcb {
        let state = self.state();
        SealTcb {
            cpu_svn: state.cpu_svn,
            isv_svn: state.qe_isv_svn,
        }
    }

    /// Raw TCB of the platform
    pub fn raw_tcb(&self) -> CertTcb {
        let state = self.state();
        CertTcb {
            cpu_svn: state.cpu_svn,
            pce_isv_svn: state.pce_isv_svn,
            pce_id: SIM_PCE_ID,
        }
    }

    /// Lose the boundary in each of the next `calls` boundary calls
    pub fn inject_boundary_loss(&self, calls: u32) {
        self.state().pending_loss = calls;
    }

    /// Fail the next boundary creation with `error`
    pub fn fail_next_load(&self, error: LoadError) {
        self.state().failing_load = Some(error);
    }

    /// Delay every certification by `latency`
    pub fn set_certifier_latency(&self, latency: Duration) {
        self.state().certifier_latency = latency;
    }

    /// Call counters
    pub fn stats(&self) -> SimStats {
        self.state().stats
    }

    fn take_failing_load(&self) -> Result<(), LoadError> {
        match self.state().failing_load.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn consume_loss(&self) -> bool {
        let mut state = self.state();
        if state.pending_loss > 0 {
            state.pending_loss -= 1;
            true
        } else {
            false
        }
    }

    fn td_key(&self) -> hmac::Key {
        let digest = Sha256::new()
            .chain_update(self.state().root)
            .chain_update(b"td report")
            .finalize();
        hmac::Key::new(hmac::HMAC_SHA256, &digest)
    }

    /// Target info of the requesting enclave
    pub fn requester_target_info(&self) -> TargetInfo {
        let body = self.hardware(Role::Requester).body([0; REPORT_DATA_SIZE]);
        TargetInfo::from(&body)
    }

    /// Target info of the certifier, as reported by its identity
    pub fn pce_target_info(&self) -> TargetInfo {
        TargetInfo::from(&self.pce_hardware().body([0; REPORT_DATA_SIZE]))
    }

    /// Verify a report targeted at the requesting enclave
    pub fn verify_report_for_requester(&self, report: &Report) -> Result<(), HwError> {
        self.hardware(Role::Requester).verify_report(report)
    }

    /// A quoting enclave report targeted at `target`
    pub fn qe_report_for(&self, target: &TargetInfo) -> Result<Report, HwError> {
        self.qe_hardware()
            .create_report(target, &[0; REPORT_DATA_SIZE])
    }

    /// A TD report as the TDX module would produce it
    pub fn td_report(&self, report_data: [u8; REPORT_DATA_SIZE]) -> TdReport {
        let mut report = TdReport::zeroed();
        report.report_mac.report_type = ReportType {
            tee_type: TD_REPORT_TEE_TYPE,
            subtype: TD_REPORT_SUBTYPE,
            version: 1,
            reserved: 0,
        };
        report.report_mac.cpu_svn = self.cpu_svn();
        report.report_mac.report_data = report_data;

        report.tee_tcb_info.valid = [0xff, 0x03, 0, 0, 0, 0, 0, 0];
        report.tee_tcb_info.tee_tcb_svn[..2].copy_from_slice(&[0x05, 0x01]);
        report.tee_tcb_info.mr_seam = [0x5e; 48];
        report.td_info.attributes = [0, 0, 0, 0x10, 0, 0, 0, 0];
        report.td_info.xfam = [0xe7, 0x02, 0x06, 0, 0, 0, 0, 0];
        report.td_info.mr_td = [0x7d; 48];
        for (i, rtmr) in report.td_info.rtmr.iter_mut().enumerate() {
            *rtmr = [i as u8 + 1; 48];
        }

        report.report_mac.tee_tcb_info_hash = report.tee_tcb_info_hash();
        report.report_mac.tee_info_hash = report.td_info_hash();
        let tag = hmac::sign(&self.td_key(), report.report_mac.mac_input());
        report.report_mac.mac.copy_from_slice(tag.as_ref());
        report
    }

    fn pck_signing_key(&self, tcb: &CertTcb) -> Option<SigningKey> {
        let root = self.state().root;
        (0..=u8::MAX).find_map(|counter| {
            let digest = Sha256::new()
                .chain_update(root)
                .chain_update(b"pck")
                .chain_update(tcb.cpu_svn)
                .chain_update(tcb.pce_isv_svn.to_le_bytes())
                .chain_update(tcb.pce_id.to_le_bytes())
                .chain_update([counter])
                .finalize();
            SigningKey::from_slice(&digest).ok()
        })
    }

    /// The PCK public key the certifier signs with for `tcb`
    pub fn pck_verifying_key(&self, tcb: &CertTcb) -> Option<VerifyingKey> {
        self.pck_signing_key(tcb).map(|key| VerifyingKey::from(&key))
    }

    /// The encrypted platform identifier the certifier releases
    pub fn encrypted_ppid(&self) -> [u8; ENCRYPTED_PPID_SIZE] {
        let root = self.state().root;
        let mut out = [0u8; ENCRYPTED_PPID_SIZE];
        for (i, chunk) in out.chunks_exact_mut(32).enumerate() {
            let digest = Sha256::new()
                .chain_update(root)
                .chain_update(b"ppid")
                .chain_update([i as u8])
                .finalize();
            chunk.copy_from_slice(&digest);
        }
        out
    }

    /// Generate and certify an attestation key in `qe` for the raw TCB.
    pub fn certified_blob(&self, qe: &QuotingEnclave) -> Result<Vec<u8>, QuoteError> {
        let certifier = SimPce {
            hw: self.pce_hardware(),
        };
        let pce = certifier.identity().context("certifier identity")?;
        let staging = qe
            .gen_att_key(CertKeyType::PpidRsa3072Encrypted, &[0; 32], &pce.target_info)
            .context("generate attestation key")?;
        let info = certifier
            .platform_info(&staging.qe_report)
            .context("platform info")?;
        let tcb = self.raw_tcb();
        let signature = certifier
            .certify(&staging.qe_report, &tcb)
            .context("certify")?;
        let sealed = qe
            .store_cert_data(
                &staging.blob,
                &CertificationInput {
                    cert_tcb: tcb,
                    raw_tcb: tcb,
                    pce_target_info: pce.target_info,
                    qe_report: staging.qe_report,
                    signature,
                    ppid: Some(EncryptedPpid {
                        crypto_suite: info.crypto_suite,
                        data: info.encrypted_ppid,
                    }),
                },
            )
            .context("store certification")?;
        Ok(sealed.blob)
    }
}

/// An enclave instance on a [`SimPlatform`]
pub struct SimHardware {
    platform: SimPlatform,
    role: Role,
    lost: Arc<AtomicBool>,
}

impl SimHardware {
    fn check_alive(&self) -> Result<(), HwError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(HwError::BoundaryLost);
        }
        if self.platform.consume_loss() {
            debug!(role = ?self.role, "simulated boundary loss");
            self.lost.store(true, Ordering::SeqCst);
            return Err(HwError::BoundaryLost);
        }
        Ok(())
    }

    fn isv_svn(&self, state: &State) -> u16 {
        match self.role {
            Role::Qe => state.qe_isv_svn,
            Role::Pce => state.pce_isv_svn,
            Role::Requester => 1,
        }
    }

    fn body(&self, report_data: [u8; REPORT_DATA_SIZE]) -> ReportBody {
        let state = self.platform.state();
        let mut body = ReportBody::zeroed();
        body.cpu_svn = state.cpu_svn;
        body.attributes[0] = match self.role {
            Role::Qe | Role::Pce => PROVISIONING_ATTRIBUTES,
            Role::Requester => TENANT_ATTRIBUTES,
        };
        body.attributes[8] = 0x03;
        body.mr_enclave = self.role.mr_enclave();
        body.mr_signer = self.role.mr_signer();
        body.isv_prod_id = self.role.isv_prod_id();
        body.isv_svn = self.isv_svn(&state);
        body.report_data = report_data;
        body
    }

    fn report_key(&self, mr_enclave: &[u8; 32]) -> Result<[u8; 16], HwError> {
        let state = self.platform.state();
        cmac(&state.root[..16], &[b"report", mr_enclave, &state.cpu_svn])
    }

    fn report_mac(
        &self,
        key: &[u8; 16],
        body: &ReportBody,
        key_id: &[u8; 32],
    ) -> Result<[u8; 16], HwError> {
        cmac(key, &[bytes_of(body), key_id])
    }
}

impl Hardware for SimHardware {
    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &[u8; REPORT_DATA_SIZE],
    ) -> Result<Report, HwError> {
        self.check_alive()?;
        let body = self.body(*report_data);
        let key_id = [0u8; 32];
        let mac = self.report_mac(&self.report_key(&target.mr_enclave)?, &body, &key_id)?;
        Ok(Report { body, key_id, mac })
    }

    fn verify_report(&self, report: &Report) -> Result<(), HwError> {
        self.check_alive()?;
        let key = self.report_key(&self.role.mr_enclave())?;
        if self.report_mac(&key, &report.body, &report.key_id)? != report.mac {
            return Err(HwError::MacMismatch);
        }
        Ok(())
    }

    fn verify_td_report(&self, report: &TdReport) -> Result<(), HwError> {
        self.check_alive()?;
        hmac::verify(
            &self.platform.td_key(),
            report.report_mac.mac_input(),
            &report.report_mac.mac,
        )
        .map_err(|_| HwError::MacMismatch)
    }

    fn get_key(&self, request: &KeyRequest) -> Result<[u8; 16], HwError> {
        self.check_alive()?;
        let state = self.platform.state();
        match request.key_name {
            KEYNAME_REPORT => {
                drop(state);
                self.report_key(&self.role.mr_enclave())
            }
            KEYNAME_SEAL => {
                let own_svn = self.isv_svn(&state);
                let cpu_svn_above = request
                    .cpu_svn
                    .iter()
                    .zip(state.cpu_svn.iter())
                    .any(|(requested, current)| requested > current);
                if cpu_svn_above || request.isv_svn > own_svn {
                    trace!("seal key requested above the current TCB");
                    return Err(HwError::InvalidSvn);
                }
                let mut identity = Vec::with_capacity(64);
                if request.key_policy & KEYPOLICY_MRENCLAVE != 0 {
                    identity.extend_from_slice(&self.role.mr_enclave());
                }
                if request.key_policy & KEYPOLICY_MRSIGNER != 0 {
                    identity.extend_from_slice(&self.role.mr_signer());
                }
                cmac(
                    &state.root[..16],
                    &[
                        b"seal",
                        &request.key_policy.to_le_bytes(),
                        &request.isv_svn.to_le_bytes(),
                        &request.cpu_svn,
                        &request.key_id,
                        &request.attribute_mask,
                        &identity,
                        &self.role.isv_prod_id().to_le_bytes(),
                    ],
                )
            }
            _ => Err(HwError::InvalidParameter),
        }
    }
}

fn pce_status(e: HwError) -> PceStatus {
    match e {
        HwError::BoundaryLost => PceStatus::BoundaryLost,
        HwError::OutOfMemory => PceStatus::OutOfMemory,
        HwError::MacMismatch => PceStatus::InvalidReport,
        HwError::InvalidParameter => PceStatus::InvalidParameter,
        HwError::InvalidSvn | HwError::Unexpected => PceStatus::Unexpected,
    }
}

/// A certifier instance on a [`SimPlatform`]
pub struct SimPce {
    hw: SimHardware,
}

impl Certifier for SimPce {
    fn identity(&self) -> Result<PceIdentity, PceStatus> {
        self.hw.check_alive().map_err(pce_status)?;
        let body = self.hw.body([0; REPORT_DATA_SIZE]);
        self.hw.platform.state().stats.pce_identity_calls += 1;
        Ok(PceIdentity {
            target_info: TargetInfo::from(&body),
            isv_svn: body.isv_svn,
            pce_id: SIM_PCE_ID,
        })
    }

    fn platform_info(&self, qe_report: &Report) -> Result<PlatformInfo, PceStatus> {
        self.hw.verify_report(qe_report).map_err(pce_status)?;
        if qe_report.body.attributes[0] & PROVISIONING_ATTRIBUTES != PROVISIONING_ATTRIBUTES {
            return Err(PceStatus::InvalidReport);
        }
        let platform = &self.hw.platform;
        let pce_isv_svn = {
            let mut state = platform.state();
            state.stats.platform_info_calls += 1;
            state.pce_isv_svn
        };
        Ok(PlatformInfo {
            encrypted_ppid: platform.encrypted_ppid(),
            crypto_suite: PPID_CRYPTO_SUITE,
            pce_isv_svn,
            pce_id: SIM_PCE_ID,
        })
    }

    fn certify(&self, qe_report: &Report, cert_tcb: &CertTcb) -> Result<[u8; 64], PceStatus> {
        self.hw.verify_report(qe_report).map_err(pce_status)?;
        let platform = &self.hw.platform;
        let latency = platform.state().certifier_latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if cert_tcb.pce_id != SIM_PCE_ID {
            return Err(PceStatus::InvalidParameter);
        }
        let raw = platform.raw_tcb();
        if cert_tcb.pce_isv_svn > raw.pce_isv_svn
            || cert_tcb
                .cpu_svn
                .iter()
                .zip(raw.cpu_svn.iter())
                .any(|(requested, current)| requested > current)
        {
            return Err(PceStatus::InvalidTcb);
        }
        let key = platform
            .pck_signing_key(cert_tcb)
            .ok_or(PceStatus::CryptoError)?;
        let signature: Signature = key
            .try_sign(bytes_of(&qe_report.body))
            .map_err(|_| PceStatus::CryptoError)?;
        platform.state().stats.certifications += 1;

        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

/// Creates quoting enclave instances on a [`SimPlatform`]
pub struct SimQeLoader {
    platform: SimPlatform,
}

impl BoundaryLoader for SimQeLoader {
    fn create(&self, path: &Path) -> Result<Arc<dyn Hardware>, LoadError> {
        self.platform.take_failing_load()?;
        self.platform.state().stats.qe_loads += 1;
        trace!(path = %path.display(), "created simulated quoting enclave");
        Ok(Arc::new(self.platform.qe_hardware()))
    }
}

/// Creates certifier instances on a [`SimPlatform`]
pub struct SimPceLoader {
    platform: SimPlatform,
}

impl CertifierLoader for SimPceLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Certifier>, LoadError> {
        self.platform.take_failing_load()?;
        self.platform.state().stats.pce_loads += 1;
        trace!(path = %path.display(), "created simulated certifier");
        Ok(Arc::new(SimPce {
            hw: self.platform.pce_hardware(),
        }))
    }
}
