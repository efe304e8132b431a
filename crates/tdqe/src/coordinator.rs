// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Certification coordinator
//!
//! Decides whether the attestation key can be used as is, needs a fresh
//! certifier signature, or has to be regenerated, and then carries the
//! decision out:
//!
//! ```text
//! Deciding -> Reusing
//!          -> Recertifying -> Sealing
//!          -> Regenerating -> Sealing
//! ```
//!
//! A new record only replaces the cached blob once its branch completed, so
//! a half-certified key is never visible.

use crate::{
    error::QuoteError,
    pce::PceIdentity,
    provider::PckCertId,
    qe::{
        blob::{RecordPlain, ATT_KEY_VERSION},
        CertKeyType, CertificationInput, EncryptedPpid,
    },
    quoting::{BlobState, QuotingContext},
    tcb::CertTcb,
};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// What to do with the attestation key
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CertificationDecision {
    /// The key and its certification are current
    ReuseAsIs,
    /// Keep the key, have it certified for `cert_tcb`
    RecertifyOnly {
        /// The TCB to certify for
        cert_tcb: CertTcb,
    },
    /// Derive and certify a new key
    RegenerateAndCertify,
}

/// Coordinator states, as logged
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CoordinatorState {
    Deciding,
    Reusing,
    Recertifying,
    Regenerating,
    Sealing,
}

/// Result of a certification run
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CertificationOutcome {
    /// The decision taken
    pub decision: CertificationDecision,
    /// Fingerprint of the key now in use
    pub key_fingerprint: [u8; 32],
}

/// True if `record` cannot be used by the running quoting enclave at all.
pub fn needs_regeneration(
    record: &RecordPlain,
    kind: CertKeyType,
    current_qe_isv_svn: u16,
) -> bool {
    let certified_qe_isv_svn = record.qe_report.body.isv_svn;
    record.key_kind != kind as u16
        || record.key_version != ATT_KEY_VERSION
        || current_qe_isv_svn > certified_qe_isv_svn
}

/// Decide what to do with the attestation key.
///
/// A changed CPU SVN always regenerates. Without a provider answer the key is
/// recertified for the raw TCB only once the raw PCE SVN passed the certified
/// one.
///
/// * `record` - the stored record, `None` if absent or unusable
/// * `raw_tcb` - the platform TCB right now
/// * `provider_tcb` - the TCB of the certificate the provider has, if any
pub fn decide(
    refresh: bool,
    record: Option<&RecordPlain>,
    kind: CertKeyType,
    current_qe_isv_svn: u16,
    raw_tcb: &CertTcb,
    provider_tcb: Option<&CertTcb>,
) -> CertificationDecision {
    let Some(record) = record.filter(|_| !refresh) else {
        return CertificationDecision::RegenerateAndCertify;
    };
    // the key seed is bound to the CPU SVN it was derived under
    if needs_regeneration(record, kind, current_qe_isv_svn)
        || record.raw_cpu_svn != raw_tcb.cpu_svn
    {
        return CertificationDecision::RegenerateAndCertify;
    }
    match provider_tcb {
        Some(provider_tcb) if *provider_tcb != record.cert_tcb() => {
            CertificationDecision::RecertifyOnly {
                cert_tcb: *provider_tcb,
            }
        }
        Some(_) => CertificationDecision::ReuseAsIs,
        None if raw_tcb.pce_isv_svn > record.cert_pce_isv_svn => {
            CertificationDecision::RecertifyOnly { cert_tcb: *raw_tcb }
        }
        None => CertificationDecision::ReuseAsIs,
    }
}

fn log_state(state: CoordinatorState) {
    info!(state = ?state, "attestation key certification");
}

pub(crate) fn pck_cert_id(
    qe_id: [u8; 16],
    raw_tcb: &CertTcb,
    encrypted_ppid: Option<EncryptedPpid>,
) -> PckCertId {
    PckCertId {
        qe_id,
        platform_cpu_svn: raw_tcb.cpu_svn,
        platform_pce_isv_svn: raw_tcb.pce_isv_svn,
        pce_id: raw_tcb.pce_id,
        encrypted_ppid,
    }
}

impl QuotingContext {
    /// The stored record if the running enclave accepts it.
    fn existing_record(&self, state: &mut BlobState) -> Result<Option<RecordPlain>, QuoteError> {
        let Some(blob) = self.restore(state) else {
            debug!("no attestation key blob");
            return Ok(None);
        };
        let want_ppid = state.encrypted_ppid.is_none();
        match self.call_enclave("verify attestation key blob", |qe| {
            qe.verify_blob(&blob, want_ppid)
        }) {
            Ok(info) => Ok(Some(self.absorb(state, info))),
            Err(QuoteError::BlobIntegrityFailure(context)) => {
                warn!("Stored attestation key is unusable, regenerating: {context}");
                state.blob = None;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the certification state machine on the cached blob.
    pub(crate) fn certify_key(
        &self,
        state: &mut BlobState,
        refresh: bool,
    ) -> Result<CertificationOutcome, QuoteError> {
        log_state(CoordinatorState::Deciding);
        let pce = self.certifier.identity()?;
        let current = self.call_enclave("quoting enclave identity", |qe| qe.identity())?;
        let raw_tcb = CertTcb {
            cpu_svn: current.cpu_svn,
            pce_isv_svn: pce.isv_svn,
            pce_id: pce.pce_id,
        };

        let existing = if refresh {
            None
        } else {
            self.existing_record(state)?
        };
        let provider_tcb = match (&existing, state.qe_id) {
            (Some(_), Some(qe_id)) => self
                .provider
                .query(&pck_cert_id(qe_id, &raw_tcb, state.encrypted_ppid))?
                .map(|config| config.cert_tcb(raw_tcb.pce_id)),
            _ => None,
        };

        let decision = decide(
            refresh,
            existing.as_ref(),
            self.config.cert_key_type,
            current.isv_svn,
            &raw_tcb,
            provider_tcb.as_ref(),
        );
        info!(decision = ?decision, %raw_tcb, "certification decision");

        let record = match (decision, existing) {
            (CertificationDecision::ReuseAsIs, Some(record)) => {
                log_state(CoordinatorState::Reusing);
                return Ok(CertificationOutcome {
                    decision,
                    key_fingerprint: record.key_fingerprint,
                });
            }
            (CertificationDecision::RecertifyOnly { cert_tcb }, Some(_)) => {
                log_state(CoordinatorState::Recertifying);
                self.recertify(state, &pce, &raw_tcb, &cert_tcb)?
            }
            _ => {
                log_state(CoordinatorState::Regenerating);
                self.regenerate(state, &pce, &raw_tcb)?
            }
        };

        Ok(CertificationOutcome {
            decision,
            key_fingerprint: record.key_fingerprint,
        })
    }

    fn regenerate(
        &self,
        state: &mut BlobState,
        pce: &PceIdentity,
        raw_tcb: &CertTcb,
    ) -> Result<RecordPlain, QuoteError> {
        let kind = self.config.cert_key_type;
        let auth_data = self.config.auth_data;
        let staging = self.call_enclave("generate attestation key", |qe| {
            qe.gen_att_key(kind, &auth_data, &pce.target_info)
        })?;

        let info = self.certifier.platform_info(&staging.qe_report)?;
        let ppid = EncryptedPpid {
            crypto_suite: info.crypto_suite,
            data: info.encrypted_ppid,
        };
        let cert_tcb = self
            .provider
            .query(&pck_cert_id(staging.qe_id, raw_tcb, Some(ppid)))?
            .map_or(*raw_tcb, |config| config.cert_tcb(raw_tcb.pce_id));
        let signature = self.certifier.certify(&staging.qe_report, &cert_tcb)?;

        let input = CertificationInput {
            cert_tcb,
            raw_tcb: *raw_tcb,
            pce_target_info: pce.target_info,
            qe_report: staging.qe_report,
            signature,
            ppid: Some(ppid),
        };
        let sealed = self.call_enclave("store certification", |qe| {
            qe.store_cert_data(&staging.blob, &input)
        })?;

        log_state(CoordinatorState::Sealing);
        state.qe_id = Some(staging.qe_id);
        state.encrypted_ppid = Some(ppid);
        self.replace_blob(state, sealed.blob);
        self.regenerations.fetch_add(1, Ordering::SeqCst);
        Ok(sealed.record)
    }

    fn recertify(
        &self,
        state: &mut BlobState,
        pce: &PceIdentity,
        raw_tcb: &CertTcb,
        cert_tcb: &CertTcb,
    ) -> Result<RecordPlain, QuoteError> {
        let blob = state
            .blob
            .clone()
            .ok_or_else(|| QuoteError::UnexpectedInternal("recertify without a blob".into()))?;
        let qe_report = self.call_enclave("attestation key self report", |qe| {
            qe.self_report(&blob, &pce.target_info)
        })?;
        let signature = self.certifier.certify(&qe_report, cert_tcb)?;

        let input = CertificationInput {
            cert_tcb: *cert_tcb,
            raw_tcb: *raw_tcb,
            pce_target_info: pce.target_info,
            qe_report,
            signature,
            ppid: None,
        };
        let sealed = self.call_enclave("store certification", |qe| {
            qe.store_cert_data(&blob, &input)
        })?;

        log_state(CoordinatorState::Sealing);
        self.replace_blob(state, sealed.blob);
        Ok(sealed.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    fn record() -> RecordPlain {
        let mut record = RecordPlain::zeroed();
        record.key_kind = CertKeyType::PpidRsa3072Encrypted as u16;
        record.key_version = ATT_KEY_VERSION;
        record.qe_report.body.isv_svn = 4;
        record.qe_report_cert_sig = [1; 64];
        record.set_cert_tcb(&tcb(12));
        record.set_raw_tcb(&tcb(13));
        record
    }

    fn tcb(pce_isv_svn: u16) -> CertTcb {
        CertTcb {
            cpu_svn: [1; 16],
            pce_isv_svn,
            pce_id: 0,
        }
    }

    const KIND: CertKeyType = CertKeyType::PpidRsa3072Encrypted;

    #[test]
    fn regenerates_without_usable_record() {
        let r = record();
        assert_eq!(
            decide(false, None, KIND, 4, &tcb(13), None),
            CertificationDecision::RegenerateAndCertify
        );
        assert_eq!(
            decide(true, Some(&r), KIND, 4, &tcb(13), Some(&tcb(12))),
            CertificationDecision::RegenerateAndCertify
        );
        assert_eq!(
            decide(false, Some(&r), CertKeyType::PpidRsa2048Encrypted, 4, &tcb(13), None),
            CertificationDecision::RegenerateAndCertify
        );
        // quoting enclave was upgraded
        assert_eq!(
            decide(false, Some(&r), KIND, 5, &tcb(13), None),
            CertificationDecision::RegenerateAndCertify
        );
    }

    #[test]
    fn follows_provider_tcb() {
        let r = record();
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &tcb(13), Some(&tcb(12))),
            CertificationDecision::ReuseAsIs
        );
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &tcb(13), Some(&tcb(13))),
            CertificationDecision::RecertifyOnly { cert_tcb: tcb(13) }
        );
    }

    #[test]
    fn without_provider_follows_raw_pce_svn() {
        let r = record();
        // certified for 12 while the platform already runs 13
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &tcb(13), None),
            CertificationDecision::RecertifyOnly { cert_tcb: tcb(13) }
        );
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &tcb(14), None),
            CertificationDecision::RecertifyOnly { cert_tcb: tcb(14) }
        );
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &tcb(12), None),
            CertificationDecision::ReuseAsIs
        );
    }

    #[test]
    fn cpu_svn_change_regenerates() {
        let r = record();
        let mut raw = tcb(13);
        raw.cpu_svn[0] = 2;
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &raw, None),
            CertificationDecision::RegenerateAndCertify
        );
        let mut provider = tcb(12);
        provider.cpu_svn[0] = 2;
        assert_eq!(
            decide(false, Some(&r), KIND, 4, &raw, Some(&provider)),
            CertificationDecision::RegenerateAndCertify
        );
    }
}
