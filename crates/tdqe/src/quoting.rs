// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Quoting orchestrator
//!
//! [`QuotingContext`] is the host side of the quoting service. It owns the
//! boundary handles, the cached attestation key blob and the platform caches,
//! and exposes the three public operations:
//!
//! * [`QuotingContext::init_quote`] makes sure a certified key exists
//! * [`QuotingContext::get_quote_size`] sizes the buffer for the next quote
//! * [`QuotingContext::get_quote`] produces a quote for a TD report
//!
//! Two locks guard the mutable state: one for the quoting enclave handle and
//! one for the blob with its caches. The blob lock is held for a whole
//! operation, so unseal, decide, reseal and persist are serialized. With the
//! ephemeral load policy the boundaries are released by the last operation in
//! flight.

use crate::{
    config::{LoadPolicy, QuotingConfig},
    coordinator::{self, CertificationDecision},
    error::{QuoteContext as _, QuoteError},
    hardware::BoundaryLoader,
    pce::{CertifierLoader, PceWrapper},
    provider::{CertDataProvider, ProviderBridge, QeCertConfig},
    qe::{
        assemble::quote_size_for, blob::RecordPlain, BlobInfo, EncryptedPpid, QeReportRequest,
        QeStatus, QuotingEnclave,
    },
    report::{Report, TargetInfo, TdReport},
    retry,
    storage::{FileStorage, PersistentStorage},
    tcb::CertTcb,
};
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tracing::{debug, info, warn};

/// Cached blob and platform data, guarded by the blob lock
#[derive(Default)]
pub(crate) struct BlobState {
    pub(crate) blob: Option<Vec<u8>>,
    pub(crate) qe_id: Option<[u8; 16]>,
    pub(crate) encrypted_ppid: Option<EncryptedPpid>,
    restored: bool,
}

/// Result of [`QuotingContext::init_quote`]
#[derive(Debug, Copy, Clone)]
pub struct InitQuoteOutput {
    /// Target for the companion report requester
    pub target_info: TargetInfo,
    /// `SHA-256(public_key || auth_data)` of the key in use
    pub key_fingerprint: [u8; 32],
    /// What the coordinator did
    pub decision: CertificationDecision,
}

/// Result of [`QuotingContext::get_quote`]
#[derive(Debug, Copy, Clone)]
pub struct QuoteOutput {
    /// Bytes of the quote buffer in use
    pub len: usize,
    /// Companion report, if requested
    pub qe_report: Option<Report>,
}

/// A certified key ready for quoting
struct UsableKey {
    blob: Vec<u8>,
    record: RecordPlain,
    cert: Option<QeCertConfig>,
}

/// The quoting service state
pub struct QuotingContext {
    pub(crate) config: QuotingConfig,
    loader: Arc<dyn BoundaryLoader>,
    pub(crate) certifier: PceWrapper,
    pub(crate) provider: ProviderBridge,
    storage: Option<Arc<dyn PersistentStorage>>,
    enclave: Mutex<Option<QuotingEnclave>>,
    state: Mutex<BlobState>,
    active_calls: Mutex<usize>,
    pub(crate) regenerations: AtomicU64,
}

impl QuotingContext {
    /// A context loading boundaries through `loader` and `certifier_loader`.
    ///
    /// Nothing is loaded until the first operation. With a configured
    /// `storage_dir` the blob is persisted to files there.
    pub fn new(
        config: QuotingConfig,
        loader: Arc<dyn BoundaryLoader>,
        certifier_loader: Arc<dyn CertifierLoader>,
    ) -> Self {
        let storage = config
            .storage_dir
            .as_ref()
            .map(|dir| Arc::new(FileStorage::new(dir)) as Arc<dyn PersistentStorage>);
        let certifier = PceWrapper::new(certifier_loader, config.pce_path.clone());
        Self {
            config,
            loader,
            certifier,
            provider: ProviderBridge::default(),
            storage,
            enclave: Mutex::new(None),
            state: Mutex::new(BlobState::default()),
            active_calls: Mutex::new(0),
            regenerations: AtomicU64::new(0),
        }
    }

    /// Use `provider` for certification data
    pub fn with_provider(mut self, provider: Arc<dyn CertDataProvider>) -> Self {
        self.provider = ProviderBridge::new(Some(provider));
        self
    }

    /// Persist the blob to `storage`
    pub fn with_storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// The configuration in use
    pub fn config(&self) -> &QuotingConfig {
        &self.config
    }

    /// Number of attestation keys generated by this context
    pub fn regenerations(&self) -> u64 {
        self.regenerations.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BlobState>, QuoteError> {
        self.state
            .lock()
            .map_err(|_| QuoteError::UnexpectedInternal("blob lock poisoned".into()))
    }

    fn lock_enclave(&self) -> Result<MutexGuard<'_, Option<QuotingEnclave>>, QuoteError> {
        self.enclave
            .lock()
            .map_err(|_| QuoteError::UnexpectedInternal("enclave lock poisoned".into()))
    }

    fn load_enclave(&self) -> Result<QuotingEnclave, QuoteError> {
        let mut slot = self.lock_enclave()?;
        if let Some(enclave) = slot.as_ref() {
            return Ok(enclave.clone());
        }
        let path = &self.config.qe_path;
        let hw = self
            .loader
            .create(path)
            .context(format!("loading quoting enclave {}", path.display()))?;
        debug!(path = %path.display(), "loaded quoting enclave");
        let enclave = QuotingEnclave::new(hw);
        *slot = Some(enclave.clone());
        Ok(enclave)
    }

    fn unload_enclave(&self) {
        let enclave = match self.enclave.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(enclave) = enclave {
            self.loader.destroy(enclave.hardware());
            debug!("unloaded quoting enclave");
        }
    }

    fn reload_enclave(&self) -> Result<QuotingEnclave, QuoteError> {
        self.unload_enclave();
        self.load_enclave()
    }

    /// Call into the quoting enclave, retrying once on a lost boundary.
    pub(crate) fn call_enclave<T>(
        &self,
        operation_name: &str,
        mut f: impl FnMut(&QuotingEnclave) -> Result<T, QeStatus>,
    ) -> Result<T, QuoteError> {
        let enclave = self.load_enclave()?;
        retry::once_on_lost(
            operation_name,
            enclave,
            |qe| f(qe).context(operation_name),
            || self.reload_enclave(),
        )
    }

    fn with_policy<T>(&self, f: impl FnOnce() -> Result<T, QuoteError>) -> Result<T, QuoteError> {
        *self
            .active_calls
            .lock()
            .map_err(|_| QuoteError::UnexpectedInternal("call counter poisoned".into()))? += 1;
        let result = f();

        // held across the unload so no new call can pick up a dying handle
        let mut active = self
            .active_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *active -= 1;
        if *active == 0 && self.config.load_policy == LoadPolicy::Ephemeral {
            self.unload_enclave();
            self.certifier.unload();
        }
        result
    }

    /// The cached blob, read from storage on first use.
    pub(crate) fn restore(&self, state: &mut BlobState) -> Option<Vec<u8>> {
        if state.blob.is_none() && !state.restored {
            state.restored = true;
            if let Some(storage) = &self.storage {
                match storage.read(&self.config.blob_label) {
                    Ok(blob) => {
                        debug!(len = blob.len(), "restored attestation key blob");
                        state.blob = Some(blob);
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!("no stored attestation key blob");
                    }
                    Err(e) => warn!("Failed to read attestation key blob: {e}"),
                }
            }
        }
        state.blob.clone()
    }

    fn persist(&self, blob: &[u8]) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.write(&self.config.blob_label, blob) {
            Ok(()) => debug!(len = blob.len(), "persisted attestation key blob"),
            Err(e) => warn!("Failed to persist attestation key blob, keeping it in memory: {e}"),
        }
    }

    /// Make `blob` the authoritative record.
    pub(crate) fn replace_blob(&self, state: &mut BlobState, blob: Vec<u8>) {
        self.persist(&blob);
        state.blob = Some(blob);
    }

    /// Cache what a successful blob verification revealed.
    pub(crate) fn absorb(&self, state: &mut BlobState, info: BlobInfo) -> RecordPlain {
        if let Some(resealed) = info.resealed {
            info!("attestation key blob resealed for the current TCB");
            self.replace_blob(state, resealed);
        }
        state.qe_id = Some(info.record.qe_id);
        if let Some(ppid) = info.encrypted_ppid {
            state.encrypted_ppid.get_or_insert(ppid);
        }
        info.record
    }

    /// Make sure a certified attestation key exists.
    ///
    /// With `refresh` the key is regenerated, unless another caller
    /// regenerated it while this one waited for the blob lock.
    pub fn init_quote(&self, refresh: bool) -> Result<InitQuoteOutput, QuoteError> {
        let epoch = self.regenerations();
        self.with_policy(|| {
            let mut state = self.lock_state()?;
            let refresh = if refresh && self.regenerations() != epoch {
                debug!("key regenerated while waiting, not refreshing again");
                false
            } else {
                refresh
            };
            let outcome = self.certify_key(&mut state, refresh)?;
            let target_info =
                self.call_enclave("quoting enclave target info", |qe| qe.target_info())?;
            Ok(InitQuoteOutput {
                target_info,
                key_fingerprint: outcome.key_fingerprint,
                decision: outcome.decision,
            })
        })
    }

    fn usable_key(&self, state: &mut BlobState) -> Result<UsableKey, QuoteError> {
        let blob = self
            .restore(state)
            .ok_or_else(|| QuoteError::KeyNotInitialized("no attestation key".into()))?;
        let want_ppid = state.encrypted_ppid.is_none();
        let info = self
            .call_enclave("verify attestation key blob", |qe| {
                qe.verify_blob(&blob, want_ppid)
            })
            .map_err(|e| match e {
                QuoteError::BlobIntegrityFailure(context) => QuoteError::KeyNotInitialized(context),
                e => e,
            })?;
        let current_qe_isv_svn = info.current_tcb.isv_svn;
        let current_cpu_svn = info.current_tcb.cpu_svn;
        let record = self.absorb(state, info);
        if coordinator::needs_regeneration(&record, self.config.cert_key_type, current_qe_isv_svn) {
            return Err(QuoteError::KeyNotInitialized(
                "attestation key must be regenerated".into(),
            ));
        }

        let cert = if self.provider.is_present() {
            let pce = self.certifier.identity()?;
            let raw_tcb = CertTcb {
                cpu_svn: current_cpu_svn,
                pce_isv_svn: pce.isv_svn,
                pce_id: pce.pce_id,
            };
            self.provider.query(&coordinator::pck_cert_id(
                record.qe_id,
                &raw_tcb,
                state.encrypted_ppid,
            ))?
        } else {
            None
        };

        Ok(UsableKey {
            blob: state.blob.clone().unwrap_or(blob),
            record,
            cert,
        })
    }

    /// Size of the next quote.
    pub fn get_quote_size(&self) -> Result<usize, QuoteError> {
        self.with_policy(|| {
            let mut state = self.lock_state()?;
            let key = self.usable_key(&mut state)?;
            Ok(quote_size_for(
                key.cert.as_ref().map(|cert| cert.cert_data.as_slice()),
            ))
        })
    }

    /// Write a quote for `td_report` into `quote`.
    ///
    /// With `request`, also returns a companion report binding the quote to
    /// the request nonce.
    pub fn get_quote(
        &self,
        td_report: &TdReport,
        quote: &mut [u8],
        request: Option<&QeReportRequest>,
    ) -> Result<QuoteOutput, QuoteError> {
        self.with_policy(|| {
            let mut state = self.lock_state()?;
            let key = self.usable_key(&mut state)?;
            if let Some(cert) = &key.cert {
                let provider_tcb = cert.cert_tcb(key.record.cert_pce_id);
                if provider_tcb != key.record.cert_tcb() {
                    info!(%provider_tcb, "certification data changed, key must be recertified");
                    return Err(QuoteError::KeyNotInitialized(
                        "certifying TCB differs from the provider's".into(),
                    ));
                }
            }
            let chain = key.cert.as_ref().map(|cert| cert.cert_data.as_slice());

            let generated = self
                .call_enclave("generate quote", |qe| {
                    qe.gen_quote(&key.blob, td_report, request, chain, &mut *quote)
                })
                .map_err(|e| match e {
                    QuoteError::BlobIntegrityFailure(context) => {
                        QuoteError::KeyNotInitialized(context)
                    }
                    e => e,
                })?;
            if let Some(resealed) = generated.resealed {
                self.replace_blob(&mut state, resealed);
            }
            debug!(len = generated.len, "generated quote");
            Ok(QuoteOutput {
                len: generated.len,
                qe_report: generated.qe_report,
            })
        })
    }

    /// Release both boundaries.
    pub fn teardown(&self) {
        self.unload_enclave();
        self.certifier.unload();
    }
}

impl Drop for QuotingContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
