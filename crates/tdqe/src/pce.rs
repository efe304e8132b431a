// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Platform certifier wrapper
//!
//! The certifier lives in its own isolated boundary. [`PceWrapper`] loads it
//! lazily, caches the handle and the certifier identity, and repeats a call
//! once if the boundary was lost.

use crate::{
    error::{QuoteContext as _, QuoteError},
    hardware::LoadError,
    qe::ENCRYPTED_PPID_SIZE,
    report::{Report, TargetInfo},
    retry,
    tcb::CertTcb,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{debug, info};

/// Status codes returned across the certifier boundary
#[repr(u32)]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PceStatus {
    #[error("invalid parameter")]
    InvalidParameter = 1,
    #[error("out of enclave memory")]
    OutOfMemory = 2,
    #[error("enclave lost")]
    BoundaryLost = 3,
    #[error("report verification failed")]
    InvalidReport = 4,
    #[error("requested TCB is above the platform TCB")]
    InvalidTcb = 5,
    #[error("signing failed")]
    CryptoError = 6,
    #[error("unexpected certifier failure")]
    Unexpected = 0xff,
}

/// Identity of the certifier boundary
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PceIdentity {
    /// Target for reports the certifier should verify
    pub target_info: TargetInfo,
    /// Current ISV SVN of the certifier
    pub isv_svn: u16,
    /// Certifier identifier
    pub pce_id: u16,
}

/// Platform information released by the certifier for a QE report
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Encrypted platform identifier
    pub encrypted_ppid: [u8; ENCRYPTED_PPID_SIZE],
    /// Encryption scheme of `encrypted_ppid`
    pub crypto_suite: u8,
    /// Current ISV SVN of the certifier
    pub pce_isv_svn: u16,
    /// Certifier identifier
    pub pce_id: u16,
}

/// Calls into a loaded certifier boundary
pub trait Certifier: Send + Sync {
    /// Identity of the certifier
    fn identity(&self) -> Result<PceIdentity, PceStatus>;

    /// Platform information for a QE report targeted at the certifier
    fn platform_info(&self, qe_report: &Report) -> Result<PlatformInfo, PceStatus>;

    /// Sign the body of `qe_report` with the PCK key of `cert_tcb`.
    ///
    /// Returns big-endian `r || s`.
    fn certify(&self, qe_report: &Report, cert_tcb: &CertTcb) -> Result<[u8; 64], PceStatus>;
}

/// Creates certifier boundaries
pub trait CertifierLoader: Send + Sync {
    /// Load the certifier from `path`
    fn load(&self, path: &Path) -> Result<Arc<dyn Certifier>, LoadError>;
}

struct Loaded {
    certifier: Arc<dyn Certifier>,
    identity: Option<PceIdentity>,
}

/// Cached, retrying access to the certifier
pub struct PceWrapper {
    loader: Arc<dyn CertifierLoader>,
    path: PathBuf,
    slot: Mutex<Option<Loaded>>,
}

impl PceWrapper {
    /// A wrapper loading the certifier from `path` on first use
    pub fn new(loader: Arc<dyn CertifierLoader>, path: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            path: path.into(),
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Loaded>>, QuoteError> {
        self.slot
            .lock()
            .map_err(|_| QuoteError::UnexpectedInternal("certifier lock poisoned".into()))
    }

    fn load(&self) -> Result<Arc<dyn Certifier>, QuoteError> {
        let mut slot = self.lock()?;
        if let Some(loaded) = slot.as_ref() {
            return Ok(loaded.certifier.clone());
        }
        let certifier = self
            .loader
            .load(&self.path)
            .context(format!("loading certifier {}", self.path.display()))?;
        debug!(path = %self.path.display(), "loaded certifier");
        *slot = Some(Loaded {
            certifier: certifier.clone(),
            identity: None,
        });
        Ok(certifier)
    }

    fn reload(&self) -> Result<Arc<dyn Certifier>, QuoteError> {
        self.lock()?.take();
        self.load()
    }

    fn call<T>(
        &self,
        operation_name: &str,
        mut f: impl FnMut(&dyn Certifier) -> Result<T, PceStatus>,
    ) -> Result<T, QuoteError> {
        let certifier = self.load()?;
        retry::once_on_lost(
            operation_name,
            certifier,
            |c| f(c.as_ref()).context(operation_name),
            || self.reload(),
        )
    }

    /// Identity of the certifier, cached per loaded instance
    pub fn identity(&self) -> Result<PceIdentity, QuoteError> {
        if let Some(identity) = self.lock()?.as_ref().and_then(|l| l.identity) {
            return Ok(identity);
        }
        let identity = self.call("certifier identity", |c| c.identity())?;
        if let Some(loaded) = self.lock()?.as_mut() {
            loaded.identity = Some(identity);
        }
        Ok(identity)
    }

    /// See [`Certifier::platform_info`]
    pub fn platform_info(&self, qe_report: &Report) -> Result<PlatformInfo, QuoteError> {
        self.call("certifier platform info", |c| c.platform_info(qe_report))
    }

    /// See [`Certifier::certify`]
    pub fn certify(&self, qe_report: &Report, cert_tcb: &CertTcb) -> Result<[u8; 64], QuoteError> {
        info!(%cert_tcb, "certifying attestation key");
        self.call("certify", |c| c.certify(qe_report, cert_tcb))
    }

    /// Release the certifier boundary
    pub fn unload(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.take().is_some() {
                debug!("unloaded certifier");
            }
        }
    }
}
