// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Certification data provider bridge
//!
//! An optional provider supplies the PCK certificate chain and the TCB it was
//! issued for. Without a provider, or when it has nothing for this platform,
//! quotes carry the encrypted platform identifier instead.

use crate::{
    error::QuoteError,
    qe::EncryptedPpid,
    tcb::{CertTcb, CpuSvn},
};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Smallest plausible certification data payload
pub const MIN_CERT_DATA_SIZE: usize = 500;
/// Largest plausible certification data payload
pub const MAX_CERT_DATA_SIZE: usize = 4098 * 3;

/// Identifies the PCK certificate of a platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PckCertId {
    /// Platform identifier
    pub qe_id: [u8; 16],
    /// Raw CPU SVN of the platform
    pub platform_cpu_svn: CpuSvn,
    /// Raw certifier ISV SVN of the platform
    pub platform_pce_isv_svn: u16,
    /// Certifier identifier
    pub pce_id: u16,
    /// Encrypted platform identifier, if known
    pub encrypted_ppid: Option<EncryptedPpid>,
}

/// Certification data for a platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QeCertConfig {
    /// CPU SVN the certificate was issued for
    pub cert_cpu_svn: CpuSvn,
    /// Certifier ISV SVN the certificate was issued for
    pub cert_pce_isv_svn: u16,
    /// PEM encoded PCK certificate chain
    pub cert_data: Vec<u8>,
}

impl QeCertConfig {
    /// The certifying TCB for certifier `pce_id`
    pub fn cert_tcb(&self, pce_id: u16) -> CertTcb {
        CertTcb {
            cpu_svn: self.cert_cpu_svn,
            pce_isv_svn: self.cert_pce_isv_svn,
            pce_id,
        }
    }
}

/// Provider failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No certification data for this platform; selects the fallback
    #[error("no certification data available")]
    Unavailable,
    /// The provider failed
    #[error("provider failure: {0}")]
    Failed(String),
}

/// A source of platform certification data
pub trait CertDataProvider: Send + Sync {
    /// Certification data for the platform identified by `id`
    fn get_cert_data(&self, id: &PckCertId) -> Result<QeCertConfig, ProviderError>;
}

/// Queries the provider, if one is configured, and validates its answer
#[derive(Clone, Default)]
pub struct ProviderBridge {
    provider: Option<Arc<dyn CertDataProvider>>,
}

impl ProviderBridge {
    /// A bridge to `provider`; `None` always selects the fallback
    pub fn new(provider: Option<Arc<dyn CertDataProvider>>) -> Self {
        Self { provider }
    }

    /// True if a provider is configured
    pub fn is_present(&self) -> bool {
        self.provider.is_some()
    }

    /// Certification data for `id`, or `None` for the fallback path.
    pub fn query(&self, id: &PckCertId) -> Result<Option<QeCertConfig>, QuoteError> {
        let Some(provider) = &self.provider else {
            trace!("no certification data provider configured");
            return Ok(None);
        };
        match provider.get_cert_data(id) {
            Ok(config) => {
                let len = config.cert_data.len();
                if !(MIN_CERT_DATA_SIZE..=MAX_CERT_DATA_SIZE).contains(&len) {
                    warn!(len, "certification data size out of range");
                    return Err(QuoteError::CertificationDataInvalid(format!(
                        "provider returned {len} bytes"
                    )));
                }
                debug!(
                    cert_pce_isv_svn = config.cert_pce_isv_svn,
                    len, "provider returned certification data"
                );
                Ok(Some(config))
            }
            Err(ProviderError::Unavailable) => {
                debug!("provider has no certification data, using fallback");
                Ok(None)
            }
            Err(ProviderError::Failed(msg)) => Err(QuoteError::CertificationDataInvalid(msg)),
        }
    }
}

/// A provider answering every query with the same, replaceable configuration
#[derive(Default)]
pub struct StaticCertProvider {
    config: RwLock<Option<QeCertConfig>>,
}

impl StaticCertProvider {
    /// A provider answering with `config`
    pub fn new(config: QeCertConfig) -> Self {
        Self {
            config: RwLock::new(Some(config)),
        }
    }

    /// Replace the answer; `None` makes the provider report [`ProviderError::Unavailable`]
    pub fn set(&self, config: Option<QeCertConfig>) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl CertDataProvider for StaticCertProvider {
    fn get_cert_data(&self, _id: &PckCertId) -> Result<QeCertConfig, ProviderError> {
        self.config
            .read()
            .map_err(|_| ProviderError::Failed("provider lock poisoned".into()))?
            .clone()
            .ok_or(ProviderError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> PckCertId {
        PckCertId {
            qe_id: [1; 16],
            platform_cpu_svn: [2; 16],
            platform_pce_isv_svn: 3,
            pce_id: 0,
            encrypted_ppid: None,
        }
    }

    fn config(len: usize) -> QeCertConfig {
        QeCertConfig {
            cert_cpu_svn: [2; 16],
            cert_pce_isv_svn: 3,
            cert_data: vec![b'-'; len],
        }
    }

    #[test]
    fn absent_provider_selects_fallback() {
        assert_eq!(ProviderBridge::default().query(&id()), Ok(None));
    }

    #[test]
    fn unavailable_selects_fallback() {
        let provider = Arc::new(StaticCertProvider::default());
        let bridge = ProviderBridge::new(Some(provider.clone()));
        assert_eq!(bridge.query(&id()), Ok(None));

        provider.set(Some(config(MIN_CERT_DATA_SIZE)));
        assert_eq!(bridge.query(&id()), Ok(Some(config(MIN_CERT_DATA_SIZE))));
    }

    #[test]
    fn size_bounds() {
        let provider = Arc::new(StaticCertProvider::new(config(MIN_CERT_DATA_SIZE - 1)));
        let bridge = ProviderBridge::new(Some(provider.clone()));
        assert!(matches!(
            bridge.query(&id()),
            Err(QuoteError::CertificationDataInvalid(_))
        ));

        provider.set(Some(config(MAX_CERT_DATA_SIZE)));
        assert!(bridge.query(&id()).unwrap().is_some());

        provider.set(Some(config(MAX_CERT_DATA_SIZE + 1)));
        assert!(bridge.query(&id()).is_err());
    }
}
