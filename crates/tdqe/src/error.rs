// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Quoting error type
//!
//! Every status crossing a boundary is translated through a static table.
//! A status without an entry surfaces as [`QuoteError::UnexpectedInternal`].

use crate::{hardware::LoadError, pce::PceStatus, qe::QeStatus};
use std::fmt::Debug;
use thiserror::Error;

/// Error returned by every public quoting operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum QuoteError {
    #[error("{0}: invalid parameter")]
    InvalidParameter(String),
    #[error("{0}: out of secure memory")]
    OutOfSecureMemory(String),
    #[error("{context}: isolated boundary unavailable")]
    BoundaryUnavailable { context: String, lost: bool },
    #[error("{0}: crypto failure")]
    CryptoFailure(String),
    #[error("{0}: attestation key blob integrity failure")]
    BlobIntegrityFailure(String),
    #[error("{0}: attestation key not initialized")]
    KeyNotInitialized(String),
    #[error("{0}: unsupported attestation key kind")]
    UnsupportedKeyKind(String),
    #[error("{0}: certification data invalid")]
    CertificationDataInvalid(String),
    #[error("{0}: certification failure")]
    CertificationFailure(String),
    #[error("{0}: report integrity failure")]
    ReportIntegrityFailure(String),
    #[error("{0}: unexpected error")]
    UnexpectedInternal(String),
}

impl QuoteError {
    /// The boundary was lost and may be recreated
    pub fn boundary_lost(context: String) -> Self {
        Self::BoundaryUnavailable {
            context,
            lost: true,
        }
    }

    /// The boundary could not be created
    pub fn boundary_unavailable(context: String) -> Self {
        Self::BoundaryUnavailable {
            context,
            lost: false,
        }
    }

    /// True if the error reports a lost boundary
    pub fn is_boundary_lost(&self) -> bool {
        matches!(self, Self::BoundaryUnavailable { lost: true, .. })
    }
}

/// A status translation table
pub type Translation<S> = &'static [(S, fn(String) -> QuoteError)];

/// Quoting enclave status translation
pub static QE_STATUS: Translation<QeStatus> = &[
    (QeStatus::InvalidParameter, QuoteError::InvalidParameter),
    (QeStatus::OutOfMemory, QuoteError::OutOfSecureMemory),
    (QeStatus::BoundaryLost, QuoteError::boundary_lost),
    (QeStatus::InvalidBlob, QuoteError::BlobIntegrityFailure),
    (QeStatus::CryptoError, QuoteError::CryptoFailure),
    (QeStatus::InvalidReport, QuoteError::ReportIntegrityFailure),
    (QeStatus::UnsupportedKeyKind, QuoteError::UnsupportedKeyKind),
    (QeStatus::InvalidCertData, QuoteError::CertificationDataInvalid),
];

/// Platform certifier status translation
pub static PCE_STATUS: Translation<PceStatus> = &[
    (PceStatus::InvalidParameter, QuoteError::InvalidParameter),
    (PceStatus::OutOfMemory, QuoteError::OutOfSecureMemory),
    (PceStatus::BoundaryLost, QuoteError::boundary_lost),
    (PceStatus::InvalidReport, QuoteError::CertificationFailure),
    (PceStatus::InvalidTcb, QuoteError::CertificationFailure),
    (PceStatus::CryptoError, QuoteError::CertificationFailure),
];

/// Boundary creation failure translation; the image and device causes collapse
/// into a single unavailable kind.
pub static LOAD_ERROR: Translation<LoadError> = &[
    (LoadError::OutOfSecureMemory, QuoteError::OutOfSecureMemory),
    (LoadError::BoundaryLost, QuoteError::boundary_lost),
    (LoadError::FileAccess, QuoteError::boundary_unavailable),
    (LoadError::InvalidImage, QuoteError::boundary_unavailable),
    (LoadError::InvalidSignature, QuoteError::boundary_unavailable),
    (LoadError::NoDevice, QuoteError::boundary_unavailable),
];

/// Translate `status` through `table`.
pub fn translate<S: PartialEq + Debug>(
    table: Translation<S>,
    status: S,
    context: &str,
) -> QuoteError {
    table
        .iter()
        .find(|(s, _)| *s == status)
        .map(|(_, make)| make(format!("{context} ({status:?})")))
        .unwrap_or_else(|| {
            QuoteError::UnexpectedInternal(format!("{context}: untranslated status {status:?}"))
        })
}

/// Usability trait for easy QuoteError annotation
pub trait QuoteContext {
    /// The Ok Type
    type Ok;
    /// The Context
    fn context<I: Into<String>>(self, msg: I) -> Result<Self::Ok, QuoteError>;
}

impl<T> QuoteContext for Result<T, QeStatus> {
    type Ok = T;
    fn context<I: Into<String>>(self, msg: I) -> Result<T, QuoteError> {
        self.map_err(|s| translate(QE_STATUS, s, &msg.into()))
    }
}

impl<T> QuoteContext for Result<T, PceStatus> {
    type Ok = T;
    fn context<I: Into<String>>(self, msg: I) -> Result<T, QuoteError> {
        self.map_err(|s| translate(PCE_STATUS, s, &msg.into()))
    }
}

impl<T> QuoteContext for Result<T, LoadError> {
    type Ok = T;
    fn context<I: Into<String>>(self, msg: I) -> Result<T, QuoteError> {
        self.map_err(|s| translate(LOAD_ERROR, s, &msg.into()))
    }
}

impl<T> QuoteContext for Option<T> {
    type Ok = T;
    fn context<I: Into<String>>(self, msg: I) -> Result<T, QuoteError> {
        self.ok_or_else(|| QuoteError::UnexpectedInternal(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_known_status() {
        let err = translate(QE_STATUS, QeStatus::InvalidBlob, "verify blob");
        assert!(matches!(err, QuoteError::BlobIntegrityFailure(_)));

        let err = translate(PCE_STATUS, PceStatus::InvalidTcb, "certify");
        assert!(matches!(err, QuoteError::CertificationFailure(_)));
    }

    #[test]
    fn lost_is_flagged() {
        let err = Err::<(), _>(QeStatus::BoundaryLost).context("gen quote");
        assert!(err.unwrap_err().is_boundary_lost());

        let err = Err::<(), _>(LoadError::NoDevice).context("load");
        let err = err.unwrap_err();
        assert!(matches!(err, QuoteError::BoundaryUnavailable { lost: false, .. }));
        assert!(!err.is_boundary_lost());
    }

    #[test]
    fn unknown_status_is_unexpected() {
        let err = translate(QE_STATUS, QeStatus::Unexpected, "gen quote");
        assert!(matches!(err, QuoteError::UnexpectedInternal(_)));

        let err = translate(PCE_STATUS, PceStatus::Unexpected, "certify");
        assert!(matches!(err, QuoteError::UnexpectedInternal(_)));

        let err = Err::<(), _>(LoadError::Unexpected).context("load");
        assert!(matches!(err, Err(QuoteError::UnexpectedInternal(_))));
    }
}
