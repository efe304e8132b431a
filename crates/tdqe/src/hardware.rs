// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Isolated boundary primitives
//!
//! [`Hardware`] is the only door from boundary-resident code to the platform:
//! local reports, report verification and hardware derived keys. A
//! [`BoundaryLoader`] creates and destroys boundary instances on the host side.

use crate::report::{KeyRequest, Report, TargetInfo, TdReport, REPORT_DATA_SIZE};
use std::{path::Path, sync::Arc};
use thiserror::Error;

/// Failure of a hardware primitive
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HwError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("out of secure memory")]
    OutOfMemory,
    #[error("isolated boundary lost")]
    BoundaryLost,
    #[error("requested security version is above the platform's")]
    InvalidSvn,
    #[error("report MAC mismatch")]
    MacMismatch,
    #[error("unexpected hardware failure")]
    Unexpected,
}

/// Hardware primitives available inside an isolated boundary
pub trait Hardware: Send + Sync {
    /// Create a local report for `target`, binding `report_data`.
    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &[u8; REPORT_DATA_SIZE],
    ) -> Result<Report, HwError>;

    /// Verify a local report that was targeted at this boundary.
    fn verify_report(&self, report: &Report) -> Result<(), HwError>;

    /// Verify the MAC of a TD report produced on this platform.
    fn verify_td_report(&self, report: &TdReport) -> Result<(), HwError>;

    /// Derive a 128 bit key.
    fn get_key(&self, request: &KeyRequest) -> Result<[u8; 16], HwError>;
}

/// Causes of a failed boundary creation
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error("out of secure memory")]
    OutOfSecureMemory,
    #[error("isolated boundary lost during creation")]
    BoundaryLost,
    #[error("boundary image not found or unreadable")]
    FileAccess,
    #[error("invalid boundary image")]
    InvalidImage,
    #[error("invalid boundary signature")]
    InvalidSignature,
    #[error("isolation device not available")]
    NoDevice,
    #[error("boundary creation failed")]
    Unexpected,
}

/// Creates and destroys isolated boundaries
pub trait BoundaryLoader: Send + Sync {
    /// Create a boundary from the image at `path`.
    fn create(&self, path: &Path) -> Result<Arc<dyn Hardware>, LoadError>;

    /// Destroy a boundary created by this loader.
    fn destroy(&self, boundary: Arc<dyn Hardware>) {
        drop(boundary)
    }
}
