// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Configuration handling
//!
//! Sources, later ones winning: built-in defaults, an optional file, and
//! environment variables such as `TDQE_LOAD_POLICY=ephemeral`.

use crate::qe::{CertKeyType, AUTH_DATA_SIZE};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::trace;

/// When to release the quoting enclave
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Keep the boundaries loaded between calls
    #[default]
    Persistent,
    /// Release both boundaries after every call
    Ephemeral,
}

fn default_auth_data() -> [u8; AUTH_DATA_SIZE] {
    let mut auth_data = [0u8; AUTH_DATA_SIZE];
    for (i, b) in auth_data.iter_mut().enumerate() {
        *b = i as u8;
    }
    auth_data
}

/// Configuration of a [`crate::quoting::QuotingContext`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotingConfig {
    /// Image of the quoting enclave
    pub qe_path: PathBuf,
    /// Image of the platform certifier
    pub pce_path: PathBuf,
    /// Boundary load policy
    pub load_policy: LoadPolicy,
    /// Certification key type requested for the attestation key
    pub cert_key_type: CertKeyType,
    /// Owner supplied data committed to by the key fingerprint
    #[serde(with = "hex::serde")]
    pub auth_data: [u8; AUTH_DATA_SIZE],
    /// Directory for the persisted attestation key blob, none to keep it in memory
    pub storage_dir: Option<PathBuf>,
    /// Storage label of the blob
    pub blob_label: String,
}

impl Default for QuotingConfig {
    fn default() -> Self {
        Self {
            qe_path: "libsgx_tdqe.signed.so".into(),
            pce_path: "libsgx_pce.signed.so".into(),
            load_policy: LoadPolicy::default(),
            cert_key_type: CertKeyType::PpidRsa3072Encrypted,
            auth_data: default_auth_data(),
            storage_dir: None,
            blob_label: "tdqe_data.blob".into(),
        }
    }
}

impl QuotingConfig {
    /// Load the configuration, reading `file` if given.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        trace!(?file, "loading quoting config");
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("TDQE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
