// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Trusted computing base descriptors

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Opaque 16 byte CPU security version
pub type CpuSvn = [u8; 16];

/// The TCB a certifier signature is issued for.
///
/// Two flavours exist at runtime: the *raw* TCB, which is what the platform
/// currently runs, and the *certifying* TCB, which may be lower and is chosen
/// so that a matching PCK certificate exists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertTcb {
    /// CPU security version
    #[serde(with = "hex::serde")]
    pub cpu_svn: CpuSvn,
    /// ISV SVN of the platform certifier
    pub pce_isv_svn: u16,
    /// Identifier of the platform certifier
    pub pce_id: u16,
}

impl Display for CertTcb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpusvn={} pcesvn={} pceid={}",
            hex::encode(self.cpu_svn),
            self.pce_isv_svn,
            self.pce_id
        )
    }
}

/// The TCB a blob was sealed under
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SealTcb {
    /// CPU security version
    pub cpu_svn: CpuSvn,
    /// ISV SVN of the sealing enclave
    pub isv_svn: u16,
}
