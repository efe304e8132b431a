// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Retry on a lost isolated boundary
//!
//! A boundary can be lost at any time (e.g. on a power transition). The one
//! call that observed the loss is repeated exactly once against a freshly
//! loaded boundary; every other failure is returned as-is.

use crate::error::QuoteError;
use tracing::{debug, warn};

/// Errors that can report a lost boundary
pub trait Transient {
    /// True if the boundary the call ran in was lost
    fn is_boundary_lost(&self) -> bool;
}

impl Transient for QuoteError {
    fn is_boundary_lost(&self) -> bool {
        QuoteError::is_boundary_lost(self)
    }
}

/// Run `call` against `handle`; if the boundary was lost, obtain a new handle
/// from `reload` and run `call` once more.
pub fn once_on_lost<H, T, E, C, R>(
    operation_name: &str,
    handle: H,
    mut call: C,
    reload: R,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    C: FnMut(&H) -> Result<T, E>,
    R: FnOnce() -> Result<H, E>,
{
    match call(&handle) {
        Err(e) if e.is_boundary_lost() => {
            warn!("Operation '{operation_name}' lost its boundary ({e}), reloading and retrying once");
            drop(handle);
            let handle = reload()?;
            let result = call(&handle);
            if result.is_ok() {
                debug!("Operation '{operation_name}' succeeded after reload");
            }
            result
        }
        result => result,
    }
}
