// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! utility functions.

use thiserror::Error;

/// Input does not fit into the target array
#[derive(Error, Debug, PartialEq, Eq)]
#[error("input too long: expected at most {expected} bytes, got {actual}")]
pub struct PadError {
    /// The target array size
    pub expected: usize,
    /// The length of the input
    pub actual: usize,
}

/// Copy `input` into a zero padded array of `T` bytes.
///
/// ```rust
/// # use tdqe::util::{pad, PadError};
/// let padded: [u8; 4] = pad(&[1, 2])?;
/// assert_eq!(padded, [1, 2, 0, 0]);
/// assert!(pad::<1>(&[1, 2]).is_err());
/// # Ok::<(), PadError>(())
/// ```
pub fn pad<const T: usize>(input: &[u8]) -> Result<[u8; T], PadError> {
    if input.len() > T {
        return Err(PadError {
            expected: T,
            actual: input.len(),
        });
    }
    let mut output = [0u8; T];
    output[..input.len()].copy_from_slice(input);
    Ok(output)
}
