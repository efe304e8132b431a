// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Envelope codec error type

use std::io;
use thiserror::Error;

/// Quote envelope encoding and parsing error
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum EnvelopeError {
    #[error("I/O Error: {context}")]
    IoError { context: String, source: io::Error },
    #[error("parsing bytes")]
    ConvertError(#[from] bytemuck::PodCastError),
    #[error("unsupported quote version {0}")]
    QuoteVersion(u16),
    #[error("invalid tee type {0:#x}")]
    InvalidTeeType(u32),
    #[error("unexpected certification data type {0}")]
    CertificationDataType(u16),
    #[error("{0}: section too large")]
    SectionSize(String),
}

/// Usability trait for easy EnvelopeError annotation
pub trait EnvelopeContext {
    /// The Ok Type
    type Ok;
    /// The Context
    fn context<I: Into<String>>(self, msg: I) -> Result<Self::Ok, EnvelopeError>;
}

impl<T> EnvelopeContext for Result<T, io::Error> {
    type Ok = T;
    fn context<I: Into<String>>(self, msg: I) -> Result<T, EnvelopeError> {
        self.map_err(|e| EnvelopeError::IoError {
            context: msg.into(),
            source: e,
        })
    }
}
