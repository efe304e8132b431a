// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Attestation key lifecycle and quote assembly for TDX guests.
//!
//! The crate is split along the isolation boundary: [`qe`] holds everything
//! that runs inside the quoting enclave and only ever sees raw [`hardware`]
//! primitives, while [`quoting`] and [`coordinator`] run outside and drive
//! the enclave, the platform certifier ([`pce`]), the certification data
//! provider ([`provider`]) and [`storage`].

#![deny(missing_docs)]
#![deny(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod ecc;
pub mod error;
pub mod hardware;
pub mod log;
pub mod pce;
pub mod provider;
pub mod qe;
pub mod quote;
pub mod quoting;
pub mod report;
pub mod retry;
pub mod sim;
pub mod storage;
pub mod tcb;
pub mod util;
