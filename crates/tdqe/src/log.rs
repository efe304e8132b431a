// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Logging related stuff

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_log::LogTracer;
use tracing_subscriber::Registry;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// A log level parser for clap, with "off", "error", "warn", "info", "debug", "trace" as valid values
#[derive(Clone)]
pub struct LogLevelParser;

impl clap::builder::TypedValueParser for LogLevelParser {
    type Value = LevelFilter;

    fn parse_ref(
        &self,
        cmd: &clap::Command,
        arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> anyhow::Result<Self::Value, clap::Error> {
        clap::builder::TypedValueParser::parse(self, cmd, arg, value.to_owned())
    }

    fn parse(
        &self,
        cmd: &clap::Command,
        arg: Option<&clap::Arg>,
        value: std::ffi::OsString,
    ) -> std::result::Result<Self::Value, clap::Error> {
        use std::str::FromStr;
        let p = clap::builder::PossibleValuesParser::new([
            "off", "error", "warn", "info", "debug", "trace",
        ]);
        let v = p.parse(cmd, arg, value)?;

        LevelFilter::from_str(&v)
            .map_err(|_| clap::Error::new(clap::error::ErrorKind::InvalidValue))
    }
}

fn default_filter(app: &str, log_level: &LevelFilter) -> EnvFilter {
    match *log_level {
        LevelFilter::OFF => EnvFilter::new("off"),
        _ => EnvFilter::new(format!(
            "warn,{app}={log_level},{crate_name}={log_level}",
            crate_name = env!("CARGO_CRATE_NAME"),
        )),
    }
}

/// Setup standard logging and loglevel for the application `app` and the `tdqe` crate.
///
/// `RUST_LOG` overrides `log_level`. With `json` set, events are written as
/// JSON lines.
pub fn setup_logging(app: &str, log_level: &LevelFilter, json: bool) -> anyhow::Result<()> {
    LogTracer::init().context("Failed to set logger")?;
    let filter = EnvFilter::builder()
        .try_from_env()
        .unwrap_or_else(|_| default_filter(&app.replace('-', "_"), log_level));

    let fmt_layer = fmt::layer().with_writer(std::io::stderr);
    if json {
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(false));
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
