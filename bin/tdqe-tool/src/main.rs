// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Drive the TDX quoting engine on a simulated platform and retrieve the
//! platform certification payload.

#![deny(missing_docs)]
#![deny(clippy::all)]

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::{fs, path::PathBuf, sync::Arc};
use tdqe::{
    config::QuotingConfig,
    log::{setup_logging, LogLevelParser},
    quote::Quote,
    quoting::QuotingContext,
    sim::SimPlatform,
    util::pad,
};
use tracing::{debug, error, info, level_filters::LevelFilter};

/// Drive the TDX quoting engine.
#[derive(Parser, Debug)]
#[command(author = "Matter Labs", version, about, long_about = None)]
struct Arguments {
    /// Configuration file (json, yaml or toml)
    #[arg(long, env = "TDQE_CONFIG")]
    config: Option<PathBuf>,
    /// Seed of the simulated platform
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Log level for the log output.
    /// Valid values are: `off`, `error`, `warn`, `info`, `debug`, `trace`
    #[clap(long, default_value_t = LevelFilter::WARN, value_parser = LogLevelParser)]
    log_level: LevelFilter,
    /// Write log events as JSON lines
    #[arg(long)]
    json_logs: bool,
    #[clap(subcommand)]
    command: SubCommands,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Regenerate the attestation key even if a usable one exists
    #[arg(long)]
    refresh: bool,
}

#[derive(Args, Debug)]
struct QuoteArgs {
    /// Report data in hex, zero padded to 64 bytes
    #[arg(long, default_value = "")]
    report_data: String,
    /// Where to write the quote
    #[arg(long, short)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Base URL of the certification cache service
    #[arg(long, env = "TDQE_CACHE_URL")]
    url: String,
    /// Bearer token for the cache service
    #[arg(long, env = "TDQE_CACHE_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Subcommand, Debug)]
enum SubCommands {
    /// Generate or refresh the certified attestation key
    Init(InitArgs),
    /// Produce a quote for a simulated TD report
    Quote(QuoteArgs),
    /// Upload the platform certification payload to a cache service
    Upload(UploadArgs),
}

/// Platform registration body of the cache service, all fields hex encoded
#[derive(Serialize, Debug)]
struct PlatformPayload {
    qe_id: String,
    pce_id: String,
    cpu_svn: String,
    pce_svn: String,
    enc_ppid: String,
}

fn quote_for(
    ctx: &QuotingContext,
    platform: &SimPlatform,
    report_data: [u8; 64],
) -> Result<Vec<u8>> {
    let size = ctx.get_quote_size().context("Failed to get the quote size")?;
    let mut quote = vec![0u8; size];
    let out = ctx
        .get_quote(&platform.td_report(report_data), &mut quote, None)
        .context("Failed to generate the quote")?;
    quote.truncate(out.len);
    Ok(quote)
}

fn platform_payload(quote: &[u8]) -> Result<PlatformPayload> {
    let parsed = Quote::parse(quote).context("Failed to parse the quote")?;
    let Some(ppid) = parsed.ppid_payload() else {
        bail!("quote carries a certificate chain, the platform is already registered");
    };
    Ok(PlatformPayload {
        qe_id: hex::encode(&parsed.header.user_data[..16]),
        pce_id: hex::encode({ ppid.pce_id }.to_le_bytes()),
        cpu_svn: hex::encode(ppid.cpu_svn),
        pce_svn: hex::encode({ ppid.pce_isv_svn }.to_le_bytes()),
        enc_ppid: hex::encode(ppid.encrypted_ppid),
    })
}

async fn upload(payload: &PlatformPayload, args: &UploadArgs) -> Result<()> {
    let url = format!(
        "{}/sgx/certification/v4/platforms",
        args.url.trim_end_matches('/')
    );
    debug!(%url, qe_id = %payload.qe_id, "uploading platform payload");
    let response = reqwest::Client::new()
        .post(&url)
        .bearer_auth(&args.token)
        .json(payload)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<empty>".to_string());
        bail!("Upload failed: {status}, response body: {body}");
    }
    info!(%status, "platform payload uploaded");
    Ok(())
}

async fn main_with_error() -> Result<()> {
    let args = Arguments::parse();
    setup_logging(env!("CARGO_CRATE_NAME"), &args.log_level, args.json_logs)?;

    let config = QuotingConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let platform = SimPlatform::with_seed(args.seed);
    let ctx = QuotingContext::new(
        config,
        Arc::new(platform.qe_loader()),
        Arc::new(platform.pce_loader()),
    );

    match &args.command {
        SubCommands::Init(init) => {
            let out = ctx
                .init_quote(init.refresh)
                .context("Failed to initialize the attestation key")?;
            println!("decision: {:?}", out.decision);
            println!("key fingerprint: {}", hex::encode(out.key_fingerprint));
            println!("target mr_enclave: {}", hex::encode(out.target_info.mr_enclave));
        }
        SubCommands::Quote(quote_args) => {
            let report_data = hex::decode(&quote_args.report_data).context("Invalid report data")?;
            let report_data: [u8; 64] = pad(&report_data).context("Invalid report data length")?;
            ctx.init_quote(false)
                .context("Failed to initialize the attestation key")?;
            let quote = quote_for(&ctx, &platform, report_data)?;
            fs::write(&quote_args.output, &quote)
                .with_context(|| format!("Failed to write {}", quote_args.output.display()))?;
            println!("wrote {} bytes to {}", quote.len(), quote_args.output.display());
        }
        SubCommands::Upload(upload_args) => {
            ctx.init_quote(false)
                .context("Failed to initialize the attestation key")?;
            let quote = quote_for(&ctx, &platform, [0; 64])?;
            let payload = platform_payload(&quote)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            upload(&payload, upload_args).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let ret = main_with_error().await;
    if let Err(e) = &ret {
        error!(error = %e, "Execution failed");
    }
    ret
}
