// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PULSE Simulator
//!
//! Entry point for the `pulse-sim` binary. Builds two complete protocol
//! engines on an in-memory radio hub, connects them, and drives one
//! payment end to end — printing the transcript a pair of phones would
//! produce if phones printed transcripts.

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::timeout;

use pulse_protocol::crypto::session::SessionCrypto;
use pulse_protocol::crypto::signer::SoftwareSigner;
use pulse_protocol::identity::PeerIdentity;
use pulse_protocol::link::radio::MemoryHub;
use pulse_protocol::payment::{Currency, PaymentEvent};
use pulse_protocol::store::MemoryTrustStore;
use pulse_protocol::{PulseConfig, PulseEngine};

use cli::{Commands, PulseSimCli};
use logging::LogFormat;

/// How long the scripted scenario may run before we call it a hang.
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PulseSimCli::parse();

    match cli.command {
        Commands::Pay(args) => run_payment(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Build an engine whose real identity is registered on the hub.
fn spawn_device(hub: &MemoryHub, name: &str, mtu: usize) -> Arc<PulseEngine> {
    let signer = SoftwareSigner::generate();
    let crypto = Arc::new(SessionCrypto::new(
        signer.clone(),
        pulse_protocol::config::SESSION_TTL,
    ));
    let identity = PeerIdentity::new(
        crypto.sign_public_key(),
        crypto.agree_public_bytes(),
        name.into(),
    );
    let radio = hub.join(identity, -42);
    let engine = PulseEngine::with_crypto(
        signer,
        crypto,
        radio,
        Arc::new(MemoryTrustStore::new()),
        PulseConfig {
            display_name: name.into(),
            mtu,
            ..PulseConfig::default()
        },
    );
    engine.start();
    engine
}

/// The scripted scenario: connect, request, respond, settle.
async fn run_payment(args: cli::PayArgs) -> Result<()> {
    logging::init_logging(
        "pulse_sim=info,pulse_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let hub = MemoryHub::new();
    let payer = spawn_device(&hub, "payer-phone", args.mtu);
    let payee = spawn_device(&hub, "payee-phone", args.mtu);

    tracing::info!(
        payer = %payer.device_id(),
        payee = %payee.device_id(),
        mtu = args.mtu,
        "devices on the air"
    );

    payer.payments().wallet().credit(&Currency::PULSE, args.balance);

    payer
        .connect(payee.identity())
        .await
        .context("payer failed to connect")?;

    let mut payer_events = payer.payments().subscribe();
    let mut payee_events = payee.payments().subscribe();

    let request_id = payer
        .payments()
        .request_payment(
            payee.device_id(),
            args.amount,
            Currency::PULSE,
            args.memo.clone(),
        )
        .await
        .context("payment request failed")?;
    tracing::info!(request_id = %request_id, amount = args.amount, "request sent");

    let outcome = timeout(SCENARIO_TIMEOUT, async {
        // Payee: wait for the request and answer it.
        loop {
            match payee_events.recv().await? {
                PaymentEvent::RequestReceived {
                    request_id, memo, amount, ..
                } => {
                    tracing::info!(request_id = %request_id, amount, memo = %memo, "payee received request");
                    payee
                        .payments()
                        .respond(&request_id, !args.reject, args.reject.then(|| "declined by operator".to_string()))
                        .await?;
                    break;
                }
                other => tracing::debug!(?other, "payee event"),
            }
        }

        // Payer: wait for a terminal verdict.
        loop {
            match payer_events.recv().await? {
                PaymentEvent::Completed {
                    request_id,
                    transaction_id,
                } => {
                    tracing::info!(request_id = %request_id, transaction_id = %transaction_id, "payment completed");
                    return anyhow::Ok(true);
                }
                PaymentEvent::Rejected { reason, .. } => {
                    tracing::info!(reason = ?reason, "payment rejected");
                    return anyhow::Ok(false);
                }
                PaymentEvent::Failed { reason, .. } => bail!("payment failed: {reason}"),
                PaymentEvent::Expired { .. } => bail!("payment expired"),
                other => tracing::debug!(?other, "payer event"),
            }
        }
    })
    .await
    .context("scenario timed out")??;

    println!("── scenario result ──────────────────────────────");
    println!("payer balance:  {}", payer.payments().wallet().balance(&Currency::PULSE));
    println!("payee balance:  {}", payee.payments().wallet().balance(&Currency::PULSE));
    println!(
        "outcome:        {}",
        if outcome { "completed" } else { "rejected" }
    );

    payer.shutdown().await;
    payee.shutdown().await;
    Ok(())
}

fn print_version() {
    println!(
        "pulse-sim {} (protocol {})",
        env!("CARGO_PKG_VERSION"),
        pulse_protocol::config::PROTOCOL_VERSION,
    );
}
