//! # CLI Interface
//!
//! Defines the command-line argument structure for `pulse-sim` using
//! `clap` derive. Two subcommands: `pay` runs a scripted payment between
//! two in-process devices, `version` prints build information.

use clap::{Parser, Subcommand};

/// PULSE protocol simulator.
///
/// Stands up two complete protocol engines over an in-memory radio and
/// drives a payment between them — the whole stack (key agreement,
/// fragmentation, ACK/retry, payment state machine) without touching
/// radio hardware.
#[derive(Parser, Debug)]
#[command(
    name = "pulse-sim",
    about = "Two-device PULSE payment simulator",
    version,
    propagate_version = true
)]
pub struct PulseSimCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the simulator binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one payment between two simulated devices.
    Pay(PayArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `pay` subcommand.
#[derive(Parser, Debug)]
pub struct PayArgs {
    /// Payment amount, in the currency's smallest unit.
    #[arg(long, default_value_t = 1_200)]
    pub amount: u64,

    /// Memo attached to the payment request.
    #[arg(long, default_value = "coffee at pulse cafe")]
    pub memo: String,

    /// Sender's starting balance, in smallest units.
    #[arg(long, default_value_t = 10_000)]
    pub balance: u64,

    /// Maximum radio write size in bytes. Small values exercise the
    /// fragmentation path.
    #[arg(long, default_value_t = 512)]
    pub mtu: usize,

    /// Have the receiver reject the request instead of accepting it.
    #[arg(long)]
    pub reject: bool,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "PULSE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        PulseSimCli::command().debug_assert();
    }
}
