//! Command line interface for the `msh-demo` binary.
//!
//! The binary drives the core against the in-memory store so operators can
//! check fragment sizing and retry schedules before configuring a gateway.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command line arguments for the `msh-demo` binary.
#[derive(Debug, Parser)]
#[command(
    name = "msh-demo",
    version,
    about = "Exercise the reliable delivery core against an in-memory store"
)]
pub struct Cli {
    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Demo operations.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Split a file into fragments and join them again in reverse order.
    SplitJoin {
        /// File to split.
        input: PathBuf,
        /// Where to write the rebuilt payload.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Largest fragment, in bytes.
        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        max_fragment_bytes: usize,
        /// Deflate the payload before cutting it.
        #[arg(long)]
        compress: bool,
    },
    /// Print the retry instants a policy would produce.
    RetryPlan {
        /// Timing algorithm.
        #[arg(long, value_enum, default_value_t = StrategyArg::ConstantInterval)]
        strategy: StrategyArg,
        /// Maximum number of dispatches, first attempt included.
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,
        /// Total retry budget in minutes.
        #[arg(long, default_value_t = 30)]
        budget_minutes: u32,
        /// First back-off delay in seconds.
        #[arg(long, default_value_t = 60)]
        initial_delay_secs: u64,
        /// Largest back-off delay in seconds.
        #[arg(long, default_value_t = 600)]
        max_delay_secs: u64,
    },
}

/// Strategy names accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Never retry.
    SendOnce,
    /// Equal slots across the budget.
    ConstantInterval,
    /// Doubling delays up to a cap.
    ExponentialBackoff,
}
