//! Demonstration binary for `msh_reliability`.
//!
//! Splits a file and joins it back, or prints a retry plan.

mod cli;

use std::{path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use clap::Parser;
use msh_reliability::{
    CoreConfig,
    MemoryStore,
    MessageId,
    RetryPolicy,
    RetryStrategy,
    group::{AcceptOutcome, Fragmenter, InboundFragment, Reassembler, SplitOptions},
    sink::LogStatusSink,
};
use tracing::info;

use crate::cli::{Cli, Command, StrategyArg};

type DemoResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> DemoResult<()> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Command::SplitJoin {
            input,
            output,
            max_fragment_bytes,
            compress,
        } => split_join(&input, output.as_deref(), max_fragment_bytes, compress).await,
        Command::RetryPlan {
            strategy,
            max_attempts,
            budget_minutes,
            initial_delay_secs,
            max_delay_secs,
        } => {
            let strategy = match strategy {
                StrategyArg::SendOnce => RetryStrategy::SendOnce,
                StrategyArg::ConstantInterval => RetryStrategy::ConstantInterval,
                StrategyArg::ExponentialBackoff => RetryStrategy::ExponentialBackoff {
                    initial_delay: Duration::from_secs(initial_delay_secs),
                    max_delay: Duration::from_secs(max_delay_secs),
                },
            };
            retry_plan(RetryPolicy {
                strategy,
                max_attempts,
                timeout_budget_minutes: budget_minutes,
            })
        }
    }
}

async fn split_join(
    input: &Path,
    output: Option<&Path>,
    max_fragment_bytes: usize,
    compress: bool,
) -> DemoResult<()> {
    let config = CoreConfig::default()
        .with_max_fragment_bytes(max_fragment_bytes)
        .with_compression(compress);
    config.validate()?;
    let config = Arc::new(config);
    let sender_store = Arc::new(MemoryStore::new());
    let receiver_store = Arc::new(MemoryStore::new());
    let sink = Arc::new(LogStatusSink);

    let fragmenter = Fragmenter::new(sender_store, config.clone(), sink.clone());
    let reassembler = Reassembler::new(receiver_store, config.clone(), sink);

    let source = MessageId::new(format!("demo-{}", Utc::now().timestamp_millis()));
    let file = tokio::fs::File::open(input).await?;
    let split = fragmenter
        .split(source.clone(), file, SplitOptions::from_config(&config))
        .await?;
    info!(
        group_id = %split.group.group_id,
        fragments = split.fragments.len(),
        "payload split"
    );

    let total = split.group.total_fragment_count;
    for reference in split.fragments.iter().rev() {
        let Some(fragment) = fragmenter.load_fragment(*reference).await? else {
            return Err(format!("fragment {} vanished", reference.sequence).into());
        };
        let outcome = reassembler
            .accept_fragment(InboundFragment {
                group_id: fragment.group_id,
                source_message_id: source.clone(),
                sequence: fragment.sequence,
                total_fragment_count: total,
                compressed: split.group.compression_enabled,
                payload: fragment.payload,
            })
            .await?;
        if let AcceptOutcome::Completed(message) = outcome {
            fragmenter.complete_sending(split.group.group_id).await?;
            info!(bytes = message.payload.len(), "payload rebuilt");
            if let Some(path) = output {
                tokio::fs::write(path, &message.payload).await?;
            }
            return Ok(());
        }
    }
    Err("group did not complete".into())
}

fn retry_plan(policy: RetryPolicy) -> DemoResult<()> {
    policy.validate()?;
    let received_at = Utc::now();
    let mut now = received_at;
    println!("attempt 1 at {received_at}");
    for attempt in 1..policy.max_attempts {
        let Some(next) = policy.next_attempt(received_at, attempt, now) else {
            println!("budget exhausted after attempt {attempt}");
            return Ok(());
        };
        println!("attempt {} at {next}", attempt + 1);
        now = next;
    }
    println!("attempt limit of {} reached", policy.max_attempts);
    Ok(())
}
