//! Log output of terminal events, captured through the `log` bridge.

use log::Level;
use msh_reliability::{
    CoreConfig,
    MessageId,
    Outcome,
    RetryPolicy,
    Role,
    reliability::ExchangePattern,
};
use msh_testing::{Gateway, LoggerHandle, TestResult, logger, t0};
use rstest::rstest;
use serial_test::serial;

#[rstest]
#[tokio::test]
#[serial]
async fn abandonment_logs_a_warning(mut logger: LoggerHandle) -> TestResult {
    let gateway = Gateway::new(CoreConfig::default())?;
    let message = MessageId::new("logged");
    gateway
        .tracker
        .record_dispatch_at(
            &message,
            ExchangePattern::Push,
            Role::Sending,
            Some(RetryPolicy::send_once()),
            t0(),
        )
        .await?;
    gateway
        .tracker
        .record_outcome_at(&message, Outcome::ProtocolError, t0())
        .await?;

    assert!(logger.contains(Level::Warn, "delivery abandoned"));
    Ok(())
}

#[rstest]
#[tokio::test]
#[serial]
async fn scheduled_retry_logs_at_info(mut logger: LoggerHandle) -> TestResult {
    let gateway = Gateway::new(CoreConfig::default())?;
    let message = MessageId::new("retrying");
    gateway
        .tracker
        .record_dispatch_at(&message, ExchangePattern::Push, Role::Sending, None, t0())
        .await?;
    gateway
        .tracker
        .record_outcome_at(&message, Outcome::Timeout, t0())
        .await?;

    assert!(logger.contains(Level::Info, "retry scheduled"));
    Ok(())
}
