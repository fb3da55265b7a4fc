//! Release of fragment storage for finished groups.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use super::GroupId;
use crate::{
    config::CoreConfig,
    store::{SplitJoinStore, StoreError, bounded},
};

/// Delete every fragment of `group_id`, retrying with a doubling back-off.
///
/// Gives up after `cleanup_attempts` tries and returns the last error.
pub(crate) async fn release_fragments(
    store: &dyn SplitJoinStore,
    group_id: GroupId,
    config: &CoreConfig,
) -> Result<u32, StoreError> {
    let backoff = config.cleanup_backoff.normalized();
    let attempts = config.cleanup_attempts.max(1);
    let mut delay: Duration = backoff.initial_delay;
    let mut attempt = 1;
    loop {
        match bounded(
            config.io_timeout,
            "delete_fragments",
            store.delete_fragments(group_id),
        )
        .await
        {
            Ok(released) => {
                debug!(%group_id, released, "fragments released");
                return Ok(released);
            }
            Err(e) if attempt < attempts => {
                warn!(%group_id, attempt, error = %e, ?delay, "fragment cleanup failed; backing off");
                sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
            Err(e) => {
                error!(%group_id, attempt, error = %e, "fragment cleanup abandoned");
                return Err(e);
            }
        }
    }
}
