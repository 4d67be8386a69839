//! Recovery for chats whose delayed trigger was lost.
//!
//! A chat stays in the active set while it has recent traffic. Once its last
//! activity is older than the flush token lifetime, any trigger it had has
//! either fired or been lost, so a non-empty buffer gets a fresh schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use spark_buffer::BufferStore;

use crate::error::ChatError;
use crate::flush::FlushCoordinator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scheduled: usize,
    pub removed: usize,
}

/// One pass over chats idle since before `idle_since`.
pub async fn sweep_once(
    buffer: &dyn BufferStore,
    flush: &FlushCoordinator,
    idle_since: DateTime<Utc>,
) -> Result<SweepReport, ChatError> {
    let mut report = SweepReport::default();

    for chat_id in buffer.active_chats(idle_since).await? {
        let buffered = match buffer.len(&chat_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Sweep could not read buffer");
                continue;
            }
        };

        if buffered == 0 {
            buffer.remove_active(&chat_id).await?;
            report.removed += 1;
            continue;
        }

        match flush.schedule_flush(&chat_id).await {
            Ok(scheduled) => {
                info!(chat_id = %chat_id, buffered = scheduled.buffered, "Sweep rescheduled idle chat");
                debug!(chat_id = %chat_id, token = %scheduled.token, "Sweep token");
                report.scheduled += 1;
            }
            Err(e) => warn!(chat_id = %chat_id, error = %e, "Sweep failed to schedule flush"),
        }
    }

    Ok(report)
}

pub async fn run_sweep(
    buffer: Arc<dyn BufferStore>,
    flush: Arc<FlushCoordinator>,
    every: Duration,
) {
    let ttl = flush.settings().token_ttl();
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let idle_since = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(70));
        match sweep_once(buffer.as_ref(), &flush, idle_since).await {
            Ok(report) if report != SweepReport::default() => {
                debug!(?report, "Active-chat sweep");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Active-chat sweep failed"),
        }
    }
}
