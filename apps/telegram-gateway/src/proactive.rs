//! Proactive sweep: per-user checks and digest delivery on each cron tick.

use std::sync::Arc;

use tbg_backend::BackendApi;
use tbg_core::QuotaBackoff;
use tbg_proactive::{Tick, format_digest, run_checks};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::api::BotApi;
use crate::registry::MappingRegistry;

/// Bounded attempts at draining digests deferred by transport quota errors.
const MAX_DRAIN_PASSES: usize = 5;

pub struct SweepRunner {
    pub registry: Arc<MappingRegistry>,
    pub backend: Arc<dyn BackendApi>,
    pub api: Arc<dyn BotApi>,
}

impl SweepRunner {
    /// Runs the full sweep. Per-user and per-check failures are logged and
    /// isolated; quota-limited sends are deferred and retried with a
    /// doubling window.
    pub async fn run_sweep(&self, tick: Tick) {
        let entries = self.registry.snapshot();
        let now = OffsetDateTime::now_utc();
        info!(
            schedule = tick.as_str(),
            users = entries.len(),
            "proactive sweep started"
        );

        let mut deferred: QuotaBackoff<(i64, String)> = QuotaBackoff::new();
        let mut delivered = 0usize;

        for entry in entries {
            let user_id = entry.record.user_id.clone();
            let chat_id = entry.record.telegram_chat_id;
            let Some(token) = entry.auth_token.clone() else {
                warn!(user_id = %user_id, "no usable token; user skipped this sweep");
                continue;
            };

            let result = run_checks(self.backend.as_ref(), &user_id, &token, now).await;
            if !result.has_issues() {
                continue;
            }

            let digest = format_digest(&result);
            match self.api.send_message(chat_id, &digest).await {
                Ok(_) => delivered += 1,
                Err(err) if is_quota_error(&err) => {
                    deferred.note_quota_failure();
                    deferred.enqueue((chat_id, digest));
                    warn!(user_id = %user_id, "digest deferred by transport quota");
                }
                Err(err) => {
                    warn!(
                        user_id = %user_id,
                        chat_id,
                        error = %err,
                        "digest delivery failed"
                    );
                }
            }
        }

        let mut passes = 0;
        while deferred.queued() > 0 && passes < MAX_DRAIN_PASSES {
            passes += 1;
            sleep(deferred.window()).await;
            let mut requeue = Vec::new();
            while let Some((chat_id, digest)) = deferred.dequeue() {
                match self.api.send_message(chat_id, &digest).await {
                    Ok(_) => {
                        delivered += 1;
                        deferred.note_success();
                    }
                    Err(err) if is_quota_error(&err) => {
                        deferred.note_quota_failure();
                        requeue.push((chat_id, digest));
                    }
                    Err(err) => {
                        warn!(chat_id, error = %err, "deferred digest delivery failed");
                    }
                }
            }
            for item in requeue {
                deferred.enqueue(item);
            }
        }
        if deferred.queued() > 0 {
            warn!(
                remaining = deferred.queued(),
                "digests abandoned after drain passes"
            );
        }

        info!(
            schedule = tick.as_str(),
            delivered, "proactive sweep finished"
        );
    }
}

fn is_quota_error(err: &anyhow::Error) -> bool {
    let text = err.to_string();
    text.contains("429") || text.contains("Too Many Requests")
}
