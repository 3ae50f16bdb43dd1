//! The operation processor: drains the persistent queue through typed
//! handlers.
//!
//! One drain runs at a time. Within a drain, the highest-priority
//! eligible operation dispatches next; an operation is *not* eligible
//! while its backoff window is open or while it references a temporary
//! id that has no mapping yet. The latter is the happens-before edge
//! between a create completing and every other operation for that
//! entity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use minote_client_db::DbResult;
use minote_core::{NoteOperation, OperationId, OperationKind, OperationStatus, Timestamp};
use minote_util_error::FmtCompact as _;
use tracing::{debug, info, warn};

use crate::api::ApiResult;
use crate::config::ClientConfig;
use crate::id_map::IdMappingRegistry;
use crate::queue::OperationQueue;

const LOG_TARGET: &str = "minote::processor";

/// One per [`OperationKind`]; injected into the processor.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute the operation. `op.note_id` arrives already resolved
    /// through the id-mapping registry.
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()>;
}

pub type HandlerMap = HashMap<OperationKind, Arc<dyn OperationHandler>>;

pub struct OperationProcessor {
    queue: Arc<OperationQueue>,
    registry: Arc<IdMappingRegistry>,
    handlers: HandlerMap,
    config: ClientConfig,
    /// Serializes queue draining.
    drain_lock: tokio::sync::Mutex<()>,
}

impl OperationProcessor {
    pub fn new(
        queue: Arc<OperationQueue>,
        registry: Arc<IdMappingRegistry>,
        handlers: HandlerMap,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            handlers,
            config,
            drain_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Drain every eligible pending operation; stops when none is left.
    /// Returns how many operations completed successfully.
    pub async fn process_queue(&self) -> DbResult<usize> {
        let _guard = self.drain_lock.lock().await;

        let mut processed = 0;
        loop {
            let Some(op) = self.next_eligible().await? else {
                break;
            };
            if self.run_one(op).await? {
                processed += 1;
            }
        }

        if 0 < processed {
            info!(target: LOG_TARGET, processed, "Queue drained");
        }
        Ok(processed)
    }

    /// Attempt one just-enqueued operation right now rather than waiting
    /// for the next drain tick. Other operations' ordering is
    /// unaffected: the drain lock still serializes, and only this
    /// operation is considered.
    pub async fn process_immediately(&self, op_id: &OperationId) -> DbResult<bool> {
        let _guard = self.drain_lock.lock().await;

        let Some(op) = self.queue.get(op_id).await? else {
            return Ok(false);
        };
        if op.status != OperationStatus::Pending || !self.is_eligible(&op, Timestamp::now()) {
            return Ok(false);
        }
        self.run_one(op).await
    }

    async fn next_eligible(&self) -> DbResult<Option<NoteOperation>> {
        let now = Timestamp::now();
        let pending = self.queue.pending_operations().await?;
        Ok(pending.into_iter().find(|op| self.is_eligible(op, now)))
    }

    fn is_eligible(&self, op: &NoteOperation, now: Timestamp) -> bool {
        if now < op.next_attempt_at {
            return false;
        }

        // An operation referencing a temporary id must wait for the
        // create that will mint the server id, unless it *is* that
        // create.
        let is_create = matches!(
            op.kind,
            OperationKind::NoteCreate | OperationKind::FolderCreate
        );
        if op.note_id.is_temporary() && !is_create && !self.registry.has_mapping(op.note_id.as_str())
        {
            debug!(
                target: LOG_TARGET,
                op_id = %op.id,
                note_id = %op.note_id,
                kind = ?op.kind,
                "Deferring operation until id mapping appears"
            );
            return false;
        }

        true
    }

    async fn run_one(&self, op: NoteOperation) -> DbResult<bool> {
        let Some(handler) = self.handlers.get(&op.kind) else {
            warn!(target: LOG_TARGET, kind = ?op.kind, "No handler for operation kind");
            self.queue
                .update_status(
                    &op.id,
                    OperationStatus::Failed,
                    Some("no handler registered".to_owned()),
                )
                .await?;
            return Ok(false);
        };

        let mut resolved = op.clone();
        resolved.note_id = self.registry.resolve_note_id(&op.note_id);

        self.queue
            .update_status(&op.id, OperationStatus::Running, None)
            .await?;
        debug!(
            target: LOG_TARGET,
            op_id = %op.id,
            kind = ?op.kind,
            note_id = %resolved.note_id,
            retry = op.retry_count,
            "Dispatching operation"
        );

        match handler.execute(&resolved).await {
            Ok(()) => {
                self.queue.remove(&op.id).await?;
                Ok(true)
            }
            Err(err) if err.is_retryable() => {
                let retry_count = op.retry_count + 1;
                if retry_count < self.config.max_operation_retries {
                    let delay = self.backoff_delay(retry_count);
                    debug!(
                        target: LOG_TARGET,
                        op_id = %op.id,
                        err = %err.fmt_compact(),
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure; scheduling retry"
                    );
                    self.queue
                        .mark_retry(
                            &op.id,
                            retry_count,
                            Timestamp::now().saturating_add(delay),
                            Some(err.to_string()),
                        )
                        .await?;
                } else {
                    warn!(
                        target: LOG_TARGET,
                        op_id = %op.id,
                        err = %err.fmt_compact(),
                        "Retries exhausted; marking operation failed"
                    );
                    self.queue
                        .update_status(&op.id, OperationStatus::Failed, Some(err.to_string()))
                        .await?;
                }
                Ok(false)
            }
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    op_id = %op.id,
                    err = %err.fmt_compact(),
                    "Permanent failure; marking operation failed"
                );
                self.queue
                    .update_status(&op.id, OperationStatus::Failed, Some(err.to_string()))
                    .await?;
                Ok(false)
            }
        }
    }

    fn backoff_delay(&self, retry_count: u32) -> Duration {
        backoff_delay(&self.config, retry_count)
    }
}

/// `base * 2^(retry_count - 1)`, capped.
fn backoff_delay(config: &ClientConfig, retry_count: u32) -> Duration {
    let shift = retry_count.saturating_sub(1).min(31);
    let multiplier = 1u32 << shift;
    config
        .retry_base_delay
        .saturating_mul(multiplier)
        .min(config.retry_max_delay)
}
