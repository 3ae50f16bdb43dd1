//! The three-phase startup sequence.
//!
//! LoadLocal → DrainQueue → Sync. Each phase may fail without aborting
//! the later ones; whatever went wrong is aggregated into the
//! completion event.

use std::sync::Arc;
use std::time::Instant;

use minote_core::event::StartupEvent;
use minote_util_error::FmtCompact as _;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::id_map::IdMappingRegistry;
use crate::online::OnlineState;
use crate::processor::OperationProcessor;
use crate::queue::OperationQueue;
use crate::store::NoteStore;
use crate::sync::SyncEngine;

const LOG_TARGET: &str = "minote::startup";

#[derive(Clone, Debug)]
pub struct StartupReport {
    pub success: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct StartupSequencer {
    store: Arc<NoteStore>,
    registry: Arc<IdMappingRegistry>,
    queue: Arc<OperationQueue>,
    processor: Arc<OperationProcessor>,
    engine: Arc<SyncEngine>,
    online: Arc<OnlineState>,
    bus: Arc<EventBus>,
}

impl StartupSequencer {
    pub fn new(
        store: Arc<NoteStore>,
        registry: Arc<IdMappingRegistry>,
        queue: Arc<OperationQueue>,
        processor: Arc<OperationProcessor>,
        engine: Arc<SyncEngine>,
        online: Arc<OnlineState>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            processor,
            engine,
            online,
            bus,
        }
    }

    pub async fn run(&self) -> StartupReport {
        let started = Instant::now();
        let mut errors = vec![];

        // Phase 1: local state. Mapping recovery runs here so that any
        // interrupted id cutover is finished before the queue drains.
        if let Err(err) = self.store.load_caches().await {
            errors.push(format!("load local: {}", err.fmt_compact()));
        }
        if let Err(err) = self.registry.load().await {
            errors.push(format!("load mappings: {}", err.fmt_compact()));
        }
        match self.registry.recover_incomplete_mappings().await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(target: LOG_TARGET, recovered, "Recovered incomplete id mappings")
            }
            Err(err) => errors.push(format!("recover mappings: {}", err.fmt_compact())),
        }
        // Fully rewritten aliases are garbage now.
        if let Err(err) = self.registry.gc_completed().await {
            errors.push(format!("gc mappings: {}", err.fmt_compact()));
        }

        // Phase 2: pending work, but only if it can actually go out.
        match self.queue.pending_operations().await {
            Ok(pending) if !pending.is_empty() => {
                if self.online.is_online() {
                    if let Err(err) = self.processor.process_queue().await {
                        errors.push(format!("drain queue: {}", err.fmt_compact()));
                    }
                } else {
                    info!(
                        target: LOG_TARGET,
                        pending = pending.len(),
                        "Offline; keeping queued operations for later"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => errors.push(format!("read queue: {}", err.fmt_compact())),
        }

        // Phase 3: pull, if we are authenticated and online.
        if self.online.is_online() {
            if let Err(err) = self.engine.smart_sync().await {
                errors.push(format!("sync: {}", err.fmt_compact()));
            }
        }

        let report = StartupReport {
            success: errors.is_empty(),
            errors: errors.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if report.success {
            info!(target: LOG_TARGET, duration_ms = report.duration_ms, "Startup completed");
        } else {
            warn!(
                target: LOG_TARGET,
                duration_ms = report.duration_ms,
                errors = ?report.errors,
                "Startup completed with errors"
            );
        }

        self.bus.publish_startup(StartupEvent::Completed {
            success: report.success,
            errors,
            duration_ms: report.duration_ms,
        });
        report
    }
}
