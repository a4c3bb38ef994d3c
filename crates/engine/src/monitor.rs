//! The periodic driver: region fetch, freeze write-back, parallel property
//! evaluation, snapshot diffing, and the batch-request processor.
use crate::constants::FAILURE_LOG_CADENCE;
use crate::engine::EngineInner;
use crate::mapping::LoadedMapping;
use crate::property::{self, EvalOutcome, ValidationEvent};
use crate::utils::now_ms;
use futures::StreamExt;
use retrocmd::TransportError;
use shared::Value;
use shared::event::{ChangeEvent, ChangeSource};
use shared::rpc::{BatchOpResult, BatchOutcome};
use shared::BatchOperation;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

pub(crate) struct BatchJob {
    pub ops: Vec<BatchOperation>,
    pub atomic: bool,
    pub reply: oneshot::Sender<BatchOutcome>,
}

/// The ≈60 Hz monitor loop. Runs until the shutdown signal fires.
pub(crate) async fn run(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(inner.options.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_write_back: Option<Instant> = None;
    let mut last_probe: Option<Instant> = None;
    let mut failure_streak: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = tick.tick() => {}
        }

        let Some(loaded) = inner.current() else {
            continue;
        };

        let regions = loaded.mapping.platform.fetch_list();
        match inner.transport.read_regions(&regions).await {
            Ok(blocks) => {
                if failure_streak > 0 {
                    tracing::info!(failures = failure_streak, "emulator connectivity restored");
                    inner.bus.publish(&ChangeEvent::ConnectionRestored {
                        failures: failure_streak,
                        timestamp_ms: now_ms(),
                    });
                    failure_streak = 0;
                }
                inner.store.update(blocks);
            }
            Err(TransportError::Cancelled) => break,
            Err(err) => {
                failure_streak += 1;
                if failure_streak == 1 || failure_streak % FAILURE_LOG_CADENCE == 0 {
                    tracing::warn!(error = %err, streak = failure_streak, "region fetch failed");
                }
                let probe_due = last_probe
                    .is_none_or(|t| t.elapsed() >= inner.options.probe_interval);
                if probe_due {
                    last_probe = Some(Instant::now());
                    probe(&inner).await;
                }
                continue;
            }
        }

        let write_back_due = last_write_back
            .is_none_or(|t| t.elapsed() >= inner.options.write_back_interval);
        if write_back_due {
            last_write_back = Some(Instant::now());
            write_back(&inner, &loaded).await;
        }

        evaluate_tick(&inner, &loaded).await;
    }
    tracing::debug!("monitor stopped");
}

/// Low-cadence recoverability check while the emulator is unreachable.
async fn probe(inner: &Arc<EngineInner>) {
    let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(2);
    match Retry::spawn(strategy, || inner.transport.probe()).await {
        Ok(()) => tracing::debug!("connection probe answered"),
        Err(err) => tracing::debug!(error = %err, "connection probe failed"),
    }
}

/// Reaps expired freezes and re-pushes live entries to the emulator, so
/// frozen bytes converge even against writes between two store updates.
async fn write_back(inner: &Arc<EngineInner>, loaded: &Arc<LoadedMapping>) {
    let now = now_ms();
    for addr in inner.freeze.cleanup_expired(now) {
        if let Some(name) = inner.property_name_at(loaded, addr) {
            inner.bus.publish(&ChangeEvent::PropertyFreezeChanged {
                name,
                frozen: false,
                timestamp_ms: now_ms(),
            });
        }
    }
    for (addr, bytes) in inner.freeze.write_back_targets(now) {
        if let Err(err) = inner.transport.write_bytes(addr, &bytes).await {
            tracing::trace!(addr, error = %err, "freeze write-back failed");
        }
    }
}

/// Evaluates every property (bounded pool) and computed node (dependency
/// order), then diffs against the last snapshot in property-name order.
async fn evaluate_tick(inner: &Arc<EngineInner>, loaded: &Arc<LoadedMapping>) {
    let names: Vec<String> = loaded.mapping.properties.keys().cloned().collect();
    let pool = inner.options.worker_pool.max(1);

    let evaluated: Vec<(String, Option<EvalOutcome>)> = futures::stream::iter(names)
        .map(|name| {
            let inner = inner.clone();
            let loaded = loaded.clone();
            async move {
                let task = tokio::task::spawn_blocking(move || {
                    let ctx = inner.property_ctx(&loaded);
                    let outcome = property::evaluate(&ctx, &name);
                    (name, outcome)
                });
                match task.await {
                    Ok((name, Ok(outcome))) => (name, Some(outcome)),
                    Ok((name, Err(err))) => {
                        tracing::debug!(property = %name, error = %err, "evaluation failed");
                        (name, None)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "evaluation worker panicked");
                        (String::new(), None)
                    }
                }
            }
        })
        .buffer_unordered(pool)
        .collect()
        .await;

    let mut tick_values: Vec<(String, Value, Vec<ValidationEvent>)> = evaluated
        .into_iter()
        .filter_map(|(name, outcome)| outcome.map(|o| (name, o.value, o.events)))
        .collect();

    // Computed nodes see this tick's property values plus the constants.
    let mut scope: HashMap<String, Value> = loaded
        .mapping
        .constants
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (name, value, _) in &tick_values {
        scope.insert(name.clone(), value.clone());
    }
    let ctx = inner.property_ctx(loaded);
    for name in &loaded.computed_order {
        match property::evaluate_computed_with(&ctx, name, &scope) {
            Ok(outcome) => {
                scope.insert(name.clone(), outcome.value.clone());
                tick_values.push((name.clone(), outcome.value, outcome.events));
            }
            Err(err) => {
                tracing::debug!(computed = %name, error = %err, "evaluation failed");
            }
        }
    }

    // A reload between fetch and emit would make these values stale; the
    // snapshot was cleared with the swap, so drop the whole tick.
    {
        let current = inner.loaded.read().unwrap();
        match current.as_ref() {
            Some(now_loaded) if Arc::ptr_eq(now_loaded, loaded) => {}
            _ => return,
        }
    }

    tick_values.sort_by(|a, b| a.0.cmp(&b.0));
    let now = now_ms();
    for (name, value, events) in tick_values {
        inner.publish_validation_events(loaded, &name, &events);
        let old_value = {
            let mut snapshot = inner.snapshot.write().unwrap();
            let old = snapshot.get(&name).cloned();
            if old.as_ref() != Some(&value) {
                snapshot.insert(name.clone(), value.clone());
            }
            old
        };
        if old_value.as_ref() != Some(&value) {
            inner.bus.publish(&ChangeEvent::PropertyChanged {
                name,
                old_value,
                new_value: value,
                timestamp_ms: now,
                source: ChangeSource::Monitor,
            });
        }
    }
}

/// Consumes queued batch jobs until shutdown.
pub(crate) async fn batch_loop(
    inner: Arc<EngineInner>,
    mut jobs: mpsc::Receiver<BatchJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            job = jobs.recv() => {
                let Some(job) = job else { break };
                job
            }
        };

        let total = job.ops.len();
        let outcome = match timeout(
            inner.options.batch_timeout,
            process_batch(&inner, &job.ops, job.atomic),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => timed_out_outcome(&job.ops),
        };

        inner.bus.publish(&ChangeEvent::BatchCompleted {
            results: outcome.results.clone(),
            success_count: outcome.success_count,
            total,
            timestamp_ms: now_ms(),
        });
        let _ = job.reply.send(outcome);
    }
    tracing::debug!("batch processor stopped");
}

/// Applies operations in order. Atomic batches stop at the first failure;
/// nothing already applied is rolled back.
async fn process_batch(
    inner: &Arc<EngineInner>,
    ops: &[BatchOperation],
    atomic: bool,
) -> BatchOutcome {
    let mut results = Vec::with_capacity(ops.len());
    let mut failed = false;
    for op in ops {
        if atomic && failed {
            results.push(BatchOpResult {
                property: op.property().to_string(),
                operation: op.verb().to_string(),
                success: false,
                error: Some("skipped after earlier failure".to_string()),
                applied: false,
            });
            continue;
        }
        let result = apply_op(inner, op).await;
        match result {
            Ok(()) => results.push(BatchOpResult {
                property: op.property().to_string(),
                operation: op.verb().to_string(),
                success: true,
                error: None,
                applied: true,
            }),
            Err(err) => {
                failed = true;
                results.push(BatchOpResult {
                    property: op.property().to_string(),
                    operation: op.verb().to_string(),
                    success: false,
                    error: Some(err.to_string()),
                    applied: false,
                });
            }
        }
    }
    let success_count = results.iter().filter(|r| r.success).count();
    BatchOutcome {
        results,
        success_count,
        total: ops.len(),
    }
}

async fn apply_op(
    inner: &Arc<EngineInner>,
    op: &BatchOperation,
) -> Result<(), crate::engine::EngineError> {
    match op {
        BatchOperation::SetValue { property, value } => {
            inner.set_property_value(property, value.clone()).await
        }
        BatchOperation::SetBytes { property, bytes } => {
            inner.set_property_bytes(property, bytes.clone()).await
        }
        BatchOperation::Freeze { property } => inner.freeze_property(property, true).await,
        BatchOperation::Unfreeze { property } => inner.freeze_property(property, false).await,
    }
}

fn timed_out_outcome(ops: &[BatchOperation]) -> BatchOutcome {
    BatchOutcome {
        results: ops
            .iter()
            .map(|op| BatchOpResult {
                property: op.property().to_string(),
                operation: op.verb().to_string(),
                success: false,
                error: Some("batch timed out".to_string()),
                applied: false,
            })
            .collect(),
        success_count: 0,
        total: ops.len(),
    }
}
