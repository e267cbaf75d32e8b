//! Background reconciliation of unresolved orders.
//!
//! [`Reconciler`] runs one pass: it drains the unresolved backlog in bounded
//! batches, asks the oracle about every order and commits each batch's
//! status updates together with the owners' credits. [`Scheduler`] owns the
//! timer loop that runs a pass on every tick until it is cancelled.

use crate::error::{LedgerError, Result};
use crate::money::Points;
use crate::oracle::{AccrualOracle, Outcome};
use crate::order::Resolution;
use crate::storage::{OrderStore, Resolutions};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Batches committed.
    pub batches: usize,

    /// Orders that became `Processed`.
    pub processed: usize,

    /// Orders that became `Invalid`.
    pub invalid: usize,

    /// Orders the oracle is still working on.
    pub pending: usize,

    /// Orders left untouched because the oracle call failed or was undefined.
    pub skipped: usize,

    /// Total points credited.
    pub credited: Points,
}

impl PassSummary {
    /// Returns `true` if the pass saw no orders at all.
    pub fn is_idle(&self) -> bool {
        self.processed + self.invalid + self.pending + self.skipped == 0
    }

    fn absorb(&mut self, other: PassSummary) {
        self.batches += other.batches;
        self.processed += other.processed;
        self.invalid += other.invalid;
        self.pending += other.pending;
        self.skipped += other.skipped;
        self.credited = self.credited.saturating_add(other.credited);
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} batch(es), {} processed, {} invalid, {} pending, {} skipped, {} credited",
            self.batches, self.processed, self.invalid, self.pending, self.skipped, self.credited
        )
    }
}

/// Result of reconciling a single batch.
struct BatchReport {
    fetched: usize,
    summary: PassSummary,
}

impl BatchReport {
    /// Orders of the batch that are still `New` or `Processing`.
    fn unresolved(&self) -> usize {
        self.summary.pending + self.summary.skipped
    }
}

/// Runs reconciliation passes against a store and an oracle.
pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    oracle: Arc<dyn AccrualOracle>,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OrderStore>, oracle: Arc<dyn AccrualOracle>, batch_size: usize) -> Self {
        Reconciler {
            store,
            oracle,
            batch_size: batch_size.max(1),
        }
    }

    /// Drains the unresolved backlog once.
    ///
    /// Stops at the first short batch, on a store error, or when `cancel`
    /// fires between batches. Store errors are logged, never returned: the
    /// next pass simply starts over.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> PassSummary {
        let mut summary = PassSummary::default();
        // Resolved orders leave the backlog, so only the ones still
        // unresolved move the window forward.
        let mut offset = 0;

        loop {
            if cancel.is_cancelled() {
                debug!("Reconciliation cancelled before offset {}", offset);
                break;
            }

            match self.reconcile_batch(offset).await {
                Ok(report) => {
                    let fetched = report.fetched;
                    let unresolved = report.unresolved();
                    summary.absorb(report.summary);

                    if fetched < self.batch_size {
                        break;
                    }
                    offset += unresolved;
                }
                Err(e) => {
                    error!("Reconciliation pass stopped at offset {}: {}", offset, e);
                    break;
                }
            }
        }

        summary
    }

    async fn reconcile_batch(&self, offset: usize) -> Result<BatchReport> {
        let mut batch = self
            .store
            .fetch_unresolved_batch(offset, self.batch_size)
            .await?;
        let orders = batch.orders().to_vec();
        let mut report = BatchReport {
            fetched: orders.len(),
            summary: PassSummary::default(),
        };
        if orders.is_empty() {
            return Ok(report);
        }

        let mut resolutions = Resolutions::new();
        let mut credits: BTreeMap<String, Points> = BTreeMap::new();

        for order in &orders {
            let reply = match self.oracle.resolve(order.number).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("Failed to resolve order {}: {}", order.number, e);
                    report.summary.skipped += 1;
                    continue;
                }
            };

            match reply.outcome {
                Outcome::Completed => match Points::from_decimal(reply.accrual) {
                    Ok(accrual) => {
                        let owed = credits.get(&order.owner).copied().unwrap_or_default();
                        let Some(total) = owed.checked_add(accrual) else {
                            warn!(
                                "Order {} left unresolved: accrual {} overflows the batch credit for {}",
                                order.number, accrual, order.owner
                            );
                            report.summary.skipped += 1;
                            continue;
                        };
                        debug!("Order {} processed, accrual {}", order.number, accrual);
                        resolutions.insert(order.number, Resolution::processed(accrual));
                        credits.insert(order.owner.clone(), total);
                        report.summary.processed += 1;
                    }
                    Err(e) => {
                        warn!("Order {} has an unusable accrual: {}", order.number, e);
                        report.summary.skipped += 1;
                    }
                },
                Outcome::Failed => {
                    debug!("Order {} rejected by the oracle", order.number);
                    resolutions.insert(order.number, Resolution::invalid());
                    report.summary.invalid += 1;
                }
                Outcome::InProgress => {
                    resolutions.insert(order.number, Resolution::processing());
                    report.summary.pending += 1;
                }
                Outcome::Undefined => {
                    warn!(
                        "Order {} left unresolved: {}",
                        order.number,
                        LedgerError::OracleUndefinedStatus(reply.status)
                    );
                    report.summary.skipped += 1;
                }
            }
        }

        batch.apply_resolutions(&resolutions).await?;
        for (owner, amount) in &credits {
            if amount.is_zero() {
                continue;
            }
            batch.credit_available(owner, *amount).await?;
            report.summary.credited = report.summary.credited.saturating_add(*amount);
        }
        batch.commit().await?;

        report.summary.batches = 1;
        Ok(report)
    }
}

/// Owns the periodic reconciliation loop.
///
/// The loop is started at most once per `Scheduler`; a second `start` fails
/// with `AlreadyRunning`, even after `stop`.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    started: bool,
}

impl Scheduler {
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        Scheduler {
            reconciler: Arc::new(reconciler),
            interval,
            cancel: CancellationToken::new(),
            handle: None,
            started: false,
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Spawns the loop on its own task. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(LedgerError::AlreadyRunning);
        }
        self.started = true;

        let reconciler = Arc::clone(&self.reconciler);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            run_loop(reconciler, interval, cancel).await;
        }));
        Ok(())
    }

    /// Cancels the loop and waits for the in-flight batch to finish.
    pub async fn stop(&mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(LedgerError::NotRunning)?;
        self.cancel.cancel();
        if let Err(e) = handle.await {
            error!("Reconciliation task join failed: {}", e);
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(reconciler: Arc<Reconciler>, period: Duration, cancel: CancellationToken) {
    info!("Reconciliation scheduler starting, interval {:?}", period);

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let summary = reconciler.run_pass(&cancel).await;
                if summary.is_idle() {
                    debug!("Reconciliation pass found nothing to do");
                } else {
                    info!("Reconciliation pass finished: {}", summary);
                }
            }
        }
    }

    info!("Reconciliation scheduler stopped");
}
