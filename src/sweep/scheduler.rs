//! Sweep scheduler
//!
//! Periodically scans registered documents for due records, fires their
//! handlers and writes the flipped records back, once per document per tick.
//! Delivery is at most once: a record is marked fired even when its handler
//! fails, so an unreachable target cannot retry forever. When the mark write
//! itself fails, the fired records are remembered in memory and not fired
//! again while the write keeps being retried.

use crate::SWEEP_TARGET;
use crate::notify::NotificationSink;
use crate::store::{FileStore, StoreError, StoreResult};
use crate::sweep::SweepRequest;
use crate::sweep::handler::Registration;
use crate::sweep::record::{self, DueRecord, RecordStatus};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Interval between sweeps unless configured otherwise
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How long fired records are kept unless configured otherwise
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Fired records older than this are pruned; `None` keeps them forever
    pub retention: Option<chrono::Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            retention: Some(chrono::Duration::days(DEFAULT_RETENTION_DAYS)),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub documents_scanned: usize,
    /// Due records whose handler succeeded
    pub fired: usize,
    /// Due records whose handler failed (still marked fired)
    pub failed: usize,
    /// Active records with a missing or unparseable due timestamp
    pub skipped: usize,
    /// Already fired records whose mark write is being retried
    pub deferred: usize,
    pub pruned: usize,
    pub writes: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.fired == 0
            && self.failed == 0
            && self.skipped == 0
            && self.deferred == 0
            && self.pruned == 0
    }
}

/// Runs the registered sweeps against a `FileStore`
pub struct SweepScheduler {
    store: FileStore,
    notifier: Arc<dyn NotificationSink>,
    registrations: Vec<Registration>,
    config: SweepConfig,
    /// Identities of fired records not yet marked on disk
    unpersisted: DashSet<String>,
}

impl SweepScheduler {
    pub fn new(store: FileStore, notifier: Arc<dyn NotificationSink>, config: SweepConfig) -> Self {
        Self {
            store,
            notifier,
            registrations: Vec::new(),
            config,
            unpersisted: DashSet::new(),
        }
    }

    /// Add a registration
    pub fn register(&mut self, registration: Registration) {
        self.registrations.push(registration);
    }

    #[must_use]
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.register(registration);
        self
    }

    #[must_use]
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Registered document keys in registration order, without repeats
    fn document_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for registration in &self.registrations {
            if !keys.contains(&registration.document_key.as_str()) {
                keys.push(&registration.document_key);
            }
        }
        keys
    }

    /// Run one sweep now
    pub async fn tick(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for key in self.document_keys() {
            if let Err(e) = self.sweep_document(key, now, &mut report).await {
                error!(
                    target: SWEEP_TARGET,
                    document = %key,
                    error = %e,
                    "Sweep of document failed"
                );
            }
        }

        if report.is_idle() {
            debug!(
                target: SWEEP_TARGET,
                documents = report.documents_scanned,
                "Sweep found nothing due"
            );
        } else {
            info!(
                target: SWEEP_TARGET,
                documents = report.documents_scanned,
                fired = report.fired,
                failed = report.failed,
                skipped = report.skipped,
                deferred = report.deferred,
                pruned = report.pruned,
                writes = report.writes,
                "Sweep completed"
            );
        }
        report
    }

    async fn sweep_document(
        &self,
        key: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> StoreResult<()> {
        let Some(document) = self.store.read(key).await? else {
            return Ok(());
        };
        report.documents_scanned += 1;

        let registrations: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|registration| registration.document_key == key)
            .collect();

        let mut due_records: Vec<(&Registration, DueRecord)> = Vec::new();
        let mut deferred: Vec<(&Registration, DueRecord)> = Vec::new();
        for &registration in &registrations {
            let collection_name = registration.collection.as_deref();
            let Some(collection) = record::collection(&document, collection_name) else {
                continue;
            };

            for (locator, data) in record::entries(collection) {
                match record::classify(data, &registration.due_field, now) {
                    RecordStatus::Due => {
                        let due_at =
                            record::timestamp_field(data, &registration.due_field).unwrap_or(now);
                        let due = DueRecord {
                            document_key: key.to_string(),
                            collection: registration.collection.clone(),
                            locator,
                            due_at,
                            data: data.clone(),
                        };
                        if self.unpersisted.contains(&due.identity()) {
                            deferred.push((registration, due));
                        } else {
                            due_records.push((registration, due));
                        }
                    }
                    RecordStatus::Unschedulable => {
                        report.skipped += 1;
                        warn!(
                            target: SWEEP_TARGET,
                            document = %key,
                            record = %locator,
                            due_field = %registration.due_field,
                            "Active record has no usable due timestamp"
                        );
                    }
                    RecordStatus::Pending | RecordStatus::Inactive => {}
                }
            }
        }

        for (registration, due) in &due_records {
            match registration.handler.fire(due, Arc::clone(&self.notifier)).await {
                Ok(()) => report.fired += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        target: SWEEP_TARGET,
                        document = %key,
                        record = %due.locator,
                        error = %e,
                        "Handler failed, record marked fired anyway"
                    );
                }
            }
        }

        for (_, due) in &deferred {
            debug!(
                target: SWEEP_TARGET,
                document = %key,
                record = %due.locator,
                "Record already fired, retrying its mark"
            );
        }
        report.deferred += deferred.len();
        due_records.append(&mut deferred);

        if due_records.is_empty() && self.config.retention.is_none() {
            return Ok(());
        }

        let cutoff = self.config.retention.map(|retention| now - retention);
        let updated = self
            .store
            .update::<_, StoreError, _>(key, |document| {
                let Some(document) = document.as_mut() else {
                    return Ok((0, 0));
                };

                let mut marked = 0;
                for (registration, due) in &due_records {
                    let collection_name = registration.collection.as_deref();
                    let located = record::collection_mut(document, collection_name).and_then(
                        |collection| record::locate_mut(collection, &due.locator, &due.data),
                    );
                    match located {
                        Some(fired) => {
                            record::mark_fired(fired, &registration.completed_field, now);
                            marked += 1;
                        }
                        None => {
                            warn!(
                                target: SWEEP_TARGET,
                                document = %key,
                                record = %due.locator,
                                "Record changed during the sweep, not marked"
                            );
                        }
                    }
                }

                let mut pruned = 0;
                if let Some(cutoff) = cutoff {
                    for registration in &registrations {
                        if let Some(collection) =
                            record::collection_mut(document, registration.collection.as_deref())
                        {
                            pruned += record::prune(
                                collection,
                                &registration.completed_field,
                                &registration.due_field,
                                cutoff,
                            );
                        }
                    }
                }

                Ok((marked, pruned))
            })
            .await;

        let (marked, pruned) = match updated {
            Ok(counts) => {
                for (_, due) in &due_records {
                    self.unpersisted.remove(&due.identity());
                }
                counts
            }
            Err(e) => {
                for (_, due) in &due_records {
                    self.unpersisted.insert(due.identity());
                }
                return Err(e);
            }
        };

        report.pruned += pruned;
        if marked + pruned > 0 {
            report.writes += 1;
        }
        Ok(())
    }

    /// Spawn the periodic sweep task.
    ///
    /// The first sweep runs immediately so expiries missed while offline are
    /// caught up.
    #[must_use]
    pub fn start(self) -> SweepHandle {
        let (tx, rx) = mpsc::channel::<SweepRequest>(16);
        let task = tokio::spawn(self.run(rx));
        SweepHandle { tx, task }
    }

    async fn run(self, mut rx: Receiver<SweepRequest>) {
        info!(
            target: SWEEP_TARGET,
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            registrations = self.registrations.len(),
            "Starting sweep task"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // A slow sweep pushes the next one back instead of bunching ticks
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(SweepRequest::SweepNow) => {
                        info!(target: SWEEP_TARGET, "Received request to sweep now");
                        self.tick().await;
                    }
                    Some(SweepRequest::Shutdown) | None => {
                        info!(target: SWEEP_TARGET, "Received shutdown request for sweep task");
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(target: SWEEP_TARGET, "Sweep task shut down");
    }
}

/// Control handle for a running sweep task
#[derive(Debug)]
pub struct SweepHandle {
    tx: Sender<SweepRequest>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Ask for an extra sweep. Returns `false` if the task is gone.
    pub async fn sweep_now(&self) -> bool {
        self.tx.send(SweepRequest::SweepNow).await.is_ok()
    }

    /// Stop the task after any in-flight sweep finishes
    pub async fn stop(self) {
        if self.tx.send(SweepRequest::Shutdown).await.is_err() {
            debug!(target: SWEEP_TARGET, "Sweep task already stopped");
        }
        if let Err(e) = self.task.await {
            error!(target: SWEEP_TARGET, error = %e, "Sweep task ended abnormally");
        }
    }
}
