//! Reconcile live collections with descriptors: create collection, replace validator, then
//! unique, partial-unique and general indexes. Re-running on an unchanged descriptor set
//! creates nothing new.
//!
//! Not safe to run concurrently against the same database; run it once per deploy.

use crate::config::{Collation, SchemaDescriptor};
use crate::db::{index_requests, IndexRequest, SchemaAdmin};
use crate::discovery::SchemaRegistry;
use crate::error::{ConfigError, DbError, ReconcileError, ReconcileStep};
use futures_util::future::join_all;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What to do when one collection fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Stop the run at the first failing collection.
    #[default]
    FailFast,
    /// Log the failure, record it in the report and continue with the next collection.
    BestEffort,
}

impl FromStr for ReconcileMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "strict" => Ok(ReconcileMode::FailFast),
            "best-effort" | "best_effort" => Ok(ReconcileMode::BestEffort),
            _ => Err(ConfigError::Invalid {
                key: "PROVISION_MODE",
                value: s.to_string(),
            }),
        }
    }
}

/// Cooperative cancellation, checked between collections only so a collection never ends up
/// with a validator but without its indexes.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileFailure {
    pub collection: String,
    pub step: ReconcileStep,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub collections_created: usize,
    pub validators_installed: usize,
    pub indexes_created: usize,
    pub indexes_existing: usize,
    /// Only populated in best-effort mode.
    pub failures: Vec<ReconcileFailure>,
}

pub struct Reconciler<'a> {
    db: &'a dyn SchemaAdmin,
    collation: Collation,
    mode: ReconcileMode,
    cancel: Option<CancelFlag>,
}

impl<'a> Reconciler<'a> {
    pub fn new(db: &'a dyn SchemaAdmin) -> Self {
        Reconciler {
            db,
            collation: Collation::default(),
            mode: ReconcileMode::FailFast,
            cancel: None,
        }
    }

    /// Collation for collections created by this run. Existing collections keep theirs.
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    pub fn with_mode(mut self, mode: ReconcileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Discover from the registry, then reconcile. Nothing is applied if discovery fails.
    pub async fn run(&self, registry: &SchemaRegistry) -> Result<ReconcileReport, ReconcileError> {
        let descriptors = registry.descriptors()?;
        self.reconcile(&descriptors).await
    }

    pub async fn reconcile(&self, descriptors: &[SchemaDescriptor]) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        for (completed, d) in descriptors.iter().enumerate() {
            if self.cancel.as_ref().map_or(false, CancelFlag::is_cancelled) {
                tracing::warn!("[schema] cancelled after {} collection(s)", completed);
                return Err(ReconcileError::Cancelled { completed });
            }
            if let Err(e) = self.reconcile_one(d, &mut report).await {
                match (self.mode, e) {
                    (ReconcileMode::BestEffort, ReconcileError::Step { collection, step, source }) => {
                        tracing::warn!("[schema] {} - {} failed, continuing: {}", collection, step, source);
                        report.failures.push(ReconcileFailure {
                            collection,
                            step,
                            message: source.to_string(),
                        });
                    }
                    (_, e) => return Err(e),
                }
            }
        }
        tracing::info!(
            "[schema] done: {} collection(s) created, {} index(es) created, {} already present",
            report.collections_created,
            report.indexes_created,
            report.indexes_existing
        );
        Ok(report)
    }

    async fn reconcile_one(&self, d: &SchemaDescriptor, report: &mut ReconcileReport) -> Result<(), ReconcileError> {
        let name = d.collection.as_str();
        let failed = |step: ReconcileStep| {
            move |source: DbError| ReconcileError::Step {
                collection: name.to_string(),
                step,
                source,
            }
        };

        let exists = self
            .db
            .collection_exists(name)
            .await
            .map_err(failed(ReconcileStep::CreateCollection))?;
        if !exists {
            tracing::info!("[schema] {} - create collection", name);
            self.db
                .create_collection(name, &self.collation)
                .await
                .map_err(failed(ReconcileStep::CreateCollection))?;
            report.collections_created += 1;
        }

        tracing::info!("[schema] {} - update schema", name);
        self.db
            .update_validator(name, &d.schema)
            .await
            .map_err(failed(ReconcileStep::UpdateValidator))?;
        report.validators_installed += 1;

        let jobs = index_requests(d);
        for (step, req) in &jobs {
            tracing::info!("{}", progress_line(name, *step, req));
        }
        let results = join_all(
            jobs.iter()
                .map(|(step, req)| async move { (*step, self.db.create_index(name, req).await) }),
        )
        .await;

        let mut first_err = None;
        for (step, result) in results {
            match result {
                Ok(true) => report.indexes_created += 1,
                Ok(false) => report.indexes_existing += 1,
                Err(e) => {
                    tracing::error!("[schema] {} - {} failed: {}", name, step, e);
                    if first_err.is_none() {
                        first_err = Some(failed(step)(e));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Operator log line for an index step: `[schema] <collection> - <step> "<fields>"`.
/// General indexes show their directions (`customer, date desc`).
fn progress_line(collection: &str, step: ReconcileStep, req: &IndexRequest) -> String {
    let fields = match step {
        ReconcileStep::CreateIndex => req.describe(),
        _ => req.field_names().join(", "),
    };
    format!("[schema] {} - {} \"{}\"", collection, step, fields)
}

/// Reconcile with default settings: fail-fast, default collation.
pub async fn reconcile(db: &dyn SchemaAdmin, descriptors: &[SchemaDescriptor]) -> Result<ReconcileReport, ReconcileError> {
    Reconciler::new(db).reconcile(descriptors).await
}
