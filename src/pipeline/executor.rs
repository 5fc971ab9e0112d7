//! Ordered, editable stage list and the per-context execution loop.
//!
//! The stage list is copy-on-write: edits swap in a new list, and every
//! execution runs against the snapshot it took when it started. There is
//! no lock held across stages, so contexts of different sessions (and
//! different messages of the same session) proceed concurrently.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{PetError, Result};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageOutcome};

type StageList = Arc<Vec<Arc<dyn Stage>>>;

/// What happened to one context.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Stages that ran to completion, in order (including a halting stage).
    pub ran: Vec<String>,
    /// Stage that returned [`StageOutcome::Halt`], if any.
    pub halted_by: Option<String>,
    /// Stage failure caught at the executor boundary, if any.
    pub failed: Option<PetError>,
}

impl ExecutionReport {
    /// True when every stage ran and none halted or failed.
    pub fn completed(&self) -> bool {
        self.halted_by.is_none() && self.failed.is_none()
    }
}

/// Runs inbound messages through an ordered list of named stages.
pub struct PipelineExecutor {
    stages: RwLock<StageList>,
}

impl PipelineExecutor {
    /// Create an executor with no stages.
    pub fn new() -> Self {
        Self {
            stages: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Append a stage at the end of the list.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage with the same name is already registered.
    pub fn push(&self, stage: Arc<dyn Stage>) -> Result<()> {
        self.edit(|stages| {
            ensure_unique(stages, stage.name())?;
            stages.push(stage);
            Ok(())
        })
    }

    /// Insert `stage` immediately before the stage named `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `anchor` is not registered or the name is taken.
    pub fn insert_before(&self, anchor: &str, stage: Arc<dyn Stage>) -> Result<()> {
        self.edit(|stages| {
            ensure_unique(stages, stage.name())?;
            let index = position_of(stages, anchor)?;
            stages.insert(index, stage);
            Ok(())
        })
    }

    /// Insert `stage` immediately after the stage named `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `anchor` is not registered or the name is taken.
    pub fn insert_after(&self, anchor: &str, stage: Arc<dyn Stage>) -> Result<()> {
        self.edit(|stages| {
            ensure_unique(stages, stage.name())?;
            let index = position_of(stages, anchor)?;
            stages.insert(index + 1, stage);
            Ok(())
        })
    }

    /// Remove the stage named `name`, returning it.
    ///
    /// # Errors
    ///
    /// Returns an error if no stage has that name.
    pub fn remove_stage(&self, name: &str) -> Result<Arc<dyn Stage>> {
        self.edit(|stages| {
            let index = position_of(stages, name)?;
            Ok(stages.remove(index))
        })
    }

    /// Stage names in execution order.
    pub fn list_stage_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|stage| stage.name().to_owned())
            .collect()
    }

    /// The stage list as it stands right now.
    fn snapshot(&self) -> StageList {
        Arc::clone(&self.stages.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn edit<T>(&self, f: impl FnOnce(&mut Vec<Arc<dyn Stage>>) -> Result<T>) -> Result<T> {
        let mut guard = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Arc<dyn Stage>> = guard.as_ref().clone();
        let out = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Run `ctx` through every stage of the current snapshot.
    ///
    /// Never returns an error: failures and panics inside a stage are
    /// logged, recorded in the report, and end only this context.
    pub async fn execute(&self, mut ctx: PipelineContext) -> ExecutionReport {
        let stages = self.snapshot();
        let mut report = ExecutionReport::default();
        let session = ctx.session.key().to_owned();
        let arrival = ctx.arrival();

        for stage in stages.iter() {
            let name = stage.name();
            let outcome = AssertUnwindSafe(stage.run(&mut ctx)).catch_unwind().await;
            match outcome {
                Ok(Ok(StageOutcome::Continue)) => {
                    report.ran.push(name.to_owned());
                }
                Ok(Ok(StageOutcome::Halt)) => {
                    report.ran.push(name.to_owned());
                    report.halted_by = Some(name.to_owned());
                    info!(%session, arrival, stage = name, "pipeline halted");
                    break;
                }
                Ok(Err(e)) => {
                    error!(%session, arrival, stage = name, error = %e, "stage failed");
                    report.failed = Some(match e {
                        PetError::Stage { .. } => e,
                        other => PetError::stage(name, other.to_string()),
                    });
                    break;
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(%session, arrival, stage = name, %message, "stage panicked");
                    report.failed = Some(PetError::stage(name, format!("panicked: {message}")));
                    break;
                }
            }
        }

        debug!(%session, arrival, ran = ?report.ran, "pipeline finished");
        report
    }

    /// Run `ctx` on its own task so the caller can keep accepting messages.
    pub fn spawn_execute(self: &Arc<Self>, ctx: PipelineContext) -> JoinHandle<ExecutionReport> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.execute(ctx).await })
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn position_of(stages: &[Arc<dyn Stage>], name: &str) -> Result<usize> {
    stages
        .iter()
        .position(|stage| stage.name() == name)
        .ok_or_else(|| PetError::Pipeline(format!("no stage named '{name}'")))
}

fn ensure_unique(stages: &[Arc<dyn Stage>], name: &str) -> Result<()> {
    if stages.iter().any(|stage| stage.name() == name) {
        return Err(PetError::Pipeline(format!(
            "a stage named '{name}' is already registered"
        )));
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
