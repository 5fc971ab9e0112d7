//! The single capability every pipeline stage implements.

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::context::PipelineContext;

/// What the executor should do after a stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Run the next stage.
    Continue,
    /// Stop this context here; no further stages run and nothing more is sent.
    Halt,
}

/// One named unit of server-side message processing.
///
/// Stages may suspend on external calls. An `Err` return is caught at the
/// executor boundary and ends the context the same way as [`StageOutcome::Halt`].
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable name used for splicing (`insert_before` / `insert_after` / `remove_stage`).
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StageOutcome>;
}
