//! Server-side staged message pipeline.
//!
//! Inbound event -> PreProcess -> (spliced stages) -> Process -> Respond -> outbound messages.

pub mod backend;
pub mod context;
pub mod executor;
pub mod stage;
pub mod stages;

use std::sync::Arc;

use crate::config::PetConfig;
use crate::error::Result;

pub use backend::{AgentBackend, AgentReply, AgentRequest, EchoBackend};
pub use context::{Intent, OutboundSender, PipelineContext};
pub use executor::{ExecutionReport, PipelineExecutor};
pub use stage::{Stage, StageOutcome};

/// Build the default PreProcess -> Process -> Respond pipeline.
///
/// A non-empty `pipeline.blocked_terms` splices the content filter in after PreProcess.
pub fn build_default_pipeline(
    config: &PetConfig,
    backend: Arc<dyn AgentBackend>,
) -> Result<PipelineExecutor> {
    let executor = PipelineExecutor::new();
    executor.push(Arc::new(stages::PreProcess::new(
        config.pipeline.max_input_chars,
    )))?;
    executor.push(Arc::new(stages::Process::new(backend)))?;
    executor.push(Arc::new(stages::Respond::new(
        config.pipeline.stream_text,
        config.session.serialize_outbound,
    )))?;

    if !config.pipeline.blocked_terms.is_empty() {
        executor.insert_after(
            stages::PRE_PROCESS,
            Arc::new(stages::ContentFilter::new(&config.pipeline.blocked_terms)),
        )?;
    }
    Ok(executor)
}
