//! Dispatch of one stage to its registered handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipeline::llm::LlmProvider;
use pipeline::stage::{PipelineDefinition, StageResult};
use pipeline::tokens::TokenBudgetEstimator;
use pipeline::tools::ToolBridge;
use pipeline::{PipelineError, StageId};

use crate::handler::{Handler, StageError, StageInput};
use crate::handlers::{CalibrationStage, ModelStage, RenderStage, ResearchTools, RetrievalStage, VerificationStage};

/// Handler registry keyed by stage ordinal.
#[derive(Debug, Clone, Default)]
pub struct StageExecutor {
    handlers: BTreeMap<StageId, Handler>,
}

impl StageExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `stage`, replacing any earlier registration.
    pub fn register(mut self, stage: StageId, handler: Handler) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    /// Handlers for [`PipelineDefinition::research`].
    pub fn research(llm: Arc<dyn LlmProvider>, estimator: TokenBudgetEstimator, tools: &ResearchTools) -> Self {
        Self::new()
            .register(StageId::new(0), Handler::Model(Arc::new(ModelStage::analysis(llm.clone(), estimator))))
            .register(
                StageId::new(1),
                Handler::Tool(Arc::new(CalibrationStage::new(
                    tools.web_search.clone(),
                    tools.web_results_per_query,
                ))),
            )
            .register(
                StageId::new(2),
                Handler::Tool(Arc::new(RetrievalStage::new(
                    tools.hybrid_search.clone(),
                    tools.search_results_per_query,
                    tools.evidence_cap,
                ))),
            )
            .register(StageId::new(3), Handler::Model(Arc::new(ModelStage::synthesis(llm, estimator))))
            .register(
                StageId::new(4),
                Handler::Tool(Arc::new(VerificationStage::new(tools.citation_verify.clone()))),
            )
            .register(StageId::new(5), Handler::Pure(Arc::new(RenderStage::new())))
    }

    /// Checks that every stage of `definition` has a handler of its declared kind.
    pub fn validate(&self, definition: &PipelineDefinition) -> Result<(), PipelineError> {
        for stage in definition.stages() {
            match self.handlers.get(&stage.id) {
                None => {
                    return Err(PipelineError::config(format!(
                        "stage {} ('{}') has no handler",
                        stage.id, stage.name
                    )))
                }
                Some(handler) if handler.kind() != stage.kind => {
                    return Err(PipelineError::config(format!(
                        "stage '{}' is declared {:?} but its handler is {:?}",
                        stage.name,
                        stage.kind,
                        handler.kind()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Runs the handler for `input.stage`.
    pub async fn execute(&self, input: &StageInput<'_>, tools: &ToolBridge) -> Result<StageResult, StageError> {
        let handler = self
            .handlers
            .get(&input.stage.id)
            .ok_or(StageError::MissingHandler { stage: input.stage.id })?;
        if handler.kind() != input.stage.kind {
            return Err(StageError::KindMismatch {
                stage: input.stage.name.clone(),
                declared: input.stage.kind,
                actual: handler.kind(),
            });
        }
        match handler {
            Handler::Model(h) => h.execute(input).await,
            Handler::Tool(h) => h.execute(input, tools).await,
            Handler::Pure(h) => Ok(h.execute(input)),
        }
    }
}
