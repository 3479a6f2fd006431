//! Model-driven stages: analysis and synthesis.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::context::{ContextAssembler, ContextInput, PriorOutput};
use pipeline::extract::{FieldKind, OutputSchema, StructuredOutputExtractor};
use pipeline::llm::{CompletionRequest, LlmProvider, StopReason};
use pipeline::stage::StageResult;
use pipeline::tokens::TokenBudgetEstimator;

use crate::handler::{summarize, ModelHandler, StageError, StageInput};

const ANALYSIS_SYSTEM: &str = "You are a research analyst. You break a question into focused \
search queries for a professional knowledge base. You answer with JSON only.";

const ANALYSIS_INSTRUCTIONS: &str = "Decompose the question into 3 to 6 focused sub-queries that together \
cover it. Respond with one JSON object:\n\
{\"summary\": \"<one sentence on how you decomposed the question>\",\n \
\"sub_queries\": [{\"query\": \"<search query>\", \"rationale\": \"<why it is needed>\"}]}";

const SYNTHESIS_SYSTEM: &str = "You are a careful research writer. You answer strictly from the evidence \
provided, cite every claim, and never invent sources. You answer with JSON only.";

const SYNTHESIS_INSTRUCTIONS: &str = "Write a sectioned Markdown answer to the question using only the evidence \
above. Use `##` headings. Every factual claim must be cited by evidence id. If repair feedback is present, \
fix every issue it lists. Respond with one JSON object:\n\
{\"answer\": \"<markdown>\",\n \"citations\": [{\"evidence_id\": \"<id from the evidence>\", \"claim\": \"<the claim it supports>\"}]}";

/// Generic model-driven stage: assemble context, call the model, extract.
pub struct ModelStage {
    llm: Arc<dyn LlmProvider>,
    estimator: TokenBudgetEstimator,
    extractor: StructuredOutputExtractor,
    system: String,
    instructions: String,
    schema: OutputSchema,
    uses_evidence: bool,
}

impl ModelStage {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        estimator: TokenBudgetEstimator,
        system: impl Into<String>,
        instructions: impl Into<String>,
        schema: OutputSchema,
    ) -> Self {
        Self {
            llm,
            estimator,
            extractor: StructuredOutputExtractor::new(),
            system: system.into(),
            instructions: instructions.into(),
            schema,
            uses_evidence: false,
        }
    }

    /// Requires retrieved evidence; with none the stage reports nothing to do
    /// instead of calling the model.
    pub fn with_evidence(mut self) -> Self {
        self.uses_evidence = true;
        self
    }

    /// Question decomposition.
    pub fn analysis(llm: Arc<dyn LlmProvider>, estimator: TokenBudgetEstimator) -> Self {
        let schema = OutputSchema::object("analysis")
            .require("sub_queries", FieldKind::Array)
            .or()
            .require("queries", FieldKind::Array);
        Self::new(llm, estimator, ANALYSIS_SYSTEM, ANALYSIS_INSTRUCTIONS, schema)
    }

    /// Cited answer synthesis.
    pub fn synthesis(llm: Arc<dyn LlmProvider>, estimator: TokenBudgetEstimator) -> Self {
        let schema = OutputSchema::object("answer")
            .require("answer", FieldKind::String)
            .or()
            .require("sections", FieldKind::Array);
        Self::new(llm, estimator, SYNTHESIS_SYSTEM, SYNTHESIS_INSTRUCTIONS, schema).with_evidence()
    }
}

#[async_trait]
impl ModelHandler for ModelStage {
    #[tracing::instrument(skip_all, fields(stage = %input.stage.name, iteration = input.iteration))]
    async fn execute(&self, input: &StageInput<'_>) -> Result<StageResult, StageError> {
        let evidence = if self.uses_evidence { input.evidence() } else { Vec::new() };
        if self.uses_evidence && evidence.is_empty() {
            tracing::info!("no evidence available; skipping the model call");
            return Ok(StageResult::nothing_to_do("no evidence was retrieved"));
        }

        let requested = input.stage.output_budget;
        let fixed = self.estimator.estimate(&self.system) + self.estimator.estimate(&self.instructions);
        let context_budget = self.estimator.prompt_allowance(requested).saturating_sub(fixed);
        let prior = input
            .pipeline
            .stages()
            .iter()
            .filter(|s| s.id < input.stage.id)
            .filter_map(|s| {
                let result = input.prior.get(&s.id)?;
                (!result.summary.is_empty()).then(|| PriorOutput {
                    stage: s.name.as_str(),
                    content: result.summary.clone(),
                })
            })
            .collect();
        let context = ContextAssembler::new(context_budget).assemble(&ContextInput {
            question: input.question,
            guidance: input.guidance,
            prior,
            evidence: &evidence,
            follow_up: input.follow_up,
            repair_feedback: input.repair_feedback,
        });
        let prompt = format!("{}\n{}", context.text, self.instructions);

        let prompt_tokens = self.estimator.estimate(&self.system) + self.estimator.estimate(&prompt);
        let ceiling = self
            .estimator
            .output_ceiling(prompt_tokens, requested)
            .map_err(|source| StageError::Budget {
                stage: input.stage.name.clone(),
                source,
            })?;
        tracing::debug!(prompt_tokens = %prompt_tokens, ceiling = %ceiling, "calling model");

        let completion = self
            .llm
            .complete(CompletionRequest {
                stage: input.stage.name.clone(),
                system: self.system.clone(),
                prompt,
                max_output_tokens: ceiling,
            })
            .await
            .map_err(|source| StageError::Llm {
                stage: input.stage.name.clone(),
                source,
            })?;
        if completion.stop_reason == StopReason::MaxTokens {
            tracing::warn!(ceiling = %ceiling, "model stopped at the output ceiling");
        }

        match self.extractor.extract_with_usage(
            &completion.text,
            &self.schema,
            completion.usage.output_tokens,
            ceiling,
        ) {
            Ok(extraction) => {
                tracing::debug!(strategy = %extraction.strategy, "structured output extracted");
                let summary = summarize(input.stage.output, &extraction.value);
                Ok(StageResult::executed(completion.text, extraction.value, completion.usage, summary))
            }
            Err(failure) => {
                tracing::warn!(error = %failure, "stage output is malformed; continuing degraded");
                Ok(StageResult::degraded(completion.text, completion.usage, failure.diagnostic()))
            }
        }
    }
}
