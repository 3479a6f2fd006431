//! Scripted fakes for orchestrator tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nodes::{OrchestratorSettings, PipelineOrchestrator, RecordingObserver, ResearchTools, StageExecutor, ToolLifecycleManager};
use pipeline::cost::ModelPricing;
use pipeline::lifecycle::LifecycleEvent;
use pipeline::llm::{Completion, CompletionRequest, LlmError, LlmProvider, StopReason};
use pipeline::tokens::TokenBudgetEstimator;
use pipeline::tools::{ConnectionParams, ToolChannel, ToolConnector, ToolEnvelope, ToolError};
use pipeline::{AgentSlug, CostBudget, TokenCount, ToolName, Usage};
use serde_json::{json, Value};
use store::MemoryStateStore;

pub const AGENT: &str = "field-engineer";

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// Replies per stage name, served in order; the last reply repeats.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<HashMap<String, Vec<Result<String, LlmError>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    /// Replaces the script for `stage`.
    pub fn script(&self, stage: &str, replies: Vec<Result<String, LlmError>>) {
        assert!(!replies.is_empty());
        self.replies.lock().unwrap().insert(stage.to_string(), replies);
    }

    pub fn reply(&self, stage: &str, text: impl Into<String>) {
        self.script(stage, vec![Ok(text.into())]);
    }

    pub fn fail(&self, stage: &str, error: LlmError) {
        self.script(stage, vec![Err(error)]);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: &str) -> usize {
        self.requests().iter().filter(|r| r.stage == stage).count()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let stage = request.stage.clone();
        self.requests.lock().unwrap().push(request);
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(&stage).unwrap_or_else(|| panic!("no reply scripted for '{stage}'"));
        let reply = if queue.len() > 1 { queue.remove(0) } else { queue[0].clone() };
        reply.map(|text| Completion {
            text,
            usage: Usage::new(1_000, 500),
            stop_reason: StopReason::EndTurn,
        })
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Envelopes per tool, served in order; the last envelope repeats.
#[derive(Default)]
pub struct FakeChannel {
    responses: Mutex<HashMap<String, Vec<ToolEnvelope>>>,
    calls: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
}

impl FakeChannel {
    /// Replaces the script for `tool` with `payloads`, in order.
    pub fn script(&self, tool: &str, payloads: Vec<Value>) {
        assert!(!payloads.is_empty());
        let envelopes = payloads.iter().map(ToolEnvelope::json).collect();
        self.responses.lock().unwrap().insert(tool.to_string(), envelopes);
    }

    pub fn respond(&self, tool: &str, payload: Value) {
        self.script(tool, vec![payload]);
    }

    pub fn respond_error(&self, tool: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(tool.to_string(), vec![ToolEnvelope::error(message)]);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<Value> {
        self.calls().into_iter().filter(|(t, _)| t == tool).map(|(_, args)| args).collect()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolChannel for FakeChannel {
    async fn call_tool(&self, tool: &ToolName, args: Value) -> Result<ToolEnvelope, ToolError> {
        self.calls.lock().unwrap().push((tool.to_string(), args));
        let mut responses = self.responses.lock().unwrap();
        let Some(queue) = responses.get_mut(tool.as_str()) else {
            return Err(ToolError::Transport {
                tool: tool.clone(),
                message: "unknown tool".to_string(),
            });
        };
        Ok(if queue.len() > 1 { queue.remove(0) } else { queue[0].clone() })
    }

    async fn close(&self) -> Result<(), ToolError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the shared [`FakeChannel`], or refuses when `refuse` is set.
#[derive(Default)]
pub struct FakeConnector {
    pub channel: Arc<FakeChannel>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolConnector for FakeConnector {
    async fn connect(&self, _params: &ConnectionParams) -> Result<Arc<dyn ToolChannel>, ToolError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ToolError::Connection {
                message: "connection refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.channel.clone())
    }
}

// ---------------------------------------------------------------------------
// Canned payloads
// ---------------------------------------------------------------------------

pub fn analysis_reply(queries: &[&str]) -> String {
    let sub_queries: Vec<Value> = queries.iter().map(|q| json!({"query": q, "rationale": "needed"})).collect();
    format!(
        "Here is the plan:\n```json\n{}\n```",
        json!({"summary": "Split by equipment and schedule.", "sub_queries": sub_queries})
    )
}

pub fn synthesis_reply(cited: &[&str]) -> String {
    let citations: Vec<Value> = cited
        .iter()
        .map(|id| json!({"evidence_id": id, "claim": format!("claim backed by {id}")}))
        .collect();
    json!({
        "answer": "## Maintenance\nPumps are serviced quarterly.\n\n## Records\nLogs are kept for five years.",
        "citations": citations,
    })
    .to_string()
}

pub fn web_results() -> Value {
    json!({
        "results": [{"title": "Pump guide", "url": "https://example.org/pumps", "description": "Quarterly service"}],
        "analysis_hints": ["prefer 'centrifugal pump'"],
        "warnings": [],
    })
}

pub fn search_results(ids: &[&str]) -> Value {
    let results: Vec<Value> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            json!({
                "id": id,
                "paragraph_ref": format!("Manual {}", i + 1),
                "content": format!("Paragraph {id} about pump maintenance."),
                "confidence": 0.9 - i as f64 * 0.1,
            })
        })
        .collect();
    json!({ "results": results })
}

pub fn verification_passed() -> Value {
    json!({"passed": true, "score": 1.0, "details": []})
}

pub fn verification_failed() -> Value {
    verification_scored(0.4)
}

/// A failed report with `score` that flags e1 as off-topic.
pub fn verification_scored(score: f64) -> Value {
    json!({
        "passed": false,
        "score": score,
        "details": [{"paragraph_id": "e1", "claim": "claim backed by e1", "exists": true, "supports_claim": false, "reason": "off-topic"}],
    })
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub connector: Arc<FakeConnector>,
    pub store: MemoryStateStore,
    pub observer: RecordingObserver,
    pub budget: Option<CostBudget>,
    pub pricing: ModelPricing,
}

impl Harness {
    /// A harness whose model and tools answer every research stage successfully.
    pub fn new() -> Self {
        let harness = Self {
            llm: Arc::new(ScriptedLlm::default()),
            connector: Arc::new(FakeConnector::default()),
            store: MemoryStateStore::new(),
            observer: RecordingObserver::new(),
            budget: None,
            pricing: ModelPricing::new(3.0, 15.0),
        };
        harness.llm.reply("analyze", analysis_reply(&["pump service interval", "record retention"]));
        harness.llm.reply("synthesize", synthesis_reply(&["e1", "e2"]));
        harness.tools().respond("web_search", web_results());
        harness.tools().respond("hybrid_search", search_results(&["e1", "e2", "e3"]));
        harness.tools().respond("citation_verify", verification_passed());
        harness
    }

    pub fn tools(&self) -> &FakeChannel {
        &self.connector.channel
    }

    pub fn agent() -> AgentSlug {
        AgentSlug::new(AGENT).unwrap()
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator {
        let estimator = TokenBudgetEstimator::new(TokenCount::new(200_000), TokenCount::new(8_192));
        let executor = StageExecutor::research(self.llm.clone(), estimator, &ResearchTools::default());
        let tools = ToolLifecycleManager::new(
            self.connector.clone(),
            ConnectionParams::Http {
                url: "http://tools.test/mcp".to_string(),
            },
        );
        let settings = OrchestratorSettings {
            agent: Self::agent(),
            pricing: self.pricing,
            budget: self.budget,
        };
        PipelineOrchestrator::new(executor, tools, Arc::new(self.store.clone()), settings)
            .with_observer(Arc::new(self.observer.clone()))
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.observer.events()
    }
}
