//! The budgeted multi-turn tool loop.
//!
//! One turn: the assistant's tool-call message is appended first, every
//! call is executed (in parallel when configured, with results appended in
//! the original call order), context pruning runs, and the caller issues
//! the follow-up provider call. The budget is per-run; an exhausted budget
//! replaces the invocation with a synthetic error result, and when the
//! final-prompt knob is set the run closes with one last call carrying no
//! tools and a `none` tool choice.

use futures_util::future::join_all;
use serde_json::{json, Value};

use crate::error::{CoordResult, CoordinatorError};
use crate::logging::log_debug;
use crate::prune::{prune_reasoning, prune_tool_results};
use crate::settings::RuntimeSettings;
use crate::spec::{
    Message, Tool, ToolCall, ToolCallRecord, ToolChoice, ToolEvent, UnifiedResponse, Usage,
};
use crate::tools::{ToolContext, ToolInvoker};

/// Per-run, monotonically decreasing bound on tool invocations.
#[derive(Debug, Clone)]
pub struct ToolBudget {
    total: u32,
    remaining: u32,
}

impl ToolBudget {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            remaining: total,
        }
    }

    /// Consume one invocation; false means the budget is exhausted and the
    /// call must not be issued.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Mutable state of one run, shared by the unary and streaming loops.
pub struct RunState {
    pub messages: Vec<Message>,
    /// Canonical tool set; re-serialized per priority entry by each compat
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub runtime: RuntimeSettings,
    pub budget: ToolBudget,
    /// Every executed call, in invocation order
    pub executed_calls: Vec<ToolCall>,
    pub records: Vec<ToolCallRecord>,
    /// Summed usage across provider calls
    pub usage: Option<Usage>,
    call_progress: u32,
}

impl RunState {
    pub fn new(
        messages: Vec<Message>,
        tools: Vec<Tool>,
        tool_choice: Option<ToolChoice>,
        runtime: RuntimeSettings,
    ) -> Self {
        let budget = ToolBudget::new(runtime.max_tool_iterations);
        Self {
            messages,
            tools,
            tool_choice,
            runtime,
            budget,
            executed_calls: Vec::new(),
            records: Vec::new(),
            usage: None,
            call_progress: 0,
        }
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        match &mut self.usage {
            Some(total) => total.add(usage),
            None => self.usage = Some(usage.clone()),
        }
    }

    /// Fold the run's tool records and usage into the final response.
    pub fn finalize_response(&self, mut response: UnifiedResponse) -> UnifiedResponse {
        if !self.executed_calls.is_empty() {
            response.tool_calls = Some(self.executed_calls.clone());
        }
        response.attach_tool_records(&self.records);
        if let Some(usage) = &self.usage {
            response.usage = Some(usage.clone());
        }
        response
    }
}

/// What one executed turn produced.
pub struct TurnOutcome {
    /// Result events in call order, for the streaming path
    pub result_events: Vec<ToolEvent>,
    /// At least one call hit an exhausted budget this turn
    pub budget_exhausted: bool,
}

/// Execute every tool call of one assistant turn.
///
/// Appends the assistant tool-call message before any results, dispatches
/// the calls, appends results in the original call order, then prunes.
pub async fn execute_turn(
    state: &mut RunState,
    invoker: &ToolInvoker,
    response: &UnifiedResponse,
    provider: &str,
    model: &str,
    metadata: Option<&Value>,
) -> CoordResult<TurnOutcome> {
    let calls = response.tool_calls.clone().unwrap_or_default();

    // Assistant message first; ordering matches provider expectations.
    let mut assistant = Message::assistant_with_tools(response.text(), calls.clone());
    assistant.reasoning = response.reasoning.clone();
    state.messages.push(assistant);

    // Budget is consumed per call, in order, before any dispatch.
    let mut admitted: Vec<(ToolCall, bool)> = Vec::with_capacity(calls.len());
    let mut budget_exhausted = false;
    for call in calls {
        let allowed = state.budget.consume();
        budget_exhausted |= !allowed;
        admitted.push((call, allowed));
    }

    let results = dispatch(state, invoker, &admitted, provider, model, metadata).await;

    let total = state.budget.total();
    let mut result_events = Vec::with_capacity(results.len());
    for ((call, _), result) in admitted.iter().zip(results) {
        state.executed_calls.push(call.clone());

        let (structured, error) = match result {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err.to_string())),
        };
        state.records.push(ToolCallRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: structured.clone(),
            error: error.clone(),
        });

        let payload = match (&structured, &error) {
            (Some(value), _) => value.clone(),
            (None, Some(message)) => json!({ "error": message }),
            (None, None) => Value::Null,
        };
        result_events.push(ToolEvent::Result {
            id: call.id.clone(),
            name: call.name.clone(),
            result: payload.to_string(),
        });

        // Object results may carry a `text` field (the vector-search tool
        // does); that field is what the model reads, the full payload stays
        // in the structured part.
        let mut text = match &payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => payload.to_string(),
            },
            other => other.to_string(),
        };
        if state.runtime.tool_result_max_chars > 0 {
            text = clamp_chars(&text, state.runtime.tool_result_max_chars);
        }
        if state.runtime.tool_countdown_enabled {
            let used = (state.executed_calls.len() as u32).min(total);
            text = format!(
                "{text}\n(Tool call {used} of {total} — {remaining} remaining)",
                remaining = state.budget.remaining()
            );
        }

        // The structured result stays untruncated for downstream use.
        state.messages.push(Message::tool_result(
            call.id.clone(),
            call.name.clone(),
            payload,
            text,
        ));
    }

    prune_tool_results(&mut state.messages, state.runtime.preserve_tool_results);
    prune_reasoning(&mut state.messages, state.runtime.preserve_reasoning);

    log_debug!(
        calls = result_events.len(),
        budget_remaining = state.budget.remaining(),
        "Tool turn complete"
    );

    Ok(TurnOutcome {
        result_events,
        budget_exhausted,
    })
}

/// Append the synthetic closing prompt and zero the tool surface for the
/// final call after budget exhaustion.
pub fn prepare_final_prompt(state: &mut RunState) {
    state.messages.push(Message::user(
        "The tool budget is exhausted. Summarize and answer without further tool use.",
    ));
    state.tools.clear();
    state.tool_choice = Some(ToolChoice::none());
}

async fn dispatch(
    state: &mut RunState,
    invoker: &ToolInvoker,
    admitted: &[(ToolCall, bool)],
    provider: &str,
    model: &str,
    metadata: Option<&Value>,
) -> Vec<CoordResult<Value>> {
    let mut contexts = Vec::with_capacity(admitted.len());
    for (call, allowed) in admitted {
        state.call_progress += 1;
        contexts.push((call, *allowed, state.call_progress));
    }

    let run_one = |call: &ToolCall, allowed: bool, progress: u32| {
        let name = call.name.clone();
        let args = call.arguments.clone();
        let ctx = ToolContext {
            args: args.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            metadata: metadata.cloned(),
            call_progress: progress,
        };
        async move {
            if !allowed {
                return Err(CoordinatorError::tool_execution(
                    &name,
                    "tool budget exhausted; call not issued",
                ));
            }
            invoker.invoke(&name, args, ctx).await
        }
    };

    if state.runtime.parallel_tool_execution {
        // Concurrent dispatch; join_all preserves input order for append.
        join_all(
            contexts
                .iter()
                .map(|&(call, allowed, progress)| run_one(call, allowed, progress)),
        )
        .await
    } else {
        let mut results = Vec::with_capacity(contexts.len());
        for &(call, allowed, progress) in &contexts {
            results.push(run_one(call, allowed, progress).await);
        }
        results
    }
}

/// Char-safe clamp with a sentinel ellipsis.
fn clamp_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clamped: String = text.chars().take(max_chars).collect();
    clamped.push('…');
    clamped
}
