//! Settings partitioning and per-provider merging.
//!
//! A spec's `settings` bag is split into three disjoint partitions by static
//! key sets: *runtime* keys govern the tool loop and pruning, *provider*
//! keys are the recognized upstream knobs, and everything else is an *extra*
//! preserved verbatim for compat-specific payload extensions.
//!
//! Per-priority-entry overrides are deep-merged onto the global bag
//! **before** partitioning: primitives overwrite, objects recurse, arrays
//! overwrite entirely, nulls are dropped. The merge is pure.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::defaults::ToolLoopDefaults;

/// Keys that govern the tool loop and context pruning.
static RUNTIME_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "toolCountdownEnabled",
        "toolFinalPromptEnabled",
        "maxToolIterations",
        "preserveToolResults",
        "preserveReasoning",
        "parallelToolExecution",
        "toolResultMaxChars",
        "batchId",
    ])
});

/// Recognized upstream sampling and shaping knobs.
static PROVIDER_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "temperature",
        "topP",
        "maxTokens",
        "stop",
        "responseFormat",
        "seed",
        "frequencyPenalty",
        "presencePenalty",
        "logitBias",
        "logprobs",
        "topLogprobs",
        "reasoning",
        "reasoningBudget",
    ])
});

/// Result of splitting a settings bag by the static key sets.
///
/// The three maps are disjoint and their union equals the input keys,
/// modulo dropped nulls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedSettings {
    pub runtime: BTreeMap<String, Value>,
    pub provider: BTreeMap<String, Value>,
    pub extras: BTreeMap<String, Value>,
}

/// Split `bag` into runtime, provider, and extras partitions.
///
/// Null values are dropped. Unknown keys (including a nested `provider`
/// key) land in extras.
pub fn partition(bag: &BTreeMap<String, Value>) -> PartitionedSettings {
    let mut out = PartitionedSettings::default();
    for (key, value) in bag {
        if value.is_null() {
            continue;
        }
        let target = if RUNTIME_KEYS.contains(key.as_str()) {
            &mut out.runtime
        } else if PROVIDER_KEYS.contains(key.as_str()) {
            &mut out.provider
        } else {
            &mut out.extras
        };
        target.insert(key.clone(), value.clone());
    }
    out
}

/// Deep-merge `overlay` onto `base` without mutating either input.
///
/// Only maps merge recursively; arrays and primitives overwrite. Null
/// overlay values are ignored (treated as absent).
pub fn merge_settings(
    base: &BTreeMap<String, Value>,
    overlay: Option<&BTreeMap<String, Value>>,
) -> BTreeMap<String, Value> {
    let mut merged = base.clone();
    let Some(overlay) = overlay else {
        return merged;
    };
    for (key, value) in overlay {
        if value.is_null() {
            continue;
        }
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Deep-merge one JSON object into another (shared by the settings merge
/// and the payload extension engine).
pub fn merge_objects(
    base: &mut serde_json::Map<String, Value>,
    overlay: &serde_json::Map<String, Value>,
) {
    for (key, value) in overlay {
        if value.is_null() {
            continue;
        }
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

// ============================================================================
// Typed runtime settings
// ============================================================================

/// Bound on how many tool-result (or reasoning) blocks survive pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepPolicy {
    /// "all" or "none"
    Named(KeepAllOrNone),
    /// Keep the last N
    Last(usize),
}

/// The string forms of [`KeepPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAllOrNone {
    All,
    None,
}

impl KeepPolicy {
    pub const ALL: KeepPolicy = KeepPolicy::Named(KeepAllOrNone::All);
    pub const NONE: KeepPolicy = KeepPolicy::Named(KeepAllOrNone::None);

    /// How many of `total` items to keep under this policy.
    pub fn keep_count(&self, total: usize) -> usize {
        match self {
            KeepPolicy::Named(KeepAllOrNone::All) => total,
            KeepPolicy::Named(KeepAllOrNone::None) => 0,
            KeepPolicy::Last(n) => (*n).min(total),
        }
    }
}

impl Default for KeepPolicy {
    fn default() -> Self {
        KeepPolicy::ALL
    }
}

/// Typed view of the runtime partition, resolved over the configured
/// defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub tool_countdown_enabled: bool,
    pub tool_final_prompt_enabled: bool,
    pub max_tool_iterations: u32,
    pub preserve_tool_results: KeepPolicy,
    pub preserve_reasoning: KeepPolicy,
    pub parallel_tool_execution: bool,
    /// 0 disables clamping
    pub tool_result_max_chars: usize,
    pub batch_id: Option<String>,
}

impl RuntimeSettings {
    /// Resolve the runtime partition over `defaults`, field by field.
    pub fn resolve(runtime: &BTreeMap<String, Value>, defaults: &ToolLoopDefaults) -> Self {
        fn get_bool(map: &BTreeMap<String, Value>, key: &str, fallback: bool) -> bool {
            map.get(key).and_then(Value::as_bool).unwrap_or(fallback)
        }
        fn get_policy(map: &BTreeMap<String, Value>, key: &str, fallback: KeepPolicy) -> KeepPolicy {
            map.get(key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(fallback)
        }

        Self {
            tool_countdown_enabled: get_bool(
                runtime,
                "toolCountdownEnabled",
                defaults.tool_countdown_enabled,
            ),
            tool_final_prompt_enabled: get_bool(
                runtime,
                "toolFinalPromptEnabled",
                defaults.tool_final_prompt_enabled,
            ),
            max_tool_iterations: runtime
                .get("maxToolIterations")
                .and_then(Value::as_u64)
                .map(|n| n as u32)
                .unwrap_or(defaults.max_tool_iterations),
            preserve_tool_results: get_policy(
                runtime,
                "preserveToolResults",
                defaults.preserve_tool_results,
            ),
            preserve_reasoning: get_policy(
                runtime,
                "preserveReasoning",
                defaults.preserve_reasoning,
            ),
            parallel_tool_execution: get_bool(
                runtime,
                "parallelToolExecution",
                defaults.parallel_tool_execution,
            ),
            tool_result_max_chars: runtime
                .get("toolResultMaxChars")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(defaults.tool_result_max_chars),
            batch_id: runtime
                .get("batchId")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// The provider partition, handed to compat adapters as-is.
///
/// Typed accessors cover the knobs the built-in compats read; compats may
/// read any recognized key directly from the map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderSettings(pub BTreeMap<String, Value>);

impl ProviderSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.0.get("temperature").and_then(Value::as_f64)
    }

    pub fn top_p(&self) -> Option<f64> {
        self.0.get("topP").and_then(Value::as_f64)
    }

    pub fn max_tokens(&self) -> Option<u64> {
        self.0.get("maxTokens").and_then(Value::as_u64)
    }

    pub fn stop(&self) -> Option<&Value> {
        self.0.get("stop")
    }

    pub fn seed(&self) -> Option<i64> {
        self.0.get("seed").and_then(Value::as_i64)
    }

    pub fn response_format(&self) -> Option<&Value> {
        self.0.get("responseFormat")
    }

    pub fn reasoning(&self) -> Option<&Value> {
        self.0.get("reasoning")
    }

    pub fn reasoning_budget(&self) -> Option<u64> {
        self.0.get("reasoningBudget").and_then(Value::as_u64)
    }
}
