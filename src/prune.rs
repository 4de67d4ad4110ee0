//! Context pruning between tool turns.
//!
//! Two independent bounds on the message list, applied after each tool turn
//! and before the follow-up provider call: tool-result retention and
//! reasoning retention. Both keep the last N blocks per their policy.
//!
//! A pruned tool result is replaced in place with a placeholder tool
//! message rather than removed, so its assistant tool call is never
//! orphaned and message positions are preserved (the paired-count invariant
//! holds at every quiescent point).

use crate::settings::KeepPolicy;
use crate::spec::{ContentPart, Message, Role};

/// Placeholder text standing in for a pruned tool result.
pub const PRUNED_RESULT_NOTE: &str = "[tool result pruned to save context]";

/// Bound tool-result messages to the policy's last-N.
pub fn prune_tool_results(messages: &mut [Message], policy: KeepPolicy) {
    let tool_indexes: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Tool)
        .map(|(i, _)| i)
        .collect();

    let keep = policy.keep_count(tool_indexes.len());
    let cutoff = tool_indexes.len() - keep;
    for &index in &tool_indexes[..cutoff] {
        let message = &mut messages[index];
        if is_placeholder(message) {
            continue;
        }
        message.content = vec![ContentPart::text(PRUNED_RESULT_NOTE)];
    }
}

/// Bound reasoning blocks on assistant messages to the policy's last-N.
pub fn prune_reasoning(messages: &mut [Message], policy: KeepPolicy) {
    let reasoning_indexes: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant && m.reasoning.is_some())
        .map(|(i, _)| i)
        .collect();

    let keep = policy.keep_count(reasoning_indexes.len());
    let cutoff = reasoning_indexes.len() - keep;
    for &index in &reasoning_indexes[..cutoff] {
        messages[index].reasoning = None;
    }
}

fn is_placeholder(message: &Message) -> bool {
    matches!(
        message.content.as_slice(),
        [ContentPart::Text { text }] if text == PRUNED_RESULT_NOTE
    )
}
