// src/conversation/budget.rs
// Token budget estimation and context truncation for request construction

use super::message::{Message, Role};

/// Estimated characters per token
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed per-message overhead (role tags, separators)
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Truncation kicks in once the estimate exceeds this share of the limit
pub const TRUNCATION_THRESHOLD: f64 = 0.8;

/// Estimate token count for a string (rough estimate: ~3.5 chars per token)
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as u64
}

/// Estimate tokens for one message including overhead
pub fn estimate_message(message: &Message) -> u64 {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate tokens for all messages
pub fn estimate_message_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}

/// Token budget derived from a model's context limit
pub fn budget_for_limit(limit_tokens: u64) -> u64 {
    (limit_tokens as f64 * TRUNCATION_THRESHOLD).floor() as u64
}

/// Build a lossy view of `messages` that fits the context limit.
///
/// Returns the input unchanged when the estimate is within 80% of the limit.
/// Otherwise keeps the most recent system message (first) followed by the
/// longest suffix of the remaining messages that fits under the budget. The
/// newest non-system message is always kept, even if it alone overflows; the
/// remote API is the final authority on size.
pub fn truncate_for_context(messages: &[Message], limit_tokens: u64) -> Vec<Message> {
    let budget = budget_for_limit(limit_tokens);
    if estimate_message_tokens(messages) <= budget {
        return messages.to_vec();
    }

    let system_index = messages.iter().rposition(|m| m.role == Role::System);
    let system_tokens = system_index
        .map(|i| estimate_message(&messages[i]))
        .unwrap_or(0);

    let mut remaining = budget.saturating_sub(system_tokens);
    let mut kept: Vec<&Message> = Vec::new();

    for (i, msg) in messages.iter().enumerate().rev() {
        if Some(i) == system_index || msg.role == Role::System {
            continue;
        }
        let cost = estimate_message(msg);
        if cost > remaining {
            if kept.is_empty() {
                kept.push(msg);
            }
            break;
        }
        remaining -= cost;
        kept.push(msg);
    }

    let mut result = Vec::with_capacity(kept.len() + 1);
    if let Some(i) = system_index {
        result.push(messages[i].clone());
    }
    result.extend(kept.into_iter().rev().cloned());
    result
}
