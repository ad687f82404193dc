//! Flattens an ordered chat history into the single prompt string the
//! upstream provider expects, and derives the word-count usage heuristic.

use crate::types::{ChatMessage, Role, Usage};
use crate::{ProxyError, Result};

/// Builds the flattened prompt from a message list.
///
/// The last system message and the last user message win; earlier system
/// messages are dropped from the history block entirely. Both quirks are
/// kept from the original service on purpose: clients in the wild depend on
/// the exact prompt text this produces.
///
/// Layout: optional `System: …\n`, then `User: …\n` / `Assistant: …\n` for
/// every message before the final one, then `User: {last user message}`
/// without a trailing newline.
pub fn flatten_messages(messages: &[ChatMessage]) -> Result<String> {
    let mut system_message: Option<&str> = None;
    let mut user_message: Option<&str> = None;

    for message in messages {
        match message.role {
            Role::System => system_message = Some(&message.content),
            Role::User => user_message = Some(&message.content),
            Role::Assistant => {}
        }
    }

    let user_message = user_message.ok_or(ProxyError::MissingUserMessage)?;

    let mut context = String::new();
    if let Some(system) = system_message {
        context.push_str("System: ");
        context.push_str(system);
        context.push('\n');
    }

    let history_len = messages.len().saturating_sub(1);
    for message in &messages[..history_len] {
        match message.role {
            Role::User => {
                context.push_str("User: ");
                context.push_str(&message.content);
                context.push('\n');
            }
            Role::Assistant => {
                context.push_str("Assistant: ");
                context.push_str(&message.content);
                context.push('\n');
            }
            Role::System => {}
        }
    }

    Ok(format!("{context}User: {user_message}"))
}

/// Whitespace word count scaled by 1.3 and rounded. Not a tokenizer; the
/// upstream provider reports no token counts, so this stands in for them.
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as f64;
    (words * 1.3).round() as u64
}

pub fn estimate_usage(prompt: &str, completion: &str) -> Usage {
    let prompt_tokens = estimate_tokens(prompt);
    let completion_tokens = estimate_tokens(completion);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}
