// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use amrita_config::LLMConfig;
use amrita_model::{call_and_collect, Message, ModelAdapter, Role};
use tracing::{debug, warn};

use crate::memory::MemoryModel;

/// System prompt driving the summarization call.
pub const SUMMARIZE_PROMPT: &str =
    "Summarize the following conversation preserving entities, decisions, and \
     unresolved tasks. Be information-dense; the summary replaces the original \
     history.";

/// Marker on the system message that carries the running abstract, so a later
/// pass can replace it instead of stacking summaries.
const ABSTRACT_MARKER: &str = "memory_abstract";

/// Apply the summarization-triggered window policy to `memory`.
///
/// While `enable_memory_abstract` is on and the non-system message count `L`
/// has reached `memory_length_limit`, the oldest `ceil(p · Lmax)` non-system
/// messages are summarized away and replaced by a single system message
/// carrying the full running abstract.  The window is extended forward so a
/// tool-call group (assistant message plus its following tool results) is
/// never split.
///
/// A failed summarization leaves the window intact; the policy simply runs
/// again next turn.  `memory_length_limit = 0` disables compression.
///
/// Returns `true` when at least one pass replaced a window.
pub async fn compress_memory(
    memory: &mut MemoryModel,
    cfg: &LLMConfig,
    adapter: &dyn ModelAdapter,
) -> bool {
    if !cfg.enable_memory_abstract || cfg.memory_length_limit == 0 {
        return false;
    }
    let limit = cfg.memory_length_limit;
    let mut compressed = false;

    // One pass fires at L ≥ Lmax; further passes run only while the window is
    // still over the limit (oversized histories seeded from outside), so the
    // post-turn state always satisfies L ≤ Lmax.
    loop {
        let l = memory.non_system_len();
        let due = if compressed { l > limit } else { l >= limit };
        if !due {
            break;
        }
        let quota = (cfg.memory_abstract_proportion * limit as f32).ceil() as usize;
        let quota = quota.clamp(1, memory.non_system_len());

        let victim_idx = select_victims(&memory.messages, quota);
        if victim_idx.is_empty() {
            break;
        }

        let window: Vec<&Message> = victim_idx.iter().map(|&i| &memory.messages[i]).collect();
        let serialized = serialize_window(&window);
        let request = vec![
            Message::system(SUMMARIZE_PROMPT),
            Message::user(serialized),
        ];

        let summary = match call_and_collect(adapter, request, vec![]).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content,
            Ok(_) => {
                warn!("summarization returned empty content; leaving window intact");
                break;
            }
            Err(e) => {
                warn!(error = %e, "summarization failed; leaving window intact");
                break;
            }
        };

        let new_abstract = if memory.abstract_text.is_empty() {
            summary
        } else {
            format!("{}\n\n{}", memory.abstract_text, summary)
        };

        // Rebuild: drop the victims and any previous abstract message, then
        // insert the refreshed abstract at the first victim's position.
        let insert_at = victim_idx[0];
        let mut rebuilt: Vec<Message> = Vec::with_capacity(memory.messages.len());
        for (i, msg) in memory.messages.iter().enumerate() {
            if i == insert_at {
                let mut abstract_msg = Message::system(new_abstract.clone());
                abstract_msg.name = Some(ABSTRACT_MARKER.into());
                rebuilt.push(abstract_msg);
            }
            let is_old_abstract =
                msg.role == Role::System && msg.name.as_deref() == Some(ABSTRACT_MARKER);
            if victim_idx.contains(&i) || is_old_abstract {
                continue;
            }
            rebuilt.push(msg.clone());
        }

        debug!(
            victims = victim_idx.len(),
            remaining = rebuilt.len(),
            "compressed memory window"
        );
        memory.messages = rebuilt;
        memory.abstract_text = new_abstract;
        memory.touch();
        compressed = true;
    }

    compressed
}

/// Indices of the victim window: the oldest `quota` non-system messages,
/// extended forward past any trailing tool results so a tool-call group stays
/// atomic.
fn select_victims(messages: &[Message], quota: usize) -> Vec<usize> {
    let mut victims = Vec::new();
    let mut taken = 0;
    for (i, msg) in messages.iter().enumerate() {
        if msg.role == Role::System {
            continue;
        }
        if taken < quota {
            victims.push(i);
            taken += 1;
        } else if msg.role == Role::Tool && victims.last() == Some(&(i - 1)) {
            // The window ended inside a tool-call group; pull the group's
            // remaining results in.
            victims.push(i);
        } else {
            break;
        }
    }
    victims
}

fn serialize_window(window: &[&Message]) -> String {
    let mut out = String::new();
    for msg in window {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&msg.as_text());
        for tc in &msg.tool_calls {
            out.push_str(&format!(
                " [called {}({})]",
                tc.function.name, tc.function.arguments
            ));
        }
        out.push('\n');
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
