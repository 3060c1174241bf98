//! Prompt Composer
//!
//! Builds the system prompt from its fixed sections: current time,
//! behavioral preamble, the skills catalog, the memory section, and
//! the execution protocol. Deterministic for identical inputs; the
//! clock value is passed in.

use crate::store::MemoryEntry;
use chrono::{DateTime, Datelike, Utc};

const PREAMBLE: &str = "\
You are an AI assistant that can call external skills to complete tasks.

Answer directly from your own knowledge when the question is general \
and time-insensitive. Reach for a skill when the task needs fresh \
information, private data, computation, or any capability listed in \
the catalog below. Read a skill's usage notes before calling it, and \
explain results in your own words rather than dumping raw output.";

const EXECUTION_PROTOCOL: &str = "\
## Executing skills

To run a skill, emit exactly this block and nothing else on those lines:

<execute_skill>
<skill_name>NAME</skill_name>
<code>
# python code following the skill's usage notes
</code>
</execute_skill>

Rules:
1. Emit at most one block per turn, then wait for its result.
2. After each result, decide whether to call another skill or answer.
3. If an execution fails, read the error and correct your code.
4. To re-read a skill's full documentation first, emit \
<read_skill>NAME</read_skill> on its own line.
5. When you have enough information, answer in plain text with no block.";

/// Inputs assembled by the engine for one request
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub now: DateTime<Utc>,
    pub skills_catalog: &'a str,
    pub memory_entries: &'a [MemoryEntry],
    pub memory_excerpt: Option<&'a str>,
}

/// Compose the full system prompt
pub fn compose_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(&format!(
        "Current date and time: {} ({}) {} UTC\n\n",
        inputs.now.format("%Y-%m-%d"),
        weekday_name(inputs.now),
        inputs.now.format("%H:%M"),
    ));

    prompt.push_str(PREAMBLE);
    prompt.push_str("\n\n## Available skills\n\n");
    prompt.push_str(inputs.skills_catalog);

    prompt.push_str("\n\n## Memory\n\n");
    prompt.push_str(&memory_section(
        inputs.memory_entries,
        inputs.memory_excerpt,
    ));

    prompt.push_str("\n\n");
    prompt.push_str(EXECUTION_PROTOCOL);
    prompt
}

/// Render pinned entries plus the retrieval excerpt. Pinned entries
/// appear regardless of whether retrieval ran.
fn memory_section(entries: &[MemoryEntry], excerpt: Option<&str>) -> String {
    let mut out = String::new();

    if !entries.is_empty() {
        out.push_str("Known facts for this conversation:\n");
        for entry in entries {
            let value = match &entry.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("- [{}] {}: {}\n", entry.category, entry.key, value));
        }
    }

    if let Some(excerpt) = excerpt.filter(|e| !e.trim().is_empty()) {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("Relevant context from earlier in this conversation:\n");
        out.push_str(excerpt.trim());
        out.push('\n');
    }

    if out.is_empty() {
        out.push_str("No stored context for this conversation yet.");
    }
    out
}

fn weekday_name(now: DateTime<Utc>) -> &'static str {
    match now.weekday() {
        chrono::Weekday::Mon => "Monday",
        chrono::Weekday::Tue => "Tuesday",
        chrono::Weekday::Wed => "Wednesday",
        chrono::Weekday::Thu => "Thursday",
        chrono::Weekday::Fri => "Friday",
        chrono::Weekday::Sat => "Saturday",
        chrono::Weekday::Sun => "Sunday",
    }
}
