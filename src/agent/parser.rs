//! Invocation Parser
//!
//! Incremental detector for skill-invocation blocks inside a streamed
//! model response. Content outside a block is released as text deltas
//! as soon as it provably cannot open a block; a closed block yields a
//! single invocation event. Blocks left open at stream end are
//! malformed.

use crate::skills::{InvocationPayload, InvocationRequest};
use once_cell::sync::Lazy;
use regex::Regex;

const EXECUTE_OPEN: &str = "<execute_skill>";
const EXECUTE_CLOSE: &str = "</execute_skill>";
const READ_OPEN: &str = "<read_skill>";
const READ_CLOSE: &str = "</read_skill>";

static SKILL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<skill_name>\s*(.*?)\s*</skill_name>").unwrap());
static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<code>(.*?)</code>").unwrap());
static ARGS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<args>(.*?)</args>").unwrap());

/// Events produced while feeding stream deltas through the parser
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    /// Plain response text outside any block
    Text(String),
    /// A complete `<execute_skill>` block
    Invocation(InvocationRequest),
    /// A complete `<read_skill>` block naming a skill document
    ReadSkill(String),
    /// A block that closed (or the stream ended) without valid
    /// contents; `raw` is the original text for echoing
    Malformed { raw: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Execute,
    Read,
}

impl BlockKind {
    fn open_tag(self) -> &'static str {
        match self {
            Self::Execute => EXECUTE_OPEN,
            Self::Read => READ_OPEN,
        }
    }

    fn close_tag(self) -> &'static str {
        match self {
            Self::Execute => EXECUTE_CLOSE,
            Self::Read => READ_CLOSE,
        }
    }
}

/// Incremental parser; one instance per streamed response
#[derive(Debug, Default)]
pub struct InvocationParser {
    buf: String,
    in_block: Option<BlockKind>,
}

impl InvocationParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stream delta, collecting any events it completes
    pub fn push(&mut self, delta: &str) -> Vec<ParseEvent> {
        self.buf.push_str(delta);
        let mut events = Vec::new();

        loop {
            match self.in_block {
                None => {
                    let Some(lt) = self.buf.find('<') else {
                        if !self.buf.is_empty() {
                            events.push(ParseEvent::Text(std::mem::take(&mut self.buf)));
                        }
                        break;
                    };
                    if lt > 0 {
                        let text: String = self.buf.drain(..lt).collect();
                        events.push(ParseEvent::Text(text));
                    }

                    // Buffer now starts with '<'
                    if self.buf.starts_with(EXECUTE_OPEN) {
                        self.buf.drain(..EXECUTE_OPEN.len());
                        self.in_block = Some(BlockKind::Execute);
                    } else if self.buf.starts_with(READ_OPEN) {
                        self.buf.drain(..READ_OPEN.len());
                        self.in_block = Some(BlockKind::Read);
                    } else if EXECUTE_OPEN.starts_with(self.buf.as_str())
                        || READ_OPEN.starts_with(self.buf.as_str())
                    {
                        // Could still become an opening tag, hold back
                        break;
                    } else {
                        // Ordinary '<' in prose, release it
                        let lt_char: String = self.buf.drain(..1).collect();
                        events.push(ParseEvent::Text(lt_char));
                    }
                }
                Some(kind) => {
                    let Some(end) = self.buf.find(kind.close_tag()) else {
                        break;
                    };
                    let inner: String = self.buf.drain(..end).collect();
                    self.buf.drain(..kind.close_tag().len());
                    self.in_block = None;
                    events.push(parse_block(kind, &inner));
                }
            }
        }

        events
    }

    /// Signal end of stream: flush trailing text and surface a
    /// dangling open block as malformed.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        match self.in_block.take() {
            Some(kind) => {
                let raw = format!("{}{}", kind.open_tag(), std::mem::take(&mut self.buf));
                events.push(ParseEvent::Malformed { raw });
            }
            None => {
                if !self.buf.is_empty() {
                    events.push(ParseEvent::Text(std::mem::take(&mut self.buf)));
                }
            }
        }
        events
    }
}

fn parse_block(kind: BlockKind, inner: &str) -> ParseEvent {
    let raw = || format!("{}{}{}", kind.open_tag(), inner, kind.close_tag());

    match kind {
        BlockKind::Read => {
            let name = inner.trim();
            if name.is_empty() {
                ParseEvent::Malformed { raw: raw() }
            } else {
                ParseEvent::ReadSkill(name.to_string())
            }
        }
        BlockKind::Execute => {
            let Some(name) = SKILL_NAME_RE
                .captures(inner)
                .map(|c| c[1].trim().to_string())
                .filter(|n| !n.is_empty())
            else {
                return ParseEvent::Malformed { raw: raw() };
            };

            if let Some(code) = CODE_RE.captures(inner) {
                return ParseEvent::Invocation(InvocationRequest {
                    skill_name: name,
                    payload: InvocationPayload::Code(code[1].trim().to_string()),
                });
            }
            if let Some(args) = ARGS_RE.captures(inner) {
                return match serde_json::from_str(args[1].trim()) {
                    Ok(value) => ParseEvent::Invocation(InvocationRequest {
                        skill_name: name,
                        payload: InvocationPayload::Args(value),
                    }),
                    Err(_) => ParseEvent::Malformed { raw: raw() },
                };
            }
            ParseEvent::Malformed { raw: raw() }
        }
    }
}
