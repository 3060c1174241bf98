//! Skill Manifest Parser
//!
//! A skill is described by a SKILL.md file: a front-matter header
//! delimited by `---` lines, followed by a free-form body with usage
//! instructions. The header is a flat set of `key: value` lines plus
//! `- item` list entries under a bare `key:` line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Parsed skill manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Unique skill name within a registry
    pub name: String,
    /// One-line description, shown in the prompt catalog
    pub description: String,
    /// Client class the executor imports for the direct-call route
    pub client_class: Option<String>,
    /// Method invoked on the client for the direct-call route
    pub default_method: Option<String>,
    /// Whether the skill may be dispatched (false = documentation only)
    pub executable: bool,
    /// Documentation-only manifests attached to this skill
    pub related_tools: Vec<String>,
    /// Unrecognized header keys, kept verbatim
    pub extra: BTreeMap<String, serde_json::Value>,
    /// Body text after the header, byte-exact
    pub body: String,
}

/// Manifest parse errors, always localized to a single file
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest has no front-matter header")]
    MissingHeader,

    #[error("front-matter header is not terminated")]
    UnterminatedHeader,

    #[error("duplicate key `{0}` in front-matter")]
    DuplicateKey(String),

    #[error("malformed front-matter line: `{0}`")]
    MalformedLine(String),

    #[error("list item without a preceding `key:` line")]
    DanglingListItem,

    #[error("invalid boolean `{value}` for key `{key}`")]
    InvalidBool { key: String, value: String },

    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

impl SkillManifest {
    /// Parse a manifest from file content. Pure and deterministic.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut pos = 0usize;

        // The first non-blank line must be the opening delimiter.
        loop {
            let (line, next) = match next_line(content, pos) {
                Some(v) => v,
                None => return Err(ManifestError::MissingHeader),
            };
            if line.trim().is_empty() {
                pos = next;
                continue;
            }
            if line.trim_end() == "---" {
                pos = next;
                break;
            }
            return Err(ManifestError::MissingHeader);
        }

        // Collect header lines up to the closing delimiter.
        let mut header_lines: Vec<&str> = Vec::new();
        let body_start;
        loop {
            let (line, next) = match next_line(content, pos) {
                Some(v) => v,
                None => return Err(ManifestError::UnterminatedHeader),
            };
            if line.trim_end() == "---" {
                body_start = next;
                break;
            }
            header_lines.push(line);
            pos = next;
        }

        let fields = parse_header(&header_lines)?;
        let body = content[body_start..].to_string();

        Self::from_fields(fields, body)
    }

    fn from_fields(
        fields: Vec<(String, HeaderValue)>,
        body: String,
    ) -> Result<Self, ManifestError> {
        let mut name = None;
        let mut description = None;
        let mut client_class = None;
        let mut default_method = None;
        let mut executable = true;
        let mut related_tools = Vec::new();
        let mut extra = BTreeMap::new();

        for (key, value) in fields {
            match (key.as_str(), value) {
                ("name", HeaderValue::Scalar(v)) => name = Some(v),
                ("description", HeaderValue::Scalar(v)) => description = Some(v),
                ("client_class", HeaderValue::Scalar(v)) => client_class = Some(v),
                ("default_method", HeaderValue::Scalar(v)) => default_method = Some(v),
                ("executable", HeaderValue::Scalar(v)) => {
                    executable = match v.as_str() {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(ManifestError::InvalidBool {
                                key: key.clone(),
                                value: v,
                            })
                        }
                    };
                }
                ("related_tools", HeaderValue::List(items)) => related_tools = items,
                ("related_tools", HeaderValue::Scalar(v)) => related_tools = vec![v],
                (_, HeaderValue::Scalar(v)) => {
                    extra.insert(key, serde_json::Value::String(v));
                }
                (_, HeaderValue::List(items)) => {
                    extra.insert(
                        key,
                        serde_json::Value::Array(
                            items.into_iter().map(serde_json::Value::String).collect(),
                        ),
                    );
                }
            }
        }

        let name = name.filter(|n| !n.is_empty()).ok_or(ManifestError::MissingField("name"))?;
        let description = description
            .filter(|d| !d.is_empty())
            .ok_or(ManifestError::MissingField("description"))?;

        Ok(Self {
            name,
            description,
            client_class,
            default_method,
            executable,
            related_tools,
            extra,
            body,
        })
    }

    /// Extract the first fenced python snippet from the body, if any.
    /// Used by the prompt catalog as a compact usage example.
    pub fn usage_snippet(&self) -> Option<&str> {
        let start = self.body.find("```python")?;
        let after = &self.body[start + "```python".len()..];
        let after = after.strip_prefix('\n').unwrap_or(after);
        let end = after.find("```")?;
        Some(after[..end].trim_end())
    }
}

enum HeaderValue {
    Scalar(String),
    List(Vec<String>),
}

fn parse_header(lines: &[&str]) -> Result<Vec<(String, HeaderValue)>, ManifestError> {
    let mut fields: Vec<(String, HeaderValue)> = Vec::new();
    let mut open_list: Option<usize> = None;

    for raw in lines {
        if raw.trim().is_empty() {
            continue;
        }
        let trimmed = raw.trim_start();

        if let Some(item) = trimmed.strip_prefix("- ") {
            let idx = open_list.ok_or(ManifestError::DanglingListItem)?;
            match &mut fields[idx].1 {
                HeaderValue::List(items) => items.push(item.trim().to_string()),
                HeaderValue::Scalar(_) => return Err(ManifestError::DanglingListItem),
            }
            continue;
        }

        let (key, value) = trimmed
            .split_once(':')
            .ok_or_else(|| ManifestError::MalformedLine(raw.trim_end().to_string()))?;
        let key = key.trim().to_string();
        let value = value.trim();

        if key.is_empty() {
            return Err(ManifestError::MalformedLine(raw.trim_end().to_string()));
        }
        if fields.iter().any(|(k, _)| *k == key) {
            return Err(ManifestError::DuplicateKey(key));
        }

        if value.is_empty() {
            fields.push((key, HeaderValue::List(Vec::new())));
            open_list = Some(fields.len() - 1);
        } else {
            fields.push((key, HeaderValue::Scalar(value.to_string())));
            open_list = None;
        }
    }

    Ok(fields)
}

/// Returns the next line (without terminator) and the offset after it.
fn next_line(content: &str, pos: usize) -> Option<(&str, usize)> {
    if pos >= content.len() {
        return None;
    }
    let rest = &content[pos..];
    match rest.find('\n') {
        Some(i) => {
            let line = rest[..i].strip_suffix('\r').unwrap_or(&rest[..i]);
            Some((line, pos + i + 1))
        }
        None => Some((rest, content.len())),
    }
}
