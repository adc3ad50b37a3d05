// Parser module - decodes the upstream AWS-style event stream
//
// The upstream response body is a sequence of framed events. Each frame
// carries a 12-byte prelude (total length, header length, prelude CRC),
// a header block, a JSON payload, and a trailing message CRC. Payloads
// are small JSON objects which we map onto typed UpstreamEvents by key
// presence.
//
// Chunk boundaries fall anywhere, including mid-frame, so the parser
// keeps a byte buffer and only emits events for complete frames.

pub mod thinking;

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use serde_json::Value;

/// Frame prelude: total length + header length + prelude CRC.
const PRELUDE_LEN: usize = 12;
/// Trailing message CRC.
const TRAILER_LEN: usize = 4;
/// Frames larger than this are treated as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Typed event decoded from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Assistant text content
    Content(String),
    /// A completed tool call (arguments accumulated across fragments)
    ToolCall(ToolCall),
    /// Metering credits reported by the upstream
    Usage(f64),
    /// Context window usage as a percentage of the model maximum
    ContextUsage(f64),
    /// Upstream exception kind string
    Exception(String),
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments string; parsed exactly once at block close
    pub arguments: String,
}

/// Partially assembled tool call, keyed by toolUseId until the stop marker.
#[derive(Debug, Default)]
struct PartialToolCall {
    name: String,
    arguments: String,
}

/// Stateful frame decoder. One instance per upstream response; must be
/// fed from a single consumer.
pub struct EventStreamParser {
    buffer: BytesMut,
    partial_tools: HashMap<String, PartialToolCall>,
    /// toolUseIds in order of first appearance, for deterministic output
    tool_order: Vec<String>,
    completed_tools: Vec<ToolCall>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            partial_tools: HashMap::new(),
            tool_order: Vec::new(),
            completed_tools: Vec::new(),
        }
    }

    /// Feed raw bytes from the upstream body and collect any events that
    /// completed with this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<UpstreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.buffer.len() < PRELUDE_LEN {
                break;
            }

            let total_len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            let headers_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;

            let plausible = total_len >= PRELUDE_LEN + TRAILER_LEN
                && total_len <= MAX_FRAME_LEN
                && headers_len <= total_len - PRELUDE_LEN - TRAILER_LEN;

            if !plausible {
                // Corrupt or non-framed data: salvage the next JSON object
                match self.salvage_json() {
                    Salvage::Parsed(value) => {
                        if let Some(event) = self.map_payload(&value) {
                            events.push(event);
                        }
                        continue;
                    }
                    Salvage::NeedMore => break,
                    Salvage::Nothing => break,
                }
            }

            if self.buffer.len() < total_len {
                break;
            }

            let payload_start = PRELUDE_LEN + headers_len;
            let payload_end = total_len - TRAILER_LEN;
            let payload = &self.buffer[payload_start..payload_end];

            match serde_json::from_slice::<Value>(payload) {
                Ok(value) => {
                    if let Some(event) = self.map_payload(&value) {
                        events.push(event);
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping malformed upstream frame: {}", e);
                }
            }

            self.buffer.advance(total_len);
        }

        events
    }

    /// Tool calls completed so far, plus any still-open assemblies flushed
    /// in arrival order. Call after the stream closes.
    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        let mut calls = std::mem::take(&mut self.completed_tools);
        for id in self.tool_order.drain(..) {
            if let Some(partial) = self.partial_tools.remove(&id) {
                calls.push(ToolCall {
                    id,
                    name: partial.name,
                    arguments: partial.arguments,
                });
            }
        }
        calls
    }

    /// Map a decoded payload object onto a typed event by key presence.
    ///
    /// Tool-call fragments are absorbed into the assembler and only emit
    /// once the frame carries the stop marker.
    fn map_payload(&mut self, value: &Value) -> Option<UpstreamEvent> {
        let obj = value.as_object()?;

        if let Some(id) = obj.get("toolUseId").and_then(|v| v.as_str()) {
            let id = id.to_string();
            if !self.partial_tools.contains_key(&id) {
                self.tool_order.push(id.clone());
            }
            let partial = self.partial_tools.entry(id.clone()).or_default();
            if let Some(name) = obj.get("name").and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    partial.name = name.to_string();
                }
            }
            if let Some(input) = obj.get("input") {
                match input {
                    Value::String(fragment) => partial.arguments.push_str(fragment),
                    other => partial.arguments.push_str(&other.to_string()),
                }
            }
            if obj.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                let partial = self.partial_tools.remove(&id)?;
                self.tool_order.retain(|t| t != &id);
                let call = ToolCall {
                    id,
                    name: partial.name,
                    arguments: partial.arguments,
                };
                self.completed_tools.push(call.clone());
                return Some(UpstreamEvent::ToolCall(call));
            }
            return None;
        }

        if let Some(content) = obj.get("content").and_then(|v| v.as_str()) {
            return Some(UpstreamEvent::Content(content.to_string()));
        }

        if let Some(percent) = obj.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
            return Some(UpstreamEvent::ContextUsage(percent));
        }

        if let Some(usage) = obj.get("usage").and_then(|v| v.as_f64()) {
            return Some(UpstreamEvent::Usage(usage));
        }

        if let Some(kind) = obj
            .get("exceptionType")
            .or_else(|| obj.get("__type"))
            .and_then(|v| v.as_str())
        {
            return Some(UpstreamEvent::Exception(kind.to_string()));
        }

        None
    }

    /// Scan for a brace-balanced JSON object when the frame prelude is
    /// implausible. Quote- and escape-aware so braces inside strings do
    /// not unbalance the scan.
    fn salvage_json(&mut self) -> Salvage {
        let start = match self.buffer.iter().position(|&b| b == b'{') {
            Some(pos) => pos,
            None => {
                self.buffer.clear();
                return Salvage::Nothing;
            }
        };

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &byte) in self.buffer[start..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match byte {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let end = start + offset + 1;
                        let parsed = serde_json::from_slice::<Value>(&self.buffer[start..end]);
                        self.buffer.advance(end);
                        return match parsed {
                            Ok(value) => Salvage::Parsed(value),
                            Err(e) => {
                                tracing::warn!("Dropping unsalvageable payload: {}", e);
                                Salvage::Nothing
                            }
                        };
                    }
                }
                _ => {}
            }
        }

        // Unbalanced so far; drop any garbage before the brace and wait
        if start > 0 {
            self.buffer.advance(start);
        }
        Salvage::NeedMore
    }
}

enum Salvage {
    Parsed(Value),
    NeedMore,
    Nothing,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan assembled content for bracket-style inline tool calls.
///
/// Some upstream responses emit tool calls as text of the form
/// `[Called NAME with args: {...}]` instead of framed toolUseEvents.
/// Runs as a second pass after the stream closes.
pub fn parse_bracket_tool_calls(content: &str) -> Vec<ToolCall> {
    let re = match regex::Regex::new(r"(?s)\[Called (\w+) with args: (\{.*?\})\]") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };

    re.captures_iter(content)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_string();
            let args = caps.get(2)?.as_str();
            // Skip fragments that are not actually valid JSON
            if serde_json::from_str::<Value>(args).is_err() {
                return None;
            }
            let id = format!(
                "toolu_{}",
                &uuid::Uuid::new_v4().simple().to_string()[..20]
            );
            Some(ToolCall {
                id,
                name,
                arguments: args.to_string(),
            })
        })
        .collect()
}

/// Remove tool calls with duplicate ids, keeping the first occurrence.
pub fn deduplicate_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .filter(|call| seen.insert(call.id.clone()))
        .collect()
}
