use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use maestro_core::config::MAX_LINE_BYTES;

use crate::events::{AgentEvent, BlockKind, ContentBlock};

/// Incremental decoder for the assistant's newline-framed stdout stream.
///
/// Pure state machine: `feed` bytes in, typed events out, `finish` for the
/// trailing unterminated line. Framing splits on `\r?\n`; a line exceeding
/// [`MAX_LINE_BYTES`] is dropped and the accumulator reset.
pub struct EventDecoder {
    buf: Vec<u8>,
    /// Current line blew the cap; discard bytes until the next newline.
    overflow: bool,
    /// Block indexes already covered by streamed deltas. Reset on each
    /// MessageStart so a complete AssistantMessage does not re-emit them.
    delta_indexes: HashSet<u32>,
    /// Any text reached the consumer this invocation. Drives the `"\n\n"`
    /// separator on the next text block start.
    emitted_text: bool,
    token_regex: Regex,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            overflow: false,
            delta_indexes: HashSet::new(),
            emitted_text: false,
            token_regex: Regex::new(r#""session_id"\s*:\s*"([0-9a-fA-F][0-9a-fA-F-]{7,})""#)
                .expect("static regex"),
        }
    }

    /// Consume a chunk of stdout bytes, returning all fully framed events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if self.overflow {
                    self.overflow = false;
                } else {
                    let mut line = std::mem::take(&mut self.buf);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    self.decode_line(&line, &mut out);
                }
                continue;
            }
            if self.overflow {
                continue;
            }
            self.buf.push(b);
            if self.buf.len() > MAX_LINE_BYTES {
                debug!(len = self.buf.len(), "line exceeded cap, dropping");
                self.buf.clear();
                self.overflow = true;
            }
        }
        out
    }

    /// Flush the trailing line. Unparseable trailing bytes pass through as
    /// plain text. This is the only point where that is allowed.
    pub fn finish(mut self) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        if self.overflow || self.buf.is_empty() {
            return out;
        }
        let line = std::mem::take(&mut self.buf);
        let before = out.len();
        self.decode_line(&line, &mut out);
        if out.len() == before {
            let text = String::from_utf8_lossy(&line).into_owned();
            if !text.trim().is_empty() {
                out.push(AgentEvent::TextDelta { index: 0, text });
            }
        }
        out
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<AgentEvent>) {
        let text = match std::str::from_utf8(line) {
            Ok(t) => t.trim(),
            Err(_) => return,
        };
        if text.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, len = text.len(), "unparseable stream line");
                // Salvage: a crashing child sometimes dumps its resume token
                // inside otherwise-broken output.
                if let Some(cap) = self.token_regex.captures(text) {
                    out.push(AgentEvent::SessionAssigned {
                        token: cap[1].to_string(),
                    });
                }
                return;
            }
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("system") => self.decode_system(&value, out),
            Some("stream_event") => {
                if let Some(event) = value.get("event") {
                    self.decode_stream_event(event, out);
                }
            }
            Some("assistant") => self.decode_assistant(&value, out),
            Some("result") => {
                let subtype = value
                    .get("subtype")
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let num_turns = value
                    .get("num_turns")
                    .and_then(|n| n.as_u64())
                    .unwrap_or(0) as u32;
                let budget = value.get("usage").cloned().or_else(|| {
                    value
                        .get("total_cost_usd")
                        .map(|c| serde_json::json!({ "total_cost_usd": c }))
                });
                if let Some(sid) = value.get("session_id").and_then(|s| s.as_str()) {
                    out.push(AgentEvent::SessionAssigned {
                        token: sid.to_string(),
                    });
                }
                out.push(AgentEvent::TurnResult {
                    subtype,
                    num_turns,
                    budget,
                });
            }
            Some("rate_limit") | Some("rate_limit_event") => {
                let info = value
                    .get("rate_limit")
                    .or_else(|| value.get("info"))
                    .cloned()
                    .unwrap_or_else(|| value.clone());
                out.push(AgentEvent::RateLimit { info });
            }
            // Anthropic-shaped lines without the CLI wrapper.
            Some("message_start") | Some("content_block_start") | Some("content_block_delta")
            | Some("content_block_stop") | Some("message_delta") | Some("message_stop") => {
                self.decode_stream_event(&value, out);
            }
            _ => out.push(AgentEvent::Unknown {
                raw: text.to_string(),
            }),
        }
    }

    fn decode_system(&mut self, value: &Value, out: &mut Vec<AgentEvent>) {
        match value.get("subtype").and_then(|s| s.as_str()) {
            Some("init") => {
                if let Some(sid) = value.get("session_id").and_then(|s| s.as_str()) {
                    out.push(AgentEvent::SessionAssigned {
                        token: sid.to_string(),
                    });
                }
            }
            Some("rate_limit") => out.push(AgentEvent::RateLimit {
                info: value.clone(),
            }),
            _ => {}
        }
    }

    fn decode_stream_event(&mut self, event: &Value, out: &mut Vec<AgentEvent>) {
        let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32;
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                self.delta_indexes.clear();
                out.push(AgentEvent::MessageStart);
            }
            Some("content_block_start") => {
                let kind = event
                    .pointer("/content_block/type")
                    .and_then(|t| t.as_str())
                    .map(BlockKind::from_wire)
                    .unwrap_or(BlockKind::Other);
                out.push(AgentEvent::BlockStart { index, kind });
                // Keep post-tool (and multi-block) text from visually
                // concatenating with earlier prose.
                if kind == BlockKind::Text && self.emitted_text {
                    out.push(AgentEvent::TextDelta {
                        index,
                        text: "\n\n".to_string(),
                    });
                }
            }
            Some("content_block_delta") => {
                match event.pointer("/delta/type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = event.pointer("/delta/text").and_then(|t| t.as_str()) {
                            self.delta_indexes.insert(index);
                            self.emitted_text = true;
                            out.push(AgentEvent::TextDelta {
                                index,
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) =
                            event.pointer("/delta/thinking").and_then(|t| t.as_str())
                        {
                            out.push(AgentEvent::ThinkingDelta {
                                index,
                                text: text.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn decode_assistant(&mut self, value: &Value, out: &mut Vec<AgentEvent>) {
        let Some(content) = value.pointer("/message/content").and_then(|c| c.as_array()) else {
            return;
        };
        let mut blocks = Vec::new();
        for (i, block) in content.iter().enumerate() {
            let index = i as u32;
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if self.delta_indexes.contains(&index) {
                        continue; // already streamed
                    }
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        blocks.push(ContentBlock {
                            index,
                            kind: BlockKind::Text,
                            text: text.to_string(),
                        });
                        self.emitted_text = true;
                    }
                }
                Some("tool_use") => {
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    out.push(AgentEvent::ToolUse { name, input });
                }
                _ => {}
            }
        }
        if !blocks.is_empty() {
            out.push(AgentEvent::AssistantMessage { blocks });
        }
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(dec: &mut EventDecoder, s: &str) -> Vec<AgentEvent> {
        dec.feed(s.as_bytes())
    }

    #[test]
    fn init_line_yields_session_assigned() {
        let mut dec = EventDecoder::new();
        let events = feed_str(
            &mut dec,
            "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"abc-123\"}\n",
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::SessionAssigned { token }] if token == "abc-123"
        ));
    }

    #[test]
    fn line_split_across_feeds() {
        let mut dec = EventDecoder::new();
        let full = "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"xyz\"}\n";
        let (a, b) = full.split_at(20);
        assert!(feed_str(&mut dec, a).is_empty());
        let events = feed_str(&mut dec, b);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn crlf_framing() {
        let mut dec = EventDecoder::new();
        let events = feed_str(
            &mut dec,
            "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"crlf\"}\r\n",
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::SessionAssigned { token }] if token == "crlf"
        ));
    }

    #[test]
    fn oversize_line_is_dropped_without_crash() {
        let mut dec = EventDecoder::new();
        // One byte past the cap, no newline yet.
        let big = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(dec.feed(&big).is_empty());
        // The rest of the oversize line is discarded up to its newline,
        // and the following line decodes normally.
        let events = feed_str(
            &mut dec,
            "tail\n{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"ok\"}\n",
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::SessionAssigned { token }] if token == "ok"
        ));
    }

    #[test]
    fn text_deltas_suppress_duplicate_assistant_blocks() {
        let mut dec = EventDecoder::new();
        feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"message_start\"}}\n");
        let events = feed_str(
            &mut dec,
            "{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}}\n",
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::TextDelta { index: 0, text }] if text == "hello"
        ));

        // The complete message lists block 0 again; it must not re-emit.
        let events = feed_str(
            &mut dec,
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hello\"}]}}\n",
        );
        assert!(events.is_empty(), "covered block re-emitted: {events:?}");
    }

    #[test]
    fn uncovered_assistant_blocks_still_emit() {
        let mut dec = EventDecoder::new();
        let events = feed_str(
            &mut dec,
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"direct\"}]}}\n",
        );
        match events.as_slice() {
            [AgentEvent::AssistantMessage { blocks }] => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].text, "direct");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn separator_after_tool_interleaved_text() {
        let mut dec = EventDecoder::new();
        // First message streams text at index 0.
        feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"message_start\"}}\n");
        feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\"}}}\n");
        feed_str(
            &mut dec,
            "{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"before tool\"}}}\n",
        );
        // Tool runs, then a new message starts with index reset to 0.
        feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"message_start\"}}\n");
        let events = feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\"}}}\n");
        let sep: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(sep, vec!["\n\n"], "expected separator, got {events:?}");
    }

    #[test]
    fn no_separator_before_first_text() {
        let mut dec = EventDecoder::new();
        feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"message_start\"}}\n");
        let events = feed_str(&mut dec, "{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\"}}}\n");
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, AgentEvent::TextDelta { .. })),
            "no separator expected before any text: {events:?}"
        );
    }

    #[test]
    fn tool_use_block_emits_event() {
        let mut dec = EventDecoder::new();
        let events = feed_str(
            &mut dec,
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Bash\",\"input\":{\"cmd\":\"ls\"}}]}}\n",
        );
        match events.as_slice() {
            [AgentEvent::ToolUse { name, input }] => {
                assert_eq!(name, "Bash");
                assert_eq!(input["cmd"], "ls");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn result_line_parses_subtype_and_turns() {
        let mut dec = EventDecoder::new();
        let events = feed_str(
            &mut dec,
            "{\"type\":\"result\",\"subtype\":\"error_max_turns\",\"num_turns\":25,\"usage\":{\"output_tokens\":9}}\n",
        );
        match events.as_slice() {
            [AgentEvent::TurnResult {
                subtype,
                num_turns,
                budget,
            }] => {
                assert_eq!(subtype, "error_max_turns");
                assert_eq!(*num_turns, 25);
                assert!(budget.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn broken_line_salvages_resume_token() {
        let mut dec = EventDecoder::new();
        let events = feed_str(
            &mut dec,
            "panic! partial dump \"session_id\": \"deadbeef-1234\" trailing garbage{{{\n",
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::SessionAssigned { token }] if token == "deadbeef-1234"
        ));
    }

    #[test]
    fn unknown_json_passes_as_unknown() {
        let mut dec = EventDecoder::new();
        let events = feed_str(&mut dec, "{\"type\":\"telemetry\",\"n\":1}\n");
        assert!(matches!(events.as_slice(), [AgentEvent::Unknown { .. }]));
    }

    #[test]
    fn finish_flushes_trailing_plain_text() {
        let mut dec = EventDecoder::new();
        assert!(feed_str(&mut dec, "left over without newline").is_empty());
        let events = dec.finish();
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::TextDelta { text, .. }] if text == "left over without newline"
        ));
    }

    #[test]
    fn finish_on_empty_stream_is_silent() {
        let dec = EventDecoder::new();
        assert!(dec.finish().is_empty());
    }
}
