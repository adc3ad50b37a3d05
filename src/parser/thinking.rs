// Thinking-tag streaming parser
//
// Splits a streaming text channel into text and thinking segments,
// detecting <thinking>...</thinking> tags that may straddle chunk
// boundaries. Implemented as an explicit state machine over a carry
// buffer: a regex over accumulated text cannot stay partial-tag safe
// on chunked input.

const THINKING_START_TAG: &str = "<thinking>";
const THINKING_END_TAG: &str = "</thinking>";

/// Which channel a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Thinking,
}

/// A contiguous run of content in one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub content: String,
}

/// Incremental tag parser. States: TEXT (initial) and THINKING.
///
/// If the buffer ends with a prefix of the awaited tag (e.g. `...<thi`),
/// that suffix is retained and not emitted until more input arrives or
/// `flush()` is called. No byte is ever lost.
pub struct ThinkingTagParser {
    buffer: String,
    in_thinking: bool,
}

impl ThinkingTagParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            in_thinking: false,
        }
    }

    /// Whether the parser is currently inside a thinking block.
    pub fn is_thinking(&self) -> bool {
        self.in_thinking
    }

    /// Push new text and parse it into segments.
    pub fn push(&mut self, text: &str) -> Vec<Segment> {
        self.buffer.push_str(text);
        self.parse_buffer()
    }

    fn parse_buffer(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();

        loop {
            if self.buffer.is_empty() {
                break;
            }

            let (tag, kind) = if self.in_thinking {
                (THINKING_END_TAG, SegmentKind::Thinking)
            } else {
                (THINKING_START_TAG, SegmentKind::Text)
            };

            if let Some(idx) = self.buffer.find(tag) {
                if idx > 0 {
                    segments.push(Segment {
                        kind,
                        content: self.buffer[..idx].to_string(),
                    });
                }
                self.buffer.drain(..idx + tag.len());
                self.in_thinking = !self.in_thinking;
                continue;
            }

            // No complete tag; retain any suffix that could be its prefix
            let partial = partial_tag_suffix(&self.buffer, tag);
            let safe_len = self.buffer.len() - partial;
            if safe_len > 0 {
                segments.push(Segment {
                    kind,
                    content: self.buffer[..safe_len].to_string(),
                });
            }
            self.buffer.drain(..safe_len);
            break;
        }

        segments
    }

    /// Emit whatever remains in the buffer in the current state.
    /// Call when the stream ends.
    pub fn flush(&mut self) -> Vec<Segment> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let kind = if self.in_thinking {
            SegmentKind::Thinking
        } else {
            SegmentKind::Text
        };
        let content = std::mem::take(&mut self.buffer);
        vec![Segment { kind, content }]
    }
}

impl Default for ThinkingTagParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest proper prefix of `tag` that `text` ends with.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    for len in (1..tag.len()).rev() {
        if text.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

/// Lifecycle action for a channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingAction {
    Start,
    Delta,
    Stop,
}

/// A channel event ready for SSE translation.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingEvent {
    pub kind: SegmentKind,
    pub action: ThinkingAction,
    pub content: String,
}

/// Converts parsed segments into start/delta/stop events, tracking the
/// open-block state across chunks. When thinking mode is disabled for
/// the request, content passes through untouched as text deltas.
pub struct ThinkingStreamHandler {
    parser: ThinkingTagParser,
    enabled: bool,
    thinking_open: bool,
}

impl ThinkingStreamHandler {
    pub fn new(enabled: bool) -> Self {
        Self {
            parser: ThinkingTagParser::new(),
            enabled,
            thinking_open: false,
        }
    }

    /// Process a content chunk into channel events.
    pub fn process(&mut self, content: &str) -> Vec<ThinkingEvent> {
        if !self.enabled {
            if content.is_empty() {
                return Vec::new();
            }
            return vec![ThinkingEvent {
                kind: SegmentKind::Text,
                action: ThinkingAction::Delta,
                content: content.to_string(),
            }];
        }

        let segments = self.parser.push(content);
        let mut events = self.events_for(segments);

        // A closing tag with nothing after it leaves no trailing text
        // segment, so close the block off the parser state.
        if self.thinking_open && !self.parser.is_thinking() {
            events.push(ThinkingEvent {
                kind: SegmentKind::Thinking,
                action: ThinkingAction::Stop,
                content: String::new(),
            });
            self.thinking_open = false;
        }

        events
    }

    /// Drain remaining buffered content. Call when the stream ends.
    pub fn flush(&mut self) -> Vec<ThinkingEvent> {
        if !self.enabled {
            return Vec::new();
        }
        let segments = self.parser.flush();
        let mut events = self.events_for(segments);
        if self.thinking_open {
            events.push(ThinkingEvent {
                kind: SegmentKind::Thinking,
                action: ThinkingAction::Stop,
                content: String::new(),
            });
            self.thinking_open = false;
        }
        events
    }

    fn events_for(&mut self, segments: Vec<Segment>) -> Vec<ThinkingEvent> {
        let mut events = Vec::new();
        for segment in segments {
            match segment.kind {
                SegmentKind::Thinking => {
                    if !self.thinking_open {
                        events.push(ThinkingEvent {
                            kind: SegmentKind::Thinking,
                            action: ThinkingAction::Start,
                            content: String::new(),
                        });
                        self.thinking_open = true;
                    }
                    if !segment.content.is_empty() {
                        events.push(ThinkingEvent {
                            kind: SegmentKind::Thinking,
                            action: ThinkingAction::Delta,
                            content: segment.content,
                        });
                    }
                }
                SegmentKind::Text => {
                    if self.thinking_open {
                        events.push(ThinkingEvent {
                            kind: SegmentKind::Thinking,
                            action: ThinkingAction::Stop,
                            content: String::new(),
                        });
                        self.thinking_open = false;
                    }
                    if !segment.content.is_empty() {
                        events.push(ThinkingEvent {
                            kind: SegmentKind::Text,
                            action: ThinkingAction::Delta,
                            content: segment.content,
                        });
                    }
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content: &str) -> Segment {
        Segment { kind: SegmentKind::Text, content: content.to_string() }
    }

    fn thinking(content: &str) -> Segment {
        Segment { kind: SegmentKind::Thinking, content: content.to_string() }
    }

    #[test]
    fn test_plain_text_passthrough() {
        let mut parser = ThinkingTagParser::new();
        assert_eq!(parser.push("hello world"), vec![text("hello world")]);
    }

    #[test]
    fn test_complete_thinking_block() {
        let mut parser = ThinkingTagParser::new();
        let segments = parser.push("a<thinking>b</thinking>c");
        assert_eq!(segments, vec![text("a"), thinking("b"), text("c")]);
        assert!(!parser.is_thinking());
    }

    #[test]
    fn test_tag_split_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        let first = parser.push("hello <thi");
        // "hello " is safe; "<thi" retained as a potential tag prefix
        assert_eq!(first, vec![text("hello ")]);

        let second = parser.push("nking>secret</thinking>world");
        assert_eq!(second, vec![thinking("secret"), text("world")]);
    }

    #[test]
    fn test_end_tag_split_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        parser.push("<thinking>deep");
        let segments = parser.push(" thought</thin");
        assert_eq!(segments, vec![thinking(" thought")]);
        let segments = parser.push("king>after");
        assert_eq!(segments, vec![text("after")]);
    }

    #[test]
    fn test_every_split_position_preserves_interior() {
        // For any split of the input, exactly the original interior
        // bytes come out as thinking content.
        let input = "pre<thinking>interior bytes</thinking>post";
        for split in 0..=input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let mut parser = ThinkingTagParser::new();
            let mut segments = parser.push(&input[..split]);
            segments.extend(parser.push(&input[split..]));
            segments.extend(parser.flush());

            let thinking_content: String = segments
                .iter()
                .filter(|s| s.kind == SegmentKind::Thinking)
                .map(|s| s.content.as_str())
                .collect();
            let text_content: String = segments
                .iter()
                .filter(|s| s.kind == SegmentKind::Text)
                .map(|s| s.content.as_str())
                .collect();

            assert_eq!(thinking_content, "interior bytes", "split at {}", split);
            assert_eq!(text_content, "prepost", "split at {}", split);
        }
    }

    #[test]
    fn test_flush_in_thinking_state() {
        let mut parser = ThinkingTagParser::new();
        parser.push("<thinking>unterminated");
        assert_eq!(parser.flush(), vec![thinking("unterminated")]);
    }

    #[test]
    fn test_false_prefix_eventually_emitted() {
        let mut parser = ThinkingTagParser::new();
        let first = parser.push("a <think");
        assert_eq!(first, vec![text("a ")]);
        // "<think" turns out not to be a tag
        let second = parser.push("er toy");
        assert_eq!(second, vec![text("<thinker toy")]);
    }

    #[test]
    fn test_handler_emits_start_delta_stop() {
        let mut handler = ThinkingStreamHandler::new(true);
        let events = handler.process("x<thinking>y</thinking>z");

        let actions: Vec<(SegmentKind, ThinkingAction)> =
            events.iter().map(|e| (e.kind, e.action)).collect();
        assert_eq!(
            actions,
            vec![
                (SegmentKind::Text, ThinkingAction::Delta),
                (SegmentKind::Thinking, ThinkingAction::Start),
                (SegmentKind::Thinking, ThinkingAction::Delta),
                (SegmentKind::Thinking, ThinkingAction::Stop),
                (SegmentKind::Text, ThinkingAction::Delta),
            ]
        );
    }

    #[test]
    fn test_handler_single_start_stop_pair_across_chunks() {
        let mut handler = ThinkingStreamHandler::new(true);
        let mut events = handler.process("<thinking>part one ");
        events.extend(handler.process("part two</thinking>"));
        events.extend(handler.flush());

        let starts = events.iter().filter(|e| e.action == ThinkingAction::Start).count();
        let stops = events.iter().filter(|e| e.action == ThinkingAction::Stop).count();
        assert_eq!(starts, 1);
        assert_eq!(stops, 1);

        let content: String = events
            .iter()
            .filter(|e| e.kind == SegmentKind::Thinking && e.action == ThinkingAction::Delta)
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(content, "part one part two");
    }

    #[test]
    fn test_handler_disabled_passes_tags_through() {
        let mut handler = ThinkingStreamHandler::new(false);
        let events = handler.process("<thinking>raw</thinking>");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SegmentKind::Text);
        assert_eq!(events[0].content, "<thinking>raw</thinking>");
    }

    #[test]
    fn test_handler_flush_closes_open_block() {
        let mut handler = ThinkingStreamHandler::new(true);
        handler.process("<thinking>never closed");
        let events = handler.flush();
        assert!(events.iter().any(|e| e.action == ThinkingAction::Stop));
    }
}
