use crate::chat::ChatSegment;

pub const DEFAULT_START_TAG: &str = "<think>";
pub const DEFAULT_END_TAG: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Undecided,
    Think,
    Answer,
}

/// Incremental filter that reclassifies a plain text stream into reasoning
/// and answer segments when the provider inlines reasoning between a start
/// tag and an end tag. Input arrives in arbitrary fragments; tags split
/// across fragment boundaries are handled by retaining the longest suffix of
/// the buffered text that is still a prefix of the end tag, so no byte is
/// ever emitted twice or dropped.
#[derive(Debug)]
pub struct ThinkTagParser {
    start_tag: String,
    end_tag: String,
    mode: Mode,
    pre_buffer: String,
    think_buffer: String,
}

impl Default for ThinkTagParser {
    fn default() -> Self {
        Self::new(DEFAULT_START_TAG, DEFAULT_END_TAG)
    }
}

impl ThinkTagParser {
    pub fn new(start_tag: impl Into<String>, end_tag: impl Into<String>) -> Self {
        Self {
            start_tag: start_tag.into(),
            end_tag: end_tag.into(),
            mode: Mode::Undecided,
            pre_buffer: String::new(),
            think_buffer: String::new(),
        }
    }

    /// Routes one upstream segment through the filter. Non-text segments pass
    /// through untouched.
    pub fn filter_segment(&mut self, segment: ChatSegment) -> Vec<ChatSegment> {
        match segment {
            ChatSegment::Text { text } => self.push(&text),
            other => vec![other],
        }
    }

    /// Feeds one text fragment, returning any segments that are now decided.
    pub fn push(&mut self, token: &str) -> Vec<ChatSegment> {
        let mut out = Vec::new();
        let mut token = token.to_string();

        if self.mode == Mode::Undecided {
            self.pre_buffer.push_str(&token);

            if self.pre_buffer.len() > self.start_tag.len() {
                if self.pre_buffer.starts_with(&self.start_tag) {
                    self.mode = Mode::Think;
                    token = self.pre_buffer[self.start_tag.len()..].to_string();
                    self.pre_buffer.clear();
                } else {
                    self.mode = Mode::Answer;
                    out.push(ChatSegment::from_text(std::mem::take(
                        &mut self.pre_buffer,
                    )));
                    return out;
                }
            } else if self.pre_buffer == self.start_tag {
                self.mode = Mode::Think;
                self.pre_buffer.clear();
                return out;
            } else if !self.start_tag.starts_with(self.pre_buffer.as_str()) {
                self.mode = Mode::Answer;
                out.push(ChatSegment::from_text(std::mem::take(
                    &mut self.pre_buffer,
                )));
                return out;
            } else {
                return out;
            }
        }

        if self.mode == Mode::Answer {
            if !token.is_empty() {
                out.push(ChatSegment::from_text(token));
            }
            return out;
        }

        if token.is_empty() {
            return out;
        }

        self.think_buffer.push_str(&token);
        while !self.think_buffer.is_empty() {
            if let Some(index) = self.think_buffer.find(&self.end_tag) {
                if index > 0 {
                    out.push(ChatSegment::from_think(&self.think_buffer[..index]));
                }
                let after_end = &self.think_buffer[index + self.end_tag.len()..];
                if !after_end.is_empty() {
                    out.push(ChatSegment::from_text(after_end));
                }
                self.think_buffer.clear();
                self.mode = Mode::Answer;
                break;
            }

            let overlap = tail_overlap(&self.think_buffer, &self.end_tag);
            let emit_len = self.think_buffer.len() - overlap;
            if emit_len == 0 {
                break;
            }
            out.push(ChatSegment::from_think(&self.think_buffer[..emit_len]));
            self.think_buffer.drain(..emit_len);
        }

        out
    }

    /// Flushes whatever is still buffered at stream end. An undecided prefix
    /// is emitted verbatim as text so bytes are never silently dropped.
    pub fn finish(&mut self) -> Vec<ChatSegment> {
        let mut out = Vec::new();
        if self.mode == Mode::Undecided && !self.pre_buffer.is_empty() {
            out.push(ChatSegment::from_text(std::mem::take(
                &mut self.pre_buffer,
            )));
        }
        if self.mode == Mode::Think && !self.think_buffer.is_empty() {
            out.push(ChatSegment::from_think(std::mem::take(
                &mut self.think_buffer,
            )));
        }
        out
    }
}

/// Length of the longest suffix of `s` that is a prefix of `pattern`.
fn tail_overlap(s: &str, pattern: &str) -> usize {
    let max = s.len().min(pattern.len());
    for len in (1..=max).rev() {
        if !pattern.is_char_boundary(len) {
            continue;
        }
        if s.ends_with(&pattern[..len]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::segment::merge_all;

    fn run(fragments: &[&str]) -> Vec<ChatSegment> {
        let mut parser = ThinkTagParser::default();
        let mut out = Vec::new();
        for frag in fragments {
            out.extend(parser.push(frag));
        }
        out.extend(parser.finish());
        merge_all(out)
    }

    #[test]
    fn splits_reasoning_from_answer_across_fragments() {
        let out = run(&["<th", "ink>reason", "ing</thi", "nk>answer"]);
        assert_eq!(
            out,
            vec![
                ChatSegment::from_think("reasoning"),
                ChatSegment::from_text("answer"),
            ]
        );
    }

    #[test]
    fn plain_text_passes_through() {
        let out = run(&["hello ", "world"]);
        assert_eq!(out, vec![ChatSegment::from_text("hello world")]);
    }

    #[test]
    fn text_that_looks_like_tag_prefix_flushes_at_end() {
        // Stream ends while the buffer is still a prefix of "<think>".
        let out = run(&["<thi"]);
        assert_eq!(out, vec![ChatSegment::from_text("<thi")]);
    }

    #[test]
    fn unterminated_think_flushes_as_think() {
        let out = run(&["<think>no end tag here"]);
        assert_eq!(out, vec![ChatSegment::from_think("no end tag here")]);
    }

    #[test]
    fn end_tag_split_at_every_byte_offset_classifies_identically() {
        let input = "<think>reasoning</think>answer";
        let expected = run(&[input]);
        assert_eq!(
            expected,
            vec![
                ChatSegment::from_think("reasoning"),
                ChatSegment::from_text("answer"),
            ]
        );
        for split in 1..input.len() {
            let out = run(&[&input[..split], &input[split..]]);
            assert_eq!(out, expected, "split at {split}");
        }
    }

    #[test]
    fn byte_conservation_for_every_fragmentation_of_small_input() {
        // Every two-cut fragmentation of an input with a fake-out "</th" in
        // the reasoning body.
        let input = "<think>a</thb</think>ok";
        for i in 1..input.len() {
            for j in i..input.len() {
                let out = run(&[&input[..i], &input[i..j], &input[j..]]);
                let think: String = out
                    .iter()
                    .filter_map(|s| match s {
                        ChatSegment::Think { think, .. } => Some(think.as_str()),
                        _ => None,
                    })
                    .collect();
                let text: String = out
                    .iter()
                    .filter_map(|s| match s {
                        ChatSegment::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(think, "a</thb", "cuts at {i},{j}");
                assert_eq!(text, "ok", "cuts at {i},{j}");
            }
        }
    }

    #[test]
    fn non_text_segments_pass_through_untouched() {
        let mut parser = ThinkTagParser::default();
        let usage = ChatSegment::from_usage(Default::default());
        assert_eq!(parser.filter_segment(usage.clone()), vec![usage]);
    }

    #[test]
    fn only_first_think_block_is_extracted() {
        let out = run(&["<think>one</think>mid<think>literal"]);
        assert_eq!(
            out,
            vec![
                ChatSegment::from_think("one"),
                ChatSegment::from_text("mid<think>literal"),
            ]
        );
    }

    #[test]
    fn custom_tags() {
        let mut parser = ThinkTagParser::new("<reasoning>", "</reasoning>");
        let mut out = Vec::new();
        out.extend(parser.push("<reasoning>deep"));
        out.extend(parser.push("</reasoning>done"));
        out.extend(parser.finish());
        assert_eq!(
            merge_all(out),
            vec![
                ChatSegment::from_think("deep"),
                ChatSegment::from_text("done"),
            ]
        );
    }
}
