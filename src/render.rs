//! Splits message text into plain prose and fenced code blocks for display.

use lazy_static::lazy_static;
use regex::{ Matches, Regex };
use serde::Serialize;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"```[\s\S]*?```").expect("code fence pattern compiles");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Code {
        language: Option<&'a str>,
        code: &'a str,
    },
}

/// Owned form of [`Segment`], for sending to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderedSegment {
    Text {
        text: String,
    },
    Code {
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
}

impl From<Segment<'_>> for RenderedSegment {
    fn from(segment: Segment<'_>) -> Self {
        match segment {
            Segment::Text(text) => RenderedSegment::Text { text: text.to_string() },
            Segment::Code { language, code } =>
                RenderedSegment::Code {
                    language: language.map(str::to_string),
                    code: code.to_string(),
                },
        }
    }
}

/// Lazy iterator over the segments of one piece of content. Call
/// [`segments`] again to start over.
pub struct Segments<'a> {
    content: &'a str,
    fences: Matches<'static, 'a>,
    cursor: usize,
    pending_fence: Option<(usize, usize)>,
}

pub fn segments(content: &str) -> Segments<'_> {
    Segments {
        content,
        fences: CODE_FENCE.find_iter(content),
        cursor: 0,
        pending_fence: None,
    }
}

pub fn render(content: &str) -> Vec<RenderedSegment> {
    segments(content).map(RenderedSegment::from).collect()
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((start, end)) = self.pending_fence.take() {
            self.cursor = end;
            return Some(code_block(&self.content[start..end]));
        }

        match self.fences.next() {
            Some(fence) => {
                if fence.start() > self.cursor {
                    let text = &self.content[self.cursor..fence.start()];
                    self.pending_fence = Some((fence.start(), fence.end()));
                    self.cursor = fence.start();
                    Some(Segment::Text(text))
                } else {
                    self.cursor = fence.end();
                    Some(code_block(fence.as_str()))
                }
            }
            None => {
                if self.cursor < self.content.len() {
                    let text = &self.content[self.cursor..];
                    self.cursor = self.content.len();
                    Some(Segment::Text(text))
                } else {
                    None
                }
            }
        }
    }
}

/// Strips the fences of a matched block. An opening fence followed by a
/// language tag and a newline drops that whole line.
fn code_block(block: &str) -> Segment<'_> {
    let inner = &block[3..block.len() - 3];
    let tag_len = inner
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '#')))
        .unwrap_or(inner.len());

    let (language, body) = if inner[tag_len..].starts_with('\n') {
        let tag = &inner[..tag_len];
        (Some(tag).filter(|t| !t.is_empty()), &inner[tag_len + 1..])
    } else {
        (None, inner)
    };

    Segment::Code { language, code: body.trim() }
}
