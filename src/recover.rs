//! Best-effort recovery of a JSON report from free-form agent output.
//!
//! The agent is told to answer with JSON only, but answers regularly arrive
//! wrapped in prose, and long streamed answers are sometimes cut off in the
//! middle of a `content` string. [`recover_json`] locates one candidate span,
//! patches the truncation patterns seen in practice and parses what is left.
//! Failure is an ordinary outcome and is reported as [`Recovered::Empty`].
//!
//! Rebalancing is a flat count of braces and brackets outside string
//! literals, not a nesting-aware repair: `{"a":[1,2` becomes `{"a":[1,2}]`
//! and still fails to parse. Inputs are near-valid truncated JSON, not
//! adversarial ones.

use memchr::{memchr, memrchr};
use serde_json::{Map, Value};

const CONTENT_KEY: &str = "\"content\":";
const INCOMPLETE: &str = "\"INCOMPLETE\"";
const PREVIEW_CHARS: usize = 600;

/// Outcome of [`recover_json`].
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered {
    /// The candidate was object-shaped and parsed.
    Object(Map<String, Value>),
    /// The candidate was array-shaped and parsed.
    Array(Vec<Value>),
    /// No candidate was found, or it still failed to parse after repair.
    Empty,
}

impl Recovered {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Recovered::Empty)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Recovered::Array(_))
    }

    /// Short label used in telemetry records.
    pub fn shape(&self) -> &'static str {
        match self {
            Recovered::Object(_) => "object",
            Recovered::Array(_) => "array",
            Recovered::Empty => "none",
        }
    }

    /// Collapse into a plain JSON value; `Empty` becomes `{}`.
    pub fn into_value(self) -> Value {
        match self {
            Recovered::Object(map) => Value::Object(map),
            Recovered::Array(items) => Value::Array(items),
            Recovered::Empty => Value::Object(Map::new()),
        }
    }
}

/// Locate, repair and parse the JSON object or array embedded in `text`.
///
/// An object-shaped span (first `{` up to the last `}`) is preferred over an
/// array-shaped one. Only when neither kind closes does the span run from the
/// opening delimiter to the end of the text, which is what a truncated stream
/// looks like.
pub fn recover_json(text: &str) -> Recovered {
    let text = text.trim();
    let Some((candidate, is_array)) = locate_candidate(text) else {
        tracing::debug!(len = text.len(), "no JSON span found in agent output");
        return Recovered::Empty;
    };
    tracing::trace!(is_array, len = candidate.len(), "located JSON candidate");

    let repaired = repair(candidate);
    tracing::trace!(repaired = %preview(&repaired), "repaired JSON candidate");

    match serde_json::from_str::<Value>(&repaired) {
        Ok(Value::Object(map)) => {
            tracing::debug!(keys = map.len(), "recovered JSON object");
            Recovered::Object(map)
        }
        Ok(Value::Array(items)) => {
            tracing::debug!(items = items.len(), "recovered JSON array");
            Recovered::Array(items)
        }
        Ok(_) => Recovered::Empty,
        Err(err) => {
            tracing::debug!(error = %err, json = %preview(&repaired), "candidate still invalid after repair");
            Recovered::Empty
        }
    }
}

/// Closed spans win over truncated ones: a complete object, then a complete
/// array, then whichever opening delimiter runs to the end of the text.
fn locate_candidate(text: &str) -> Option<(&str, bool)> {
    closed_span(text, b'{', b'}')
        .map(|s| (s, false))
        .or_else(|| closed_span(text, b'[', b']').map(|s| (s, true)))
        .or_else(|| open_span(text, b'{').map(|s| (s, false)))
        .or_else(|| open_span(text, b'[').map(|s| (s, true)))
}

fn closed_span(text: &str, open: u8, close: u8) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = memchr(open, bytes)?;
    let end = memrchr(close, bytes).filter(|&idx| idx > start)?;
    Some(&text[start..=end])
}

fn open_span(text: &str, open: u8) -> Option<&str> {
    memchr(open, text.as_bytes()).map(|start| &text[start..])
}

fn repair(candidate: &str) -> String {
    let mut fixed = patch_truncated_content(candidate);
    let tally = Tally::of(&fixed);
    if tally.in_string {
        // a trailing lone backslash would escape the closing quote
        if tally.escaped {
            fixed.pop();
        }
        fixed.push('"');
    }
    let mut fixed = strip_trailing_commas(&fixed);

    let tally = Tally::of(&fixed);
    for _ in tally.close_braces..tally.open_braces {
        fixed.push('}');
    }
    for _ in tally.close_brackets..tally.open_brackets {
        fixed.push(']');
    }
    fixed
}

/// Replace a `"content":` string value that never closes with `"INCOMPLETE"`.
///
/// Inside a content value an unescaped quote only ends the value when one of
/// `, } \n \r` follows within four characters, when the next non-blank
/// character closes the value, or when only whitespace follows. Any other
/// quote is treated as part of the text and copied through.
fn patch_truncated_content(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len() + INCOMPLETE.len());
    let mut rest = candidate;
    loop {
        let Some(pos) = rest.find(CONTENT_KEY) else {
            out.push_str(rest);
            return out;
        };
        let key_end = pos + CONTENT_KEY.len();
        out.push_str(&rest[..key_end]);
        let after_key = &rest[key_end..];
        let value = after_key.trim_start();
        let gap = &after_key[..after_key.len() - value.len()];

        if value.is_empty() {
            tracing::debug!("agent output ends after a content key");
            out.push_str(if gap.is_empty() { " " } else { gap });
            out.push_str(INCOMPLETE);
            return out;
        }
        if !value.starts_with('"') {
            rest = after_key;
            continue;
        }

        out.push_str(gap);
        match closing_quote(&value[1..]) {
            Some(idx) => {
                let stop = idx + 2;
                out.push_str(&value[..stop]);
                rest = &value[stop..];
            }
            None => {
                tracing::debug!(
                    dropped = value.len(),
                    "content value truncated, substituting placeholder"
                );
                out.push_str(INCOMPLETE);
                return out;
            }
        }
    }
}

/// Byte offset (within `body`, which starts after the opening quote) of the
/// quote that terminates a content value.
fn closing_quote(body: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' if terminates(&body[idx + 1..]) => return Some(idx),
            _ => {}
        }
    }
    None
}

fn terminates(after_quote: &str) -> bool {
    let near = after_quote
        .chars()
        .take(4)
        .any(|c| matches!(c, ',' | '}' | '\n' | '\r'));
    near || matches!(
        after_quote.trim_start().chars().next(),
        None | Some(',' | '}' | ']')
    )
}

/// Drop every comma that is followed, ignoring whitespace, by a closing
/// brace/bracket or by the end of the text.
fn strip_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut lexer = Lexer::default();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (idx, &b) in bytes.iter().enumerate() {
        if lexer.structural(b) && b == b',' && closes_or_ends(&bytes[idx + 1..]) {
            out.push_str(&text[copied..idx]);
            copied = idx + 1;
        }
    }
    out.push_str(&text[copied..]);
    out
}

fn closes_or_ends(rest: &[u8]) -> bool {
    match rest.iter().find(|b| !b.is_ascii_whitespace()) {
        None => true,
        Some(b) => *b == b'}' || *b == b']',
    }
}

/// Tracks whether the scan position is inside a string literal.
#[derive(Default)]
struct Lexer {
    in_string: bool,
    escaped: bool,
}

impl Lexer {
    /// Feed one byte; returns true when it sits outside any string literal.
    fn structural(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return false;
        }
        if b == b'"' {
            self.in_string = true;
            return false;
        }
        true
    }
}

#[derive(Debug, Default, PartialEq)]
struct Tally {
    open_braces: usize,
    close_braces: usize,
    open_brackets: usize,
    close_brackets: usize,
    in_string: bool,
    escaped: bool,
}

impl Tally {
    fn of(text: &str) -> Self {
        let mut lexer = Lexer::default();
        let mut tally = Tally::default();
        for &b in text.as_bytes() {
            if !lexer.structural(b) {
                continue;
            }
            match b {
                b'{' => tally.open_braces += 1,
                b'}' => tally.close_braces += 1,
                b'[' => tally.open_brackets += 1,
                b']' => tally.close_brackets += 1,
                _ => {}
            }
        }
        tally.in_string = lexer.in_string;
        tally.escaped = lexer.escaped;
        tally
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
