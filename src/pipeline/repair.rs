//! Response repair: turn a free-text service reply into validated records.
//!
//! The reply is supposed to be a JSON array of flat objects. In practice it
//! arrives fenced, prefixed with prose, double-escaped, truncated, or with
//! unescaped quotes inside values. Each step below is applied only when the
//! text still fails a strict parse, and each step's outcome is an explicit
//! `Result` rather than a caught panic.
//!
//! ## Step Order
//!
//! 1. Strip code fences and isolate the JSON payload from surrounding prose
//! 2. Remove control characters except `\n`, `\t`, `\r`
//! 3. Normalise escaping (double-escaped quotes, stray backslashes)
//! 4. Wrap a bare object (or anything that is not an array) in `[...]`
//! 5. Field repairs: inner quotes, unterminated strings, bare keys and
//!    values, trailing and missing commas, missing closers
//! 6. Parse only the first balanced `{...}` object
//!
//! If nothing parses, the byte offset and surrounding text of the last parse
//! failure are logged and the unit yields no records.

use crate::error::RepairError;
use crate::output::AttemptOutcome;
use crate::record::{Field, SessionRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Which step produced parseable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    /// Parsed as-is.
    Strict,
    StripFences,
    ControlChars,
    Escapes,
    WrapRoot,
    FieldRepair,
    FirstObject,
}

/// Parsed reply elements and the step that got there.
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub values: Vec<Value>,
    pub step: RepairStep,
}

/// Records that passed validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    pub records: Vec<SessionRecord>,
    /// Reply objects rejected by validation.
    pub dropped: usize,
    /// `None` when no step recovered the reply.
    pub step: Option<RepairStep>,
}

/// Repair `raw` and validate every element against `required`.
///
/// Never fails: an unrecoverable reply yields an empty record list.
pub fn repair(raw: &str, required: &[Field]) -> Validated {
    match repair_json(raw) {
        Ok(Repaired { values, step }) => {
            let (records, dropped) = validate(&values, required);
            if step != RepairStep::Strict {
                debug!(
                    "Reply recovered by {:?}: {} records, {} dropped",
                    step,
                    records.len(),
                    dropped
                );
            }
            Validated {
                records,
                dropped,
                step: Some(step),
            }
        }
        Err(e) => {
            debug!("Reply yielded no records: {}", e);
            Validated::default()
        }
    }
}

/// Turn each element into a [`SessionRecord`], counting rejects.
pub fn validate(values: &[Value], required: &[Field]) -> (Vec<SessionRecord>, usize) {
    let mut records = Vec::with_capacity(values.len());
    let mut dropped = 0usize;
    for (i, value) in values.iter().enumerate() {
        match SessionRecord::from_json(value, required) {
            Ok(record) => records.push(record),
            Err(reason) => {
                debug!("Dropped reply element {}: {}", i, reason);
                dropped += 1;
            }
        }
    }
    if dropped > 0 {
        warn!("Validation dropped {}/{} reply elements", dropped, values.len());
    }
    (records, dropped)
}

/// Classify a reply for the dispatcher's retry decision.
///
/// Empty replies and scalar roots are worth retrying. Anything else is
/// either usable as-is or a job for [`repair`].
pub fn classify(raw: &str) -> AttemptOutcome {
    let stripped = strip_fences(raw);
    if stripped.trim().is_empty() {
        return AttemptOutcome::Empty;
    }
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Array(_)) => AttemptOutcome::Success,
        Ok(Value::Object(_)) => AttemptOutcome::Malformed,
        // The payload delivered as a JSON string literal.
        Ok(Value::String(s)) if s.trim_start().starts_with(['[', '{']) => AttemptOutcome::Malformed,
        Ok(_) => AttemptOutcome::NotAnArray,
        Err(_) => match serde_json::from_str::<Value>(stripped.trim()) {
            Ok(Value::Array(_)) | Ok(Value::Object(_)) | Err(_) => AttemptOutcome::Malformed,
            Ok(_) => AttemptOutcome::NotAnArray,
        },
    }
}

/// Run the repair steps in order until one yields a JSON array.
pub fn repair_json(raw: &str) -> Result<Repaired, RepairError> {
    let mut last_err = match parse_array(raw) {
        Ok(values) => {
            return Ok(Repaired {
                values,
                step: RepairStep::Strict,
            })
        }
        Err(e) => e,
    };

    let steps: [(RepairStep, fn(&str) -> String); 5] = [
        (RepairStep::StripFences, strip_fences),
        (RepairStep::ControlChars, remove_control_chars),
        (RepairStep::Escapes, normalise_escapes),
        (RepairStep::WrapRoot, wrap_root),
        (RepairStep::FieldRepair, repair_fields),
    ];

    let mut text = raw.to_string();
    for (step, apply) in steps {
        text = apply(&text);
        if text.trim().is_empty() {
            return Err(RepairError::Empty);
        }
        match parse_array(&text) {
            Ok(values) => return Ok(Repaired { values, step }),
            Err(e) => {
                debug!("Repair step {:?} still invalid: {}", step, e);
                last_err = e;
            }
        }
    }

    if let Some(object) = first_balanced_object(&text) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(object) {
            debug!("Kept only the first object of the reply");
            return Ok(Repaired {
                values: vec![value],
                step: RepairStep::FirstObject,
            });
        }
    }

    if let RepairError::Unparseable {
        offset,
        reason,
        context,
    } = &last_err
    {
        warn!(
            "Unrecoverable reply: {} at byte {} near {:?}",
            reason, offset, context
        );
    }
    Err(last_err)
}

/// Strict parse. Only an array root counts.
fn parse_array(text: &str) -> Result<Vec<Value>, RepairError> {
    let t = text.trim();
    if t.is_empty() {
        return Err(RepairError::Empty);
    }
    match serde_json::from_str::<Value>(t) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(RepairError::NotAnArray {
            kind: kind_of(&other),
        }),
        Err(e) => Err(unparseable(t, &e)),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

const CONTEXT_BYTES: usize = 40;

/// Locate a serde_json error as a byte offset with surrounding text.
fn unparseable(text: &str, err: &serde_json::Error) -> RepairError {
    let line = err.line().max(1);
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    let offset = floor_boundary(text, line_start + err.column().saturating_sub(1));
    let from = floor_boundary(text, offset.saturating_sub(CONTEXT_BYTES));
    let to = floor_boundary(text, offset + CONTEXT_BYTES);
    RepairError::Unparseable {
        offset,
        reason: err.to_string(),
        context: text[from..to].to_string(),
    }
}

fn floor_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ── Step 1: Strip code fences, isolate payload ───────────────────────────────

static RE_FENCE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*```[^\n]*$").unwrap());

fn strip_fences(input: &str) -> String {
    let unfenced = RE_FENCE_LINE.replace_all(input, "");
    let t = unfenced.trim();

    // A complete record array anywhere in the reply, whatever the prose says.
    if !t.starts_with('"') {
        if let Some(payload) = top_level_arrays(t).into_iter().find(|c| is_record_array(c)) {
            return payload.to_string();
        }
    }

    // Prose before the payload.
    // A JSON-encoded string holding the payload is left to step 3.
    let t = match t.find(['[', '{']) {
        Some(i) if i > 0 && !t.starts_with('"') => &t[i..],
        _ => t,
    };

    // Prose after the payload, only when it cannot be a truncated record.
    if let Some(end) = t.rfind([']', '}']) {
        let tail = &t[end + 1..];
        if !tail.is_empty() && !tail.contains(['{', '[', ':']) && !t.starts_with('"') {
            return t[..=end].to_string();
        }
    }
    t.to_string()
}

/// Every balanced `[...]` that opens outside an object or string.
fn top_level_arrays(input: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut braces = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => braces += 1,
            '}' => braces = braces.saturating_sub(1),
            '[' if braces == 0 => found.extend(balanced(&input[i..], '[', ']')),
            _ => {}
        }
    }
    found
}

/// Strictly an array of objects (or empty).
fn is_record_array(candidate: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(candidate),
        Ok(Value::Array(items)) if items.iter().all(Value::is_object)
    )
}

// ── Step 2: Remove control characters ────────────────────────────────────────

fn remove_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|&c| {
            !(c.is_control() && !matches!(c, '\n' | '\t' | '\r'))
                && !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}')
        })
        .collect()
}

// ── Step 3: Normalise escaping ───────────────────────────────────────────────

static RE_DOUBLE_ESCAPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*\[?\s*\{\s*\\""#).unwrap());

fn normalise_escapes(input: &str) -> String {
    let t = input.trim();

    // The whole payload delivered as a JSON string literal.
    if t.starts_with('"') && t.ends_with('"') && t.len() > 1 {
        if let Ok(inner) = serde_json::from_str::<String>(t) {
            let inner = inner.trim();
            if inner.starts_with(['[', '{']) {
                return inner.to_string();
            }
        }
    }

    let unescaped;
    let t = if RE_DOUBLE_ESCAPED.is_match(t) {
        unescaped = t.replace("\\\"", "\"");
        unescaped.as_str()
    } else {
        t
    };
    fix_stray_backslashes(t)
}

/// Escape every backslash that does not start a valid JSON escape. `\\`
/// pairs are kept as they are.
fn fix_stray_backslashes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '\\' {
            out.push(c);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some('\\') | Some('"') | Some('/') | Some('b') | Some('f') | Some('n')
            | Some('r') | Some('t') => {
                out.push('\\');
                out.push(chars[i + 1]);
                i += 2;
            }
            Some('u') if is_unicode_escape(&chars[i + 2..]) => {
                out.push('\\');
                i += 1;
            }
            _ => {
                out.push_str("\\\\");
                i += 1;
            }
        }
    }
    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(|c| c.is_ascii_hexdigit())
}

// ── Step 4: Wrap the root ────────────────────────────────────────────────────

fn wrap_root(input: &str) -> String {
    let t = input.trim();
    if t.starts_with('[') {
        t.to_string()
    } else {
        format!("[{t}]")
    }
}

// ── Step 5: Field repairs ────────────────────────────────────────────────────

fn repair_fields(input: &str) -> String {
    let s = close_strings(input);
    let s = quote_bare_tokens(&s);
    let s = fix_separators(&s);
    balance_brackets(&s)
}

/// Escape quotes that cannot end a string and close strings left open at
/// a line end.
fn close_strings(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_str = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !in_str {
            if c == '"' {
                in_str = true;
            }
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            }
            '"' if closes_string(&chars, i + 1) => {
                in_str = false;
                out.push(c);
            }
            '"' => out.push_str("\\\""),
            '\n' | '\r' if next_line_is_structural(&chars, i + 1) => {
                close_open_string(&mut out);
                in_str = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
        i += 1;
    }
    if in_str {
        close_open_string(&mut out);
    }
    out
}

/// A quote closes its string when what follows is structural.
fn closes_string(chars: &[char], from: usize) -> bool {
    let Some(j) = skip_inline_ws(chars, from) else {
        return true;
    };
    match chars[j] {
        '}' | ']' | ':' | '\n' | '\r' => true,
        '"' => is_key_at(chars, j),
        ',' => match skip_ws(chars, j + 1) {
            None => true,
            Some(k) => matches!(chars[k], '"' | '{' | '[' | '}' | ']')
                || chars[j + 1..k].contains(&'\n'),
        },
        _ => false,
    }
}

/// The next line opens a key, an object, or closes a container.
fn next_line_is_structural(chars: &[char], from: usize) -> bool {
    let Some(j) = skip_ws(chars, from) else {
        return true;
    };
    match chars[j] {
        '}' | ']' | '{' | '[' => true,
        '"' => is_key_at(chars, j),
        _ => false,
    }
}

/// `chars[at]` opens a quoted key: `"name":`.
fn is_key_at(chars: &[char], at: usize) -> bool {
    let mut k = at + 1;
    while k < chars.len() && chars[k] != '"' && chars[k] != '\n' {
        k += 1;
    }
    k < chars.len()
        && chars[k] == '"'
        && matches!(skip_inline_ws(chars, k + 1), Some(m) if chars[m] == ':')
}

/// Close a string at the end of `out`, keeping a trailing comma outside it.
fn close_open_string(out: &mut String) {
    let trimmed = out.trim_end_matches([' ', '\t']).len();
    out.truncate(trimmed);
    if out.ends_with(',') {
        out.pop();
        let trimmed = out.trim_end_matches([' ', '\t']).len();
        out.truncate(trimmed);
        out.push_str("\",");
    } else {
        out.push('"');
    }
}

fn skip_inline_ws(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&k| chars[k] != ' ' && chars[k] != '\t')
}

fn skip_ws(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&k| !chars[k].is_whitespace())
}

/// Quote bare keys (`{title: ...}`) and bare values (`"paper_no": 2025-01-0042`).
fn quote_bare_tokens(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_str = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_str {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            } else if c == '"' {
                in_str = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_str = true;
            out.push(c);
            i += 1;
            continue;
        }
        if matches!(c, '{' | '}' | '[' | ']' | ',' | ':') || c.is_whitespace() {
            out.push(c);
            i += 1;
            continue;
        }

        let value_context = out.trim_end().ends_with(':');
        let start = i;
        while i < chars.len() {
            let d = chars[i];
            if matches!(d, ',' | '}' | ']' | '{' | '[' | '"' | '\n') || (d == ':' && !value_context) {
                break;
            }
            i += 1;
        }
        let token: String = chars[start..i].iter().collect();
        let trimmed = token.trim_end();
        if is_json_literal(trimmed) {
            out.push_str(trimmed);
        } else {
            out.push('"');
            for ch in trimmed.chars() {
                if ch == '\\' || ch == '"' {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        }
        out.push_str(&token[trimmed.len()..]);
    }
    out
}

fn is_json_literal(token: &str) -> bool {
    matches!(token, "true" | "false" | "null") || serde_json::from_str::<serde_json::Number>(token).is_ok()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Prev {
    Start,
    Open,
    Comma,
    Colon,
    ValueEnd,
}

/// Drop trailing and doubled commas, insert missing ones between values.
fn fix_separators(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut prev = Prev::Start;
    let mut in_str = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_str {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            } else if c == '"' {
                in_str = false;
                prev = Prev::ValueEnd;
            }
            i += 1;
            continue;
        }
        match c {
            ',' => {
                let closes = skip_ws(&chars, i + 1).map_or(true, |k| matches!(chars[k], '}' | ']'));
                if !(closes || matches!(prev, Prev::Comma | Prev::Open | Prev::Start)) {
                    out.push(c);
                    prev = Prev::Comma;
                }
            }
            '{' | '[' | '"' => {
                if prev == Prev::ValueEnd {
                    out.push(',');
                }
                out.push(c);
                if c == '"' {
                    in_str = true;
                } else {
                    prev = Prev::Open;
                }
            }
            '}' | ']' => {
                out.push(c);
                prev = Prev::ValueEnd;
            }
            ':' => {
                out.push(c);
                prev = Prev::Colon;
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                out.push(c);
                prev = Prev::ValueEnd;
            }
        }
        i += 1;
    }
    out
}

/// Append missing closers; a closer with no opener is dropped.
fn balance_brackets(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_str = false;
    let mut escaped = false;
    for c in input.chars() {
        if in_str {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_str = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if !stack.contains(&c) {
                    continue;
                }
                while let Some(closer) = stack.pop() {
                    trim_dangling(&mut out);
                    out.push(closer);
                    if closer == c {
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    if in_str {
        out.push('"');
    }
    if !stack.is_empty() {
        trim_dangling(&mut out);
        while let Some(closer) = stack.pop() {
            out.push(closer);
        }
    }
    out
}

/// Drop a trailing comma, and give a dangling key an empty value.
fn trim_dangling(out: &mut String) {
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str("\"\"");
    }
}

// ── Step 6: First balanced object ────────────────────────────────────────────

fn first_balanced_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    balanced(&input[start..], '{', '}')
}

/// The prefix of `input` from its opening `open` to the matching `close`,
/// skipping brackets inside strings.
fn balanced(input: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        if c == '"' {
            in_str = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(&input[..i + c.len_utf8()]);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(raw: &str) -> Vec<Value> {
        repair_json(raw).unwrap().values
    }

    #[test]
    fn test_valid_array_is_unchanged() {
        let raw = r#"[{"session_code": "A1", "title": "T"}, {"session_code": "A2", "title": "U"}]"#;
        let repaired = repair_json(raw).unwrap();
        assert_eq!(repaired.step, RepairStep::Strict);
        assert_eq!(repaired.values, serde_json::from_str::<Vec<Value>>(raw).unwrap());
    }

    #[test]
    fn test_strip_fences() {
        let raw = "```json\n[{\"title\": \"T\"}]\n```";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.step, RepairStep::StripFences);
        assert_eq!(r.values, vec![json!({"title": "T"})]);
    }

    #[test]
    fn test_prose_around_payload() {
        let raw = "Here are the sessions:\n[{\"title\": \"T\"}]\nLet me know if you need more.";
        assert_eq!(values(raw), vec![json!({"title": "T"})]);
    }

    #[test]
    fn test_trailing_note_with_colon() {
        let raw = "[{\"session_code\": \"A1\"}, {\"session_code\": \"A2\"}, {\"session_code\": \"A3\"}]\nNote: some papers had no number.";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.step, RepairStep::StripFences);
        assert_eq!(r.values.len(), 3);
        assert_eq!(r.values[2]["session_code"], "A3");
    }

    #[test]
    fn test_leading_prose_with_brackets() {
        let raw = "Here are the records [3 sessions]:\n[{\"title\": \"A\"}, {\"title\": \"B\"}, {\"title\": \"C\"}]";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.step, RepairStep::StripFences);
        assert_eq!(r.values.len(), 3);
        assert_eq!(r.values[0]["title"], "A");
    }

    #[test]
    fn test_inner_array_of_object_is_not_the_payload() {
        let v = values(r#"Result: {"title": "T", "authors": [{"name": "A"}]}"#);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0]["title"], "T");
    }

    #[test]
    fn test_control_chars_removed() {
        let raw = "[{\"title\": \"T\u{0007}\u{0000}x\"}]";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.step, RepairStep::ControlChars);
        assert_eq!(r.values, vec![json!({"title": "Tx"})]);
    }

    #[test]
    fn test_double_escaped_quotes() {
        let raw = r#"[{\"session_code\": \"A1\", \"title\": \"T\"}]"#;
        let r = repair_json(raw).unwrap();
        assert_eq!(r.step, RepairStep::Escapes);
        assert_eq!(r.values, vec![json!({"session_code": "A1", "title": "T"})]);
    }

    #[test]
    fn test_payload_as_string_literal() {
        let raw = r#""[{\"title\": \"T\"}]""#;
        assert_eq!(values(raw), vec![json!({"title": "T"})]);
    }

    #[test]
    fn test_stray_backslash_neutralised() {
        let raw = r#"[{"title": "C:\temp\qux path", "overview": "a\\b"}]"#;
        let v = values(raw);
        assert_eq!(v[0]["overview"], "a\\b");
        assert!(v[0]["title"].as_str().unwrap().contains("qux path"));
    }

    #[test]
    fn test_bare_object_is_wrapped() {
        let r = repair_json(r#"{"session_code":"X"}"#).unwrap();
        assert_eq!(r.step, RepairStep::WrapRoot);
        assert_eq!(r.values, vec![json!({"session_code": "X"})]);
    }

    #[test]
    fn test_comma_separated_objects_are_wrapped() {
        let v = values(r#"{"title": "A"}, {"title": "B"}"#);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn test_trailing_comma() {
        let r = repair_json(r#"[{"a":1,}]"#).unwrap();
        assert_eq!(r.step, RepairStep::FieldRepair);
        assert_eq!(r.values, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_unescaped_inner_quote_keeps_words() {
        let raw = r#"[{"session_code": "A1", "title": "The "Best" Paper Award", "paper_no": "2025-01-0001"}]"#;
        let v = values(raw);
        assert_eq!(v.len(), 1);
        let title = v[0]["title"].as_str().unwrap();
        for word in ["The", "Best", "Paper", "Award"] {
            assert!(title.contains(word), "{title}");
        }
        assert_eq!(v[0]["paper_no"], "2025-01-0001");
    }

    #[test]
    fn test_bare_keys_and_values() {
        let raw = "[{session_code: PFL750, title: Battery Thermal Management, paper_no: 2025-01-0042}]";
        let v = values(raw);
        assert_eq!(
            v[0],
            json!({"session_code": "PFL750", "title": "Battery Thermal Management", "paper_no": "2025-01-0042"})
        );
    }

    #[test]
    fn test_bare_value_with_colon() {
        let v = values(r#"[{"title": "T", "time": 8:00 a.m.}]"#);
        assert_eq!(v[0]["time"], "8:00 a.m.");
    }

    #[test]
    fn test_missing_commas_between_entries() {
        let raw = "[\n{\"title\": \"A\"}\n{\"title\": \"B\" \"paper_no\": \"1\"}\n]";
        let v = values(raw);
        assert_eq!(v.len(), 2);
        assert_eq!(v[1]["paper_no"], "1");
    }

    #[test]
    fn test_truncated_reply_is_closed() {
        let raw = r#"[{"title": "A", "session_code": "S1"}, {"title": "B", "session_code": "S2"#;
        let v = values(raw);
        assert_eq!(v.len(), 2);
        assert_eq!(v[1]["session_code"], "S2");
    }

    #[test]
    fn test_unterminated_string_at_line_end() {
        let raw = "[{\n  \"title\": \"Open ended,\n  \"session_code\": \"S1\"\n}]";
        let v = values(raw);
        assert_eq!(v[0]["title"], "Open ended");
        assert_eq!(v[0]["session_code"], "S1");
    }

    #[test]
    fn test_raw_newline_inside_value() {
        let raw = "[{\"overview\": \"first line\nsecond line\", \"title\": \"T\"}]";
        let v = values(raw);
        assert_eq!(v[0]["overview"], "first line\nsecond line");
    }

    #[test]
    fn test_dangling_key_gets_empty_value() {
        let v = values(r#"[{"title": "A", "overview":"#);
        assert_eq!(v[0]["overview"], "");
    }

    #[test]
    fn test_first_object_fallback() {
        let raw = r#"{"title": "A"} trailing {{{ garbage ::: ]]"#;
        let r = repair_json(raw).unwrap();
        assert_eq!(r.step, RepairStep::FirstObject);
        assert_eq!(r.values, vec![json!({"title": "A"})]);
    }

    #[test]
    fn test_empty_reply() {
        assert_eq!(repair_json("   "), Err(RepairError::Empty));
        assert_eq!(repair_json("```json\n```"), Err(RepairError::Empty));
    }

    #[test]
    fn test_scalar_root_is_wrapped() {
        let r = repair_json("42").unwrap();
        assert_eq!(r.values, vec![json!(42)]);
    }

    #[test]
    fn test_unparseable_reports_offset() {
        match parse_array("[{\"a\": }]") {
            Err(RepairError::Unparseable { offset, context, .. }) => {
                assert!(offset <= 8, "offset {offset}");
                assert!(context.contains("\"a\""));
            }
            other => panic!("expected Unparseable, got {other:?}"),
        }
    }

    #[test]
    fn test_repair_validates_records() {
        let raw = r#"[
            {"session_code": "A1", "title": "Kept", "Paper No.": "2025-01-0001"},
            {"session_code": "A1"},
            {"session_code": 7, "title": "Bad type"},
            "not an object"
        ]"#;
        let out = repair(raw, &[Field::SessionCode, Field::Title]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].paper_no, "2025-01-0001");
        assert_eq!(out.dropped, 3);
        assert_eq!(out.step, Some(RepairStep::Strict));
    }

    #[test]
    fn test_repair_never_fails() {
        let out = repair("I could not find any sessions in this text.", &[Field::Title]);
        assert!(out.records.is_empty());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(""), AttemptOutcome::Empty);
        assert_eq!(classify("```\n```"), AttemptOutcome::Empty);
        assert_eq!(classify("[]"), AttemptOutcome::Success);
        assert_eq!(classify("\"just text\""), AttemptOutcome::NotAnArray);
        assert_eq!(classify("null"), AttemptOutcome::NotAnArray);
        assert_eq!(classify(r#""[{\"title\": \"T\"}]""#), AttemptOutcome::Malformed);
        assert_eq!(classify(r#"{"title": "T"}"#), AttemptOutcome::Malformed);
        assert_eq!(classify(r#"[{"a":1,}]"#), AttemptOutcome::Malformed);
    }
}
