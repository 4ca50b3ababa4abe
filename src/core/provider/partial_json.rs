//! Best-effort parsing of JSON documents that are still being streamed.

use serde_json::Value;

/// Parse the longest usable prefix of `text` as JSON.
///
/// Open strings and containers are closed; a dangling key, colon, comma or
/// literal is dropped by backing off to the previous structural boundary.
/// Returns `None` when nothing usable has arrived yet.
pub fn parse_partial(text: &str) -> Option<Value> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    let cuts = boundary_cuts(text);
    let mut end = text.len();
    loop {
        if let Some(value) = close_prefix(&text[..end]) {
            return Some(value);
        }
        end = *cuts.iter().rev().find(|cut| **cut < end)?;
    }
}

/// Byte offsets where a prefix may be cut: just before a `,` and just after
/// an opening bracket, outside string literals.
fn boundary_cuts(text: &str) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            ',' => cuts.push(index),
            '{' | '[' => cuts.push(index + 1),
            _ => {}
        }
    }
    cuts
}

fn close_prefix(prefix: &str) -> Option<Value> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in prefix.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut repaired = prefix.to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        strip_partial_unicode_escape(&mut repaired);
        repaired.push('"');
    }
    let trimmed_len = repaired.trim_end().trim_end_matches(',').len();
    repaired.truncate(trimmed_len);
    if repaired.ends_with(':') {
        return None;
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    serde_json::from_str(&repaired).ok()
}

fn strip_partial_unicode_escape(text: &mut String) {
    if let Some(pos) = text.rfind("\\u") {
        let tail = &text[pos + 2..];
        if tail.len() < 4 && tail.chars().all(|c| c.is_ascii_hexdigit()) {
            text.truncate(pos);
        }
    }
}
