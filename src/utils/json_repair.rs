use crate::constants::model::PARSE_CONTEXT_BYTES;
use crate::utils::text::context_window;
use serde_json::Value;

/// Why recovery gave up: the last parser error plus a bounded context slice
/// around the failure point. Never the full payload.
#[derive(Debug, Clone)]
pub struct RepairFailure {
    pub message: String,
    pub context: String,
}

/// Model replies are noisy. This pipeline applies, in order: fence
/// stripping, object extraction, comment scrubbing, trailing-comma repair,
/// control-character escaping, then a parse with a single closer-completion
/// retry. Anything still unparseable is a clean failure.
pub fn recover_json(raw: &str) -> Result<Value, RepairFailure> {
    let unfenced = strip_fences(raw);
    let object = match extract_object(unfenced) {
        Some(slice) => slice,
        None => {
            return Err(RepairFailure {
                message: "no JSON object in response".to_string(),
                context: context_window(unfenced, 0, PARSE_CONTEXT_BYTES).to_string(),
            })
        }
    };
    let scrubbed = scrub_comments(object);
    let decommaed = repair_trailing_commas(&scrubbed);
    let cleaned = escape_control_chars(&decommaed);

    match serde_json::from_str(&cleaned) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            if let Some(completed) = complete_closers(&cleaned) {
                if let Ok(value) = serde_json::from_str(&completed) {
                    return Ok(value);
                }
            }
            let at = byte_offset(&cleaned, first_err.line(), first_err.column());
            Err(RepairFailure {
                message: first_err.to_string(),
                context: context_window(&cleaned, at, PARSE_CONTEXT_BYTES).to_string(),
            })
        }
    }
}

/// Drop a single surrounding triple-backtick block, with an optional
/// language tag on the opening fence.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Opening fence may carry a tag ("json"); content starts after its line.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").map(str::trim_end).unwrap_or(body)
}

/// Slice from the first `{` to the last `}`. With no closing brace the tail
/// is kept so closer completion can finish the job.
pub fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

/// Remove `//` line comments and `/* */` block comments outside of quoted
/// strings.
pub fn scrub_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Drop commas that sit immediately before a `}` or `]` (ignoring
/// whitespace), outside of quoted strings.
pub fn repair_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            continue;
        }
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Replace literal ASCII control characters inside quoted strings with a
/// single space. Works string-by-string so structural characters outside
/// quotes (newlines between fields) are left alone.
pub fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if ch.is_ascii_control() {
                out.push(' ');
                escaped = false;
                continue;
            }
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }
    out
}

/// Track `{`/`[` nesting across the stream (string-aware); if the document
/// ends with unclosed scopes, append the missing closers in reverse order.
pub fn complete_closers(text: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                // Mismatched closers are not this repair's problem.
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if stack.is_empty() && !in_string {
        return None;
    }
    let mut completed = text.to_string();
    if in_string {
        completed.push('"');
    }
    while let Some(closer) = stack.pop() {
        completed.push(closer);
    }
    Some(completed)
}

fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let mut remaining = line.saturating_sub(1);
    let mut offset = 0;
    for (i, ch) in text.char_indices() {
        if remaining == 0 {
            return (i + column.saturating_sub(1)).min(text.len());
        }
        if ch == '\n' {
            remaining -= 1;
            offset = i + 1;
        }
    }
    (offset + column.saturating_sub(1)).min(text.len())
}
