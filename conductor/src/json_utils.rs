//! Lenient handling of JSON produced by language models.
//!
//! Model output is rarely pristine: it arrives wrapped in Markdown code
//! fences, prefixed with prose, carrying invalid escape sequences or cut off
//! mid-object. [`repair_json`] runs a ladder of increasingly aggressive
//! repair strategies and returns the first value that parses.

use serde_json::Value;

/// Strip Markdown code fences (```json ... ```) from model output.
#[must_use]
pub fn strip_code_fences(output: &str) -> &str {
    let mut clean = output.trim();
    if let Some(rest) = clean.strip_prefix("```json") {
        clean = rest;
    }
    if let Some(rest) = clean.strip_prefix("```") {
        clean = rest;
    }
    if let Some(rest) = clean.strip_suffix("```") {
        clean = rest;
    }
    clean.trim()
}

/// Best-effort parse of model output into a JSON value.
///
/// Strategies, in order:
/// 1. direct parse of the fence-stripped input,
/// 2. parse of the first balanced `{...}` / `[...]` region,
/// 3. the same after rewriting invalid escape sequences,
/// 4. the same after closing an unterminated string and any open brackets.
///
/// Returns `None` when every strategy fails.
#[must_use]
pub fn parse_lenient(input: &str) -> Option<Value> {
    let stripped = strip_code_fences(input);
    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        return Some(value);
    }

    let candidate = extract_json_region(stripped)?;
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    let fixed = fix_invalid_escapes(&candidate);
    if let Ok(value) = serde_json::from_str::<Value>(&fixed) {
        return Some(value);
    }

    let completed = complete_truncated(&fixed);
    serde_json::from_str::<Value>(&completed).ok()
}

/// Repair model output and return both the canonical JSON text and the
/// parsed value. The canonical text is what gets committed to ledgers so
/// that downstream prompt construction is reproducible.
#[must_use]
pub fn repair_json(input: &str) -> Option<(String, Value)> {
    let value = parse_lenient(input)?;
    Some((value.to_string(), value))
}

/// Extract the first top-level JSON object or array embedded in free text.
///
/// Scans for a balanced region starting at the first `{` or `[`, honoring
/// string literals and escapes. If the input ends before the region closes,
/// the unterminated remainder is returned for the repair stages to finish.
fn extract_json_region(input: &str) -> Option<String> {
    let start = input.find(['{', '['])?;
    let bytes = &input[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in bytes.char_indices() {
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
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(bytes[..=idx].to_owned());
                }
            }
            _ => {}
        }
    }
    // Unbalanced: hand the rest to the truncation repair.
    Some(bytes.to_owned())
}

/// Rewrite escape sequences that are not legal JSON (`\c`, `\(`, ...) into a
/// literal backslash followed by the character, so serde can parse the text.
fn fix_invalid_escapes(input: &str) -> String {
    let mut result = String::with_capacity(input.len() + 16);
    let mut chars = input.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Close an unterminated string literal and any brackets left open at the
/// end of the input.
fn complete_truncated(input: &str) -> String {
    let mut completed = input.trim_end().to_owned();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in completed.chars() {
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
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        completed.push('"');
    }
    // A truncated `"key":` with no value cannot be completed meaningfully;
    // strip a trailing separator first.
    while completed.ends_with(',') || completed.ends_with(':') {
        completed.pop();
    }
    while let Some(closer) = stack.pop() {
        completed.push(closer);
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;

    mod strip {
        use super::*;

        #[test]
        fn removes_json_fence() {
            assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        }

        #[test]
        fn removes_plain_fence() {
            assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        }

        #[test]
        fn leaves_unfenced_input_alone() {
            assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
        }
    }

    mod lenient {
        use super::*;

        #[test]
        fn parses_valid_json() {
            let value = parse_lenient(r#"{"a": 1}"#).unwrap();
            assert_eq!(value["a"], 1);
        }

        #[test]
        fn extracts_object_from_surrounding_text() {
            let value = parse_lenient(r#"prefix {"tool_calls": [{"name": "Fs.ls"}]} suffix"#)
                .unwrap();
            assert!(value["tool_calls"].is_array());
        }

        #[test]
        fn extracts_nested_object() {
            let value = parse_lenient(r#"note: {"a": {"b": [1, 2]}} done"#).unwrap();
            assert_eq!(value["a"]["b"][1], 2);
        }

        #[test]
        fn ignores_braces_inside_strings() {
            let value = parse_lenient(r#"{"text": "a } b"}"#).unwrap();
            assert_eq!(value["text"], "a } b");
        }

        #[test]
        fn repairs_invalid_escape() {
            let value = parse_lenient(r#"{"path": "C:\projects"}"#).unwrap();
            assert_eq!(value["path"], r"C:\projects");
        }

        #[test]
        fn completes_truncated_object() {
            let value = parse_lenient(r#"{"a": "hello"#).unwrap();
            assert_eq!(value["a"], "hello");
        }

        #[test]
        fn completes_truncated_array() {
            let value = parse_lenient(r#"{"items": [1, 2"#).unwrap();
            assert_eq!(value["items"][1], 2);
        }

        #[test]
        fn rejects_plain_prose() {
            assert!(parse_lenient("there is no json here").is_none());
        }

        #[test]
        fn rejects_empty_input() {
            assert!(parse_lenient("").is_none());
        }

        #[test]
        fn parses_fenced_output() {
            let value = parse_lenient("```json\n{\"done\": true}\n```").unwrap();
            assert_eq!(value["done"], true);
        }
    }

    mod repair {
        use super::*;

        #[test]
        fn returns_canonical_text() {
            let (text, value) = repair_json("junk {\"a\":  1 } junk").unwrap();
            assert_eq!(text, r#"{"a":1}"#);
            assert_eq!(value["a"], 1);
        }

        #[test]
        fn none_on_unrepairable_input() {
            assert!(repair_json("no json at all").is_none());
        }
    }
}
