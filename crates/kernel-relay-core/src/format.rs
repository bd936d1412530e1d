//! Pure transforms from message payloads to renderable lines.

use std::{fmt::Write as _, sync::LazyLock};

use regex::Regex;
use serde_json::{Map, Value};

use crate::message::{Channel, Message};

/// `ESC [ params m` (SGR) sequences emitted by colored tracebacks.
static CONTROL_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("static regex is valid"));

/// Split on `\n`, dropping the empty segment a final newline leaves behind.
#[must_use]
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.split('\n').map(str::to_owned).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

/// Echo submitted code as `In  [n]: ` followed by aligned `...: ` continuations.
#[must_use]
pub fn format_input(execution_count: u64, code: &str) -> Vec<String> {
    let header = format!("In  [{execution_count}]: ");
    let continuation = format!("{:>width$}", "...: ", width = header.len());

    let mut lines = split_lines(code).into_iter();
    let first = lines.next().unwrap_or_default();

    let mut rendered = vec![format!("{header}{first}")];
    rendered.extend(lines.map(|line| format!("{continuation}{line}")));
    rendered
}

/// Render an execution result, always terminated by a blank line.
#[must_use]
pub fn format_output(execution_count: u64, text: &str) -> Vec<String> {
    let lines = split_lines(text);
    let mut rendered = if lines.len() > 1 {
        let mut block = Vec::with_capacity(lines.len() + 2);
        block.push(format!("Out [{execution_count}]:"));
        block.extend(lines);
        block
    } else {
        let single = lines.into_iter().next().unwrap_or_default();
        vec![format!("Out [{execution_count}]: {single}")]
    };
    rendered.push(String::new());
    rendered
}

#[must_use]
pub fn strip_control_sequences(text: &str) -> String {
    CONTROL_SEQUENCE.replace_all(text, "").into_owned()
}

/// Pick the `text/plain` representation out of a MIME bundle.
// TODO: render text/markdown and text/html fallbacks once a sink can display them.
#[must_use]
pub fn extract_plain_text(data: &Map<String, Value>) -> Option<&str> {
    data.get("text/plain").and_then(Value::as_str)
}

#[must_use]
pub fn error_summary(ename: &str, evalue: &str) -> String {
    format!("{ename}: {evalue}")
}

/// Strip control sequences from each traceback entry and flatten it into lines.
///
/// Entries that are not strings are skipped.
#[must_use]
pub fn clean_traceback(entries: &[Value]) -> Vec<String> {
    entries
        .iter()
        .filter_map(Value::as_str)
        .flat_map(|entry| split_lines(&strip_control_sequences(entry)))
        .collect()
}

/// Diagnostic dump of a message for the trace log.
///
/// The banner uses `====` for handled messages and `****` for ignored ones,
/// followed by the channel's running count and the session total.
#[must_use]
pub fn describe_message(
    handled: bool,
    channel: Channel,
    channel_count: u64,
    total: u64,
    message: &Message,
) -> String {
    let (start, end) = if handled {
        ("=".repeat(4), "=".repeat(50))
    } else {
        ("*".repeat(4), "*".repeat(50))
    };

    let mut buf = String::new();
    let _ = writeln!(buf, "{start} {channel} {channel_count} - {total} {end}");

    let mut fields = Map::new();
    fields.insert("msg_type".into(), Value::String(message.msg_type.clone()));
    if let Some(id) = &message.correlation_id {
        fields.insert("correlation_id".into(), Value::String(id.to_string()));
    }
    if let Some(ts) = message.timestamp {
        fields.insert("timestamp".into(), Value::String(ts.to_rfc3339()));
    }
    fields.insert("payload".into(), Value::Object(message.payload.clone()));

    describe_map(&mut buf, &fields, 0);
    buf
}

fn describe_map(buf: &mut String, map: &Map<String, Value>, indent: usize) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    for key in keys {
        let pad = " ".repeat(indent);
        match &map[key] {
            Value::Object(inner) => {
                let _ = writeln!(buf, "{pad}{key}:");
                describe_map(buf, inner, indent + 4);
            }
            Value::Array(items) if !items.is_empty() => {
                let _ = writeln!(buf, "{pad}{key}:");
                let item_pad = " ".repeat(indent + 4);
                for item in items {
                    let _ = writeln!(buf, "{item_pad}{}", display_value(item));
                }
            }
            other => {
                let _ = writeln!(buf, "{pad}{key}: {}", display_value(other));
            }
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_format_output_single_line() {
        assert_eq!(format_output(3, "42"), vec!["Out [3]: 42", ""]);
    }

    #[test]
    fn test_format_output_multi_line() {
        assert_eq!(format_output(3, "a\nb"), vec!["Out [3]:", "a", "b", ""]);
    }

    #[test]
    fn test_format_output_trailing_newline_stays_single_line() {
        assert_eq!(format_output(7, "hello\n"), vec!["Out [7]: hello", ""]);
    }

    #[test]
    fn test_format_input_aligns_continuation() {
        assert_eq!(
            format_input(1, "x=1\ny=2"),
            vec!["In  [1]: x=1", "    ...: y=2"]
        );

        let wide = format_input(12, "a\nb");
        assert_eq!(wide[0], "In  [12]: a");
        assert_eq!(wide[1], "     ...: b");
        assert_eq!(wide[0].len(), wide[1].len());
    }

    #[test]
    fn test_format_input_empty_code() {
        assert_eq!(format_input(2, ""), vec!["In  [2]: "]);
    }

    #[test]
    fn test_split_lines_drops_only_one_trailing_segment() {
        assert_eq!(split_lines("hello\n"), vec!["hello"]);
        assert_eq!(split_lines("a\n\n"), vec!["a", ""]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn test_strip_control_sequences() {
        assert_eq!(strip_control_sequences("\x1b[31mERR\x1b[0m"), "ERR");
        assert_eq!(
            strip_control_sequences("\x1b[0;32mline\x1b[1;31;47m 2"),
            "line 2"
        );
        assert_eq!(strip_control_sequences("plain"), "plain");
    }

    #[test]
    fn test_extract_plain_text_prefers_text_plain() {
        let data = json!({ "text/html": "<b>1</b>", "text/plain": "1" });
        assert_eq!(extract_plain_text(data.as_object().unwrap()), Some("1"));

        let html_only = json!({ "text/html": "<b>1</b>" });
        assert_eq!(extract_plain_text(html_only.as_object().unwrap()), None);
    }

    #[test]
    fn test_clean_traceback_flattens_entries() {
        let entries = vec![
            json!("\x1b[31mTraceback\x1b[0m (most recent call last)\n"),
            json!("  File \"<x>\", line 1\n    1/0"),
            json!(42),
        ];
        assert_eq!(
            clean_traceback(&entries),
            vec![
                "Traceback (most recent call last)",
                "  File \"<x>\", line 1",
                "    1/0",
            ]
        );
    }

    #[test]
    fn test_describe_message_marks_handling() {
        let msg = Message::new(Channel::Broadcast, "stream")
            .with_correlation_id("abc")
            .with_payload(json!({ "name": "stdout", "text": "hi", "tags": ["x", "y"] }));

        let handled = describe_message(true, Channel::Broadcast, 2, 5, &msg);
        assert!(handled.starts_with("==== broadcast 2 - 5 ="));
        assert!(handled.contains("correlation_id: abc"));
        assert!(handled.contains("    name: stdout"));
        assert!(handled.contains("        x"));

        let ignored = describe_message(false, Channel::Broadcast, 2, 5, &msg);
        assert!(ignored.starts_with("**** broadcast"));
    }
}
