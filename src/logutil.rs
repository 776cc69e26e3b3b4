//! Helpers for keeping device and cloud traffic on a single log line.

/// Longest preview of a line written to the log, in characters.
const MAX_PREVIEW: usize = 160;

/// Escape a serial or cloud line for logging. Line breaks, tabs and other control
/// characters become visible escapes and long lines are cut with an ellipsis.
pub fn escape_line(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 4);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Collapse a multi-line cloud payload into one serial frame: every CR/LF run becomes
/// a single space and surrounding whitespace is trimmed.
pub fn single_line(s: &str) -> String {
    s.split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
