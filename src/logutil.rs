//! Logging helpers that keep relayed chat and radio text on a single log line.
//!
//! Bodies arriving from Matrix frequently contain newlines (quoted replies,
//! multi-paragraph messages); logging them raw splits one event across many
//! lines and makes the relay log hard to follow.

use std::fmt::Write;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///
/// Strings longer than 300 characters are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Short human description of a relayed body for queue job descriptions.
pub fn describe(prefix: &str, body: &str) -> String {
    const DESC_CHARS: usize = 48;
    let flat: String = body
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() > DESC_CHARS {
        let cut: String = flat.chars().take(DESC_CHARS).collect();
        format!("{prefix}: {cut}…")
    } else {
        format!("{prefix}: {flat}")
    }
}
