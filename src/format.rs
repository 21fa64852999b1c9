//! Message formatting shared by both relay directions.
//!
//! Everything here is pure and total: a bad template or an awkward byte budget
//! degrades to a default instead of failing the relay path that asked for it.
//!
//! Prefix templates use `{field}` placeholders. Fields that support truncation
//! also accept a numeric suffix, so `{display5}` is the first five characters
//! of the display name. `{{` and `}}` produce literal braces.

use log::{debug, warn};
use thiserror::Error;

use crate::config::{MatrixConfig, MeshtasticConfig};

/// Prefix on text sent to the radio, e.g. `Alice[M]: `.
pub const DEFAULT_RADIO_PREFIX: &str = "{display5}[M]: ";
/// Prefix on text posted to Matrix, e.g. `[Alice Smith/Downtown]: `.
pub const DEFAULT_CHAT_PREFIX: &str = "[{long}/{mesh}]: ";
pub const MAX_TRUNCATION_LENGTH: usize = 20;
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;
/// Characters of original text quoted in reaction messages.
pub const PREVIEW_CHARS: usize = 40;
pub const MESHNET_ABBREV_CHARS: usize = 4;
pub const SHORTNAME_FALLBACK_CHARS: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder {{{0}}}")]
    UnknownField(String),
    #[error("unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),
    #[error("unsupported format spec in {{{0}}}")]
    UnsupportedSpec(String),
}

/// Values available to a prefix template.
#[derive(Debug, Default, Clone)]
pub struct PrefixFields {
    values: Vec<(&'static str, String)>,
    truncatable: Vec<&'static str>,
}

impl PrefixFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.push((name, value.into()));
        self
    }

    /// Like [`with`](Self::with) but also exposes `{nameN}` for N in 1..=20.
    pub fn with_truncatable(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.truncatable.push(name);
        self.with(name, value)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some((_, v)) = self.values.iter().find(|(n, _)| *n == key) {
            return Some(v.clone());
        }
        let digits_at = key.find(|c: char| c.is_ascii_digit())?;
        let (stem, count) = key.split_at(digits_at);
        if !self.truncatable.contains(&stem) || !count.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let n: usize = count.parse().ok()?;
        if n == 0 || n > MAX_TRUNCATION_LENGTH {
            return None;
        }
        let full = self.values.iter().find(|(name, _)| *name == stem)?;
        Some(full.1.chars().take(n).collect())
    }
}

/// Render `template` strictly; any problem is an error.
pub fn render_template(template: &str, fields: &PrefixFields) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    if k == '{' {
                        return Err(TemplateError::UnbalancedBrace(pos));
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(TemplateError::UnbalancedBrace(pos));
                }
                if key.contains(|c: char| c == ':' || c == '!' || c == '.' || c == '[') {
                    return Err(TemplateError::UnsupportedSpec(key));
                }
                match fields.lookup(&key) {
                    Some(v) => out.push_str(&v),
                    None => return Err(TemplateError::UnknownField(key)),
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(TemplateError::UnbalancedBrace(pos));
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Render `template`, falling back to `default` if it is malformed or names
/// an unknown field. Never fails.
pub fn render_prefix(template: &str, fields: &PrefixFields, default: &str) -> String {
    match render_template(template, fields) {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid prefix_format '{}': {}. Using default format.", template, e);
            render_template(default, fields).unwrap_or_default()
        }
    }
}

/// Prefix for a Matrix message heading to the radio.
pub fn radio_prefix(cfg: &MeshtasticConfig, display_name: &str, user_id: Option<&str>) -> String {
    if !cfg.prefix_enabled {
        return String::new();
    }
    let (username, server) = user_id.map(split_user_id).unwrap_or(("", ""));
    let fields = PrefixFields::new()
        .with_truncatable("display", display_name)
        .with("user", user_id.unwrap_or(""))
        .with("username", username)
        .with("server", server);
    let template = cfg.prefix_format.as_deref().unwrap_or(DEFAULT_RADIO_PREFIX);
    render_prefix(template, &fields, DEFAULT_RADIO_PREFIX)
}

/// Prefix for a radio message heading to Matrix.
pub fn chat_prefix(cfg: &MatrixConfig, longname: &str, shortname: &str, meshnet: &str) -> String {
    if !cfg.prefix_enabled {
        return String::new();
    }
    let fields = PrefixFields::new()
        .with_truncatable("long", longname)
        .with("short", shortname)
        .with_truncatable("mesh", meshnet);
    let template = cfg.prefix_format.as_deref().unwrap_or(DEFAULT_CHAT_PREFIX);
    let out = render_prefix(template, &fields, DEFAULT_CHAT_PREFIX);
    debug!("chat prefix '{}' from template '{}'", out, template);
    out
}

/// `@alice:example.org` becomes `("alice", "example.org")`.
fn split_user_id(user_id: &str) -> (&str, &str) {
    match user_id.strip_prefix('@').and_then(|rest| rest.split_once(':')) {
        Some((user, server)) => (user, server),
        None => ("", ""),
    }
}

/// Longest prefix of `text` that fits in `max_bytes` without splitting a
/// character.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Drop `>`-quoted lines (reply fallbacks) and join what remains.
pub fn strip_quoted_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// First `max_chars` characters followed by `...` when the text is longer.
pub fn abbreviate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let mut s: String = text.chars().take(max_chars).collect();
        s.push_str("...");
        s
    } else {
        text.to_string()
    }
}

pub fn meshnet_abbrev(meshnet: &str) -> String {
    meshnet.chars().take(MESHNET_ABBREV_CHARS).collect()
}

/// Short name used when a node never advertised one.
pub fn shortname_fallback(longname: &str) -> String {
    longname.chars().take(SHORTNAME_FALLBACK_CHARS).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Addressed to this relay's own node.
    Direct,
    Broadcast,
    /// Addressed to some other node; overheard only.
    OtherNode,
}

pub fn classify_destination(to: u32, my_node_id: Option<u32>) -> Destination {
    if Some(to) == my_node_id {
        Destination::Direct
    } else if to == BROADCAST_ADDR {
        Destination::Broadcast
    } else {
        Destination::OtherNode
    }
}

/// True when `body` invokes `!command`, either bare or after a mention of the
/// bot (`@bot:server: !command`, `Bot, !command`).
pub fn is_bot_command(command: &str, body: &str, bot_user_id: &str, bot_name: Option<&str>) -> bool {
    let body = body.trim();
    if starts_with_command(body, command) {
        return true;
    }
    let mentions = std::iter::once(bot_user_id).chain(bot_name);
    for mention in mentions.filter(|m| !m.is_empty()) {
        if let Some(rest) = body.strip_prefix(mention) {
            let rest = rest.strip_prefix([',', ':', ';']).unwrap_or(rest).trim_start();
            if starts_with_command(rest, command) {
                return true;
            }
        }
    }
    false
}

fn starts_with_command(text: &str, command: &str) -> bool {
    text.strip_prefix('!')
        .and_then(|t| t.strip_prefix(command))
        .map(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        .unwrap_or(false)
}
