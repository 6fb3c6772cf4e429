//! Runtime-safe names for sandbox objects and volumes.
//!
//! Object names are derived from the user's identity through an escaping
//! strategy and a `{key}` template. The default strategy is injective: every
//! byte outside the safe alphabet, the escape character included, becomes a
//! fixed-width `<escape><hex><hex>` sequence, so no two identities can render
//! to the same name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How raw identity strings are mapped onto the runtime's name alphabet.
///
/// Changing the strategy of a live deployment renames every object, which
/// orphans the existing ones. Migrating between strategies is an explicit
/// operator task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscapeStrategy {
    /// `[a-z0-9]` plus `-` escapes with lowercase hex. DNS-label safe.
    #[default]
    Safe,
    /// `[A-Za-z0-9-]` plus `_` escapes with uppercase hex, case preserving.
    /// Kept for deployments whose objects were named this way; combined with
    /// `-` separators in templates it can collide.
    Legacy,
}

impl EscapeStrategy {
    pub fn escape_char(self) -> char {
        match self {
            EscapeStrategy::Safe => '-',
            EscapeStrategy::Legacy => '_',
        }
    }

    fn is_safe(self, byte: u8) -> bool {
        match self {
            EscapeStrategy::Safe => byte.is_ascii_lowercase() || byte.is_ascii_digit(),
            EscapeStrategy::Legacy => byte.is_ascii_alphanumeric() || byte == b'-',
        }
    }

    pub fn escape(self, raw: &str) -> String {
        let mut escaped = String::with_capacity(raw.len());
        for byte in raw.bytes() {
            if self.is_safe(byte) {
                escaped.push(byte as char);
                continue;
            }
            escaped.push(self.escape_char());
            match self {
                EscapeStrategy::Safe => escaped.push_str(&format!("{byte:02x}")),
                EscapeStrategy::Legacy => escaped.push_str(&format!("{byte:02X}")),
            }
        }
        escaped
    }

    /// Inverse of [`EscapeStrategy::escape`]; `None` if `escaped` could not
    /// have been produced by this strategy.
    pub fn unescape(self, escaped: &str) -> Option<String> {
        let bytes = escaped.as_bytes();
        let mut raw = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let byte = bytes[i];
            if byte == self.escape_char() as u8 {
                let hex = escaped.get(i + 1..i + 3)?;
                raw.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else if self.is_safe(byte) {
                raw.push(byte);
                i += 1;
            } else {
                return None;
            }
        }
        String::from_utf8(raw).ok()
    }
}

pub fn escape(raw: &str, strategy: EscapeStrategy) -> String {
    strategy.escape(raw)
}

/// Which variables volume host/guest specs see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeNaming {
    /// `{username}` is escaped, `{raw_username}` is the identity verbatim.
    #[default]
    Default,
    /// Every variable, `raw_*` included, is escaped.
    Escaped,
}

/// The fixed variable set available to `{key}` templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateNamespace {
    pub username: String,
    pub safe_username: String,
    pub raw_username: String,
    pub imagename: String,
    pub servername: String,
    pub raw_servername: String,
    pub prefix: String,
}

impl TemplateNamespace {
    pub fn get(&self, key: &str) -> Option<&str> {
        let value = match key {
            "username" => &self.username,
            "safe_username" => &self.safe_username,
            "raw_username" => &self.raw_username,
            "imagename" => &self.imagename,
            "servername" => &self.servername,
            "raw_servername" => &self.raw_servername,
            "prefix" => &self.prefix,
            _ => return None,
        };
        Some(value)
    }
}

fn try_render(template: &str, ns: &TemplateNamespace) -> Option<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        ch => key.push(ch),
                    }
                }
                rendered.push_str(ns.get(&key)?);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '}' => return None,
            _ => rendered.push(c),
        }
    }
    Some(rendered)
}

/// Substitutes `{key}` placeholders. `{{` and `}}` are literal braces.
///
/// A template that does not parse, or names an unknown key, is returned
/// unchanged: configuration values may legitimately contain braces.
pub fn render_name(template: &str, ns: &TemplateNamespace) -> String {
    try_render(template, ns).unwrap_or_else(|| template.to_string())
}

/// Applies [`render_name`] to every string inside `value`, map keys included.
pub fn render_value(value: &Value, ns: &TemplateNamespace) -> Value {
    match value {
        Value::String(s) => Value::String(render_name(s, ns)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ns)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (render_name(k, ns), render_value(v, ns)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Who a sandbox belongs to. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxIdentity {
    raw_username: String,
    escaped_username: String,
    session_name: String,
    escaped_session: String,
    prefix: String,
}

impl SandboxIdentity {
    pub fn raw_username(&self) -> &str {
        &self.raw_username
    }

    pub fn escaped_username(&self) -> &str {
        &self.escaped_username
    }

    /// Empty for the default session.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn escaped_session(&self) -> &str {
        &self.escaped_session
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_default_session(&self) -> bool {
        self.session_name.is_empty()
    }

    /// Short label for log lines.
    pub fn label(&self) -> String {
        if self.session_name.is_empty() {
            self.raw_username.clone()
        } else {
            format!("{}/{}", self.raw_username, self.session_name)
        }
    }
}

pub const DEFAULT_NAME_TEMPLATE: &str = "{prefix}-{username}";
pub const DEFAULT_NAMED_SESSION_TEMPLATE: &str = "{prefix}-{username}--{servername}";

/// Naming settings, lifted out of the spawner configuration.
#[derive(Debug, Clone)]
pub struct Naming {
    pub prefix: String,
    pub name_template: Option<String>,
    pub escape: EscapeStrategy,
    pub volume_naming: VolumeNaming,
}

impl Naming {
    pub fn identity(&self, username: &str, session: &str) -> SandboxIdentity {
        SandboxIdentity {
            raw_username: username.to_string(),
            escaped_username: self.escape.escape(username),
            session_name: session.to_string(),
            escaped_session: self.escape.escape(session),
            prefix: self.prefix.clone(),
        }
    }

    pub fn namespace(&self, identity: &SandboxIdentity, image: &str) -> TemplateNamespace {
        TemplateNamespace {
            username: identity.escaped_username.clone(),
            safe_username: identity.escaped_username.clone(),
            raw_username: identity.raw_username.clone(),
            imagename: image_label(image),
            servername: identity.escaped_session.clone(),
            raw_servername: identity.session_name.clone(),
            prefix: identity.prefix.clone(),
        }
    }

    pub fn volume_namespace(&self, identity: &SandboxIdentity, image: &str) -> TemplateNamespace {
        let mut ns = self.namespace(identity, image);
        if self.volume_naming == VolumeNaming::Escaped {
            ns.raw_username = identity.escaped_username.clone();
            ns.raw_servername = identity.escaped_session.clone();
        }
        ns
    }

    pub fn template(&self, identity: &SandboxIdentity) -> &str {
        match &self.name_template {
            Some(template) => template,
            None if identity.is_default_session() => DEFAULT_NAME_TEMPLATE,
            None => DEFAULT_NAMED_SESSION_TEMPLATE,
        }
    }

    pub fn object_name(&self, identity: &SandboxIdentity, image: &str) -> String {
        render_name(self.template(identity), &self.namespace(identity, image))
    }
}

/// Image reference reduced to characters valid in object names.
fn image_label(image: &str) -> String {
    image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
