//! Rendering of OpenSSH `authorized_keys` entries with a forced command.
//!
//! Every line has the shape
//!
//! ```text
//! command="<dispatcher> USER=<id> LOGIN=<login>",no-port-forwarding,no-X11-forwarding,no-agent-forwarding,no-pty <type> <blob> [comment]
//! ```
//!
//! Identity data travels as structured bindings until the very last step.
//! Values that could break out of the quoted option are rejected rather than
//! escaped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};

use crate::identity::{AuthorizedKey, Identity};

/// Binding carrying the identity's opaque id.
pub const USER_BINDING: &str = "USER";
/// Binding carrying the identity's login.
pub const LOGIN_BINDING: &str = "LOGIN";

/// The restrictions applied to every emitted key, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Restriction {
    NoPortForwarding,
    NoX11Forwarding,
    NoAgentForwarding,
    NoPty,
}

impl Restriction {
    pub const ALL: [Restriction; 4] = [
        Restriction::NoPortForwarding,
        Restriction::NoX11Forwarding,
        Restriction::NoAgentForwarding,
        Restriction::NoPty,
    ];

    pub fn as_option(&self) -> &'static str {
        match self {
            Self::NoPortForwarding => "no-port-forwarding",
            Self::NoX11Forwarding => "no-X11-forwarding",
            Self::NoAgentForwarding => "no-agent-forwarding",
            Self::NoPty => "no-pty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("dispatcher command {0:?} contains characters not allowed inside a quoted option")]
    UnsafeCommand(String),
    #[error("binding name {0:?} is not a valid environment variable name")]
    UnsafeBindingName(String),
    #[error("binding {name} has a value with disallowed characters: {value:?}")]
    UnsafeBindingValue { name: String, value: String },
    #[error("key field {0:?} contains whitespace or control characters")]
    UnsafeKeyField(String),
}

/// A fully rendered `authorized_keys` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedCommandSpec {
    pub env_bindings: BTreeMap<String, String>,
    pub restrictions: BTreeSet<Restriction>,
    pub public_key_line: String,
}

impl fmt::Display for ForcedCommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.public_key_line)
    }
}

/// Renders keys for one dispatcher invocation.
#[derive(Debug, Clone)]
pub struct Emitter {
    dispatcher_command: String,
}

impl Emitter {
    pub fn new(dispatcher_command: impl Into<String>) -> Result<Self, RenderError> {
        let dispatcher_command = dispatcher_command.into().trim().to_string();
        let unsafe_char = |c: char| c == '"' || c == '\\' || c.is_control();
        if dispatcher_command.is_empty() || dispatcher_command.chars().any(unsafe_char) {
            return Err(RenderError::UnsafeCommand(dispatcher_command));
        }
        Ok(Self { dispatcher_command })
    }

    /// Render one key for `identity`.  Pure: identical inputs always give
    /// byte-identical output.
    pub fn render(
        &self,
        key: &AuthorizedKey,
        identity: &Identity,
    ) -> Result<ForcedCommandSpec, RenderError> {
        let mut env_bindings = BTreeMap::new();
        env_bindings.insert(USER_BINDING.to_string(), identity.id.clone());
        env_bindings.insert(LOGIN_BINDING.to_string(), identity.login.clone());

        for (name, value) in &env_bindings {
            if !is_binding_name(name) {
                return Err(RenderError::UnsafeBindingName(name.clone()));
            }
            if !is_binding_value(value) {
                return Err(RenderError::UnsafeBindingValue {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
        for field in [&key.key_type, &key.key_blob] {
            if field.is_empty() || field.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(RenderError::UnsafeKeyField(field.clone()));
            }
        }

        let restrictions: BTreeSet<Restriction> = Restriction::ALL.into_iter().collect();

        let bindings = env_bindings
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let mut options = vec![format!("command=\"{} {bindings}\"", self.dispatcher_command)];
        options.extend(restrictions.iter().map(|r| r.as_option().to_string()));

        let mut line = format!("{} {} {}", options.join(","), key.key_type, key.key_blob);
        if let Some(comment) = key.comment.as_deref().map(sanitize_comment) {
            if !comment.is_empty() {
                line.push(' ');
                line.push_str(&comment);
            }
        }

        Ok(ForcedCommandSpec {
            env_bindings,
            restrictions,
            public_key_line: line,
        })
    }

    /// Render every key into a complete `authorized_keys` document, sorted by
    /// fingerprint so regeneration is deterministic.  Keys that cannot be
    /// rendered safely are skipped and reported.
    pub fn render_all(&self, keys: &[AuthorizedKey]) -> (String, Vec<(String, RenderError)>) {
        let mut sorted: Vec<&AuthorizedKey> = keys.iter().collect();
        sorted.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        let mut out = String::new();
        let mut skipped = Vec::new();
        for key in sorted {
            match self.render(key, &key.owner) {
                Ok(spec) => {
                    out.push_str(&spec.public_key_line);
                    out.push('\n');
                }
                Err(e) => skipped.push((key.fingerprint.clone(), e)),
            }
        }
        (out, skipped)
    }
}

fn is_binding_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_')
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn is_binding_value(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
}

/// Comments are free text but must stay on one line.
fn sanitize_comment(comment: &str) -> String {
    comment
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Write a rendered document to `path` atomically (temp file + rename in the
/// same directory) with mode 0600.
pub fn write_authorized_keys(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt as _;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())
        .context("failed to write authorized_keys contents")?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .context("failed to set authorized_keys permissions")?;
    tmp.as_file()
        .sync_all()
        .context("failed to sync authorized_keys")?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    info!(path = %path.display(), bytes = contents.len(), "authorized_keys written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One parsed `authorized_keys` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyLine {
    pub options: Vec<String>,
    pub key_type: String,
    pub key_blob: String,
    pub comment: Option<String>,
}

#[cfg(test)]
impl ParsedKeyLine {
    /// The unquoted value of the `command=` option, if present.
    fn command(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| {
            opt.strip_prefix("command=\"")
                .and_then(|rest| rest.strip_suffix('"'))
        })
    }
}

/// Parse an `authorized_keys` line: optional comma-separated options (double
/// quotes may protect commas and spaces), then key type, blob and comment.
pub fn parse_key_line(line: &str) -> Option<ParsedKeyLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (options, rest) = if looks_like_key_type(line) {
        (Vec::new(), line)
    } else {
        split_options(line)?
    };

    let mut parts = rest.splitn(3, char::is_whitespace);
    let key_type = parts.next()?.to_string();
    let key_blob = parts.next()?.trim().to_string();
    if key_type.is_empty() || key_blob.is_empty() {
        return None;
    }
    let comment = parts
        .next()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    debug!(%key_type, options = options.len(), "parsed authorized_keys line");
    Some(ParsedKeyLine {
        options,
        key_type,
        key_blob,
        comment,
    })
}

fn looks_like_key_type(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or("");
    first.starts_with("ssh-") || first.starts_with("ecdsa-") || first.starts_with("sk-")
}

/// Split the leading option list off a line.
fn split_options(line: &str) -> Option<(Vec<String>, &str)> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => options.push(std::mem::take(&mut current)),
            c if c.is_whitespace() && !in_quotes => {
                options.push(std::mem::take(&mut current));
                return Some((options, line[idx..].trim_start()));
            }
            c => current.push(c),
        }
    }
    None
}
