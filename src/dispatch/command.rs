//! Command-line grammar for exec requests.
//!
//! The command string is a token stream, never shell syntax.  Tokens are
//! split on whitespace with single/double-quote grouping (Git quotes the
//! repository argument, e.g. `git-upload-pack 'alice/site.git'`).  Anything
//! outside the closed verb table is rejected.

use std::fmt;

use super::error::DispatchError;
use crate::auth::Permission;

/// Recognised operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `git-upload-pack` (fetch/clone).
    RepoRead,
    /// `git-upload-archive`.
    RepoArchive,
    /// `git-receive-pack` (push).
    RepoWrite,
    RepoCreate,
    RepoList,
    WhoAmI,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepoRead => "repo-read",
            Self::RepoArchive => "repo-archive",
            Self::RepoWrite => "repo-write",
            Self::RepoCreate => "repo-create",
            Self::RepoList => "repo-list",
            Self::WhoAmI => "whoami",
        }
    }

    /// Minimum permission on the target repository, for verbs that have one.
    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            Self::RepoRead | Self::RepoArchive => Some(Permission::Read),
            Self::RepoWrite => Some(Permission::Write),
            Self::RepoCreate => Some(Permission::Admin),
            Self::RepoList | Self::WhoAmI => None,
        }
    }

    fn takes_repo(&self) -> bool {
        self.required_permission().is_some()
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated repository argument: `[namespace/]name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath {
    pub namespace: Option<String>,
    pub name: String,
}

impl RepoPath {
    /// Validate a repository argument.  Accepts an optional leading `/` and
    /// `.git` suffix; every segment must be `[A-Za-z0-9_-]+` and there may be
    /// at most two.  Anything else (`..`, empty segments, absolute paths
    /// into other trees) is a syntax error.
    pub fn parse(arg: &str) -> Result<Self, DispatchError> {
        let invalid = || DispatchError::Syntax(format!("invalid repository path: {arg:?}"));

        let trimmed = arg.strip_prefix('/').unwrap_or(arg);
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.is_empty() || segments.len() > 2 {
            return Err(invalid());
        }
        if !segments.iter().all(|s| is_valid_segment(s)) {
            return Err(invalid());
        }

        Ok(match segments.as_slice() {
            [name] => Self {
                namespace: None,
                name: name.to_string(),
            },
            [namespace, name] => Self {
                namespace: Some(namespace.to_string()),
                name: name.to_string(),
            },
            _ => return Err(invalid()),
        })
    }

    /// Qualify with `default_namespace` when no namespace was given.
    pub fn qualify(&self, default_namespace: &str) -> Result<RepoRef, DispatchError> {
        let namespace = self.namespace.as_deref().unwrap_or(default_namespace);
        if !is_valid_segment(namespace) {
            return Err(DispatchError::Syntax(format!(
                "account {namespace:?} has no usable repository namespace"
            )));
        }
        Ok(RepoRef {
            namespace: namespace.to_string(),
            name: self.name.clone(),
        })
    }
}

/// A fully qualified repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A parsed exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub verb: Verb,
    /// Raw repository argument as sent by the client.
    pub argument: Option<String>,
    pub repo: Option<RepoPath>,
    pub raw_command_line: String,
}

/// Segment allow-list: `^[A-Za-z0-9_-]+$`.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Parse an exec command line against the verb table.
pub fn parse_command(raw: &str) -> Result<CommandRequest, DispatchError> {
    let tokens = tokenize(raw)?;
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();

    let (verb, rest): (Verb, &[&str]) = match words.as_slice() {
        [] => return Err(DispatchError::Syntax("empty command".to_string())),
        ["git-upload-pack", rest @ ..]
        | ["git", "upload-pack", rest @ ..]
        | ["repo-read", rest @ ..] => (Verb::RepoRead, rest),
        ["git-upload-archive", rest @ ..] | ["git", "upload-archive", rest @ ..] => {
            (Verb::RepoArchive, rest)
        }
        ["git-receive-pack", rest @ ..]
        | ["git", "receive-pack", rest @ ..]
        | ["repo-write", rest @ ..] => (Verb::RepoWrite, rest),
        ["repo", "create", rest @ ..] | ["repo-create", rest @ ..] => (Verb::RepoCreate, rest),
        ["repo", "list", rest @ ..] | ["repo-list", rest @ ..] => (Verb::RepoList, rest),
        ["whoami", rest @ ..] => (Verb::WhoAmI, rest),
        [first, ..] => {
            return Err(DispatchError::Syntax(format!(
                "unknown command {first:?}; allowed: git-upload-pack, git-receive-pack, \
                 git-upload-archive, repo create, repo list, whoami"
            )))
        }
    };

    let (argument, repo) = if verb.takes_repo() {
        match rest {
            [arg] => (Some(arg.to_string()), Some(RepoPath::parse(arg)?)),
            [] => {
                return Err(DispatchError::Syntax(format!(
                    "{verb} requires a repository argument"
                )))
            }
            _ => {
                return Err(DispatchError::Syntax(format!(
                    "{verb} takes exactly one repository argument"
                )))
            }
        }
    } else {
        if !rest.is_empty() {
            return Err(DispatchError::Syntax(format!("{verb} takes no arguments")));
        }
        (None, None)
    };

    Ok(CommandRequest {
        verb,
        argument,
        repo,
        raw_command_line: raw.to_string(),
    })
}

/// Split a command line into tokens, honouring single quotes, double quotes
/// and backslash escapes outside single quotes.
fn tokenize(input: &str) -> Result<Vec<String>, DispatchError> {
    if input.chars().any(|c| c.is_control() && !c.is_whitespace()) {
        return Err(DispatchError::Syntax(
            "command contains control characters".to_string(),
        ));
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        if ch == '\\' && !in_single_quote {
            escape_next = true;
            has_token = true;
            continue;
        }

        if ch == '\'' && !in_double_quote {
            in_single_quote = !in_single_quote;
            has_token = true;
            continue;
        }

        if ch == '"' && !in_single_quote {
            in_double_quote = !in_double_quote;
            has_token = true;
            continue;
        }

        if ch.is_whitespace() && !in_single_quote && !in_double_quote {
            if has_token {
                tokens.push(std::mem::take(&mut current));
                has_token = false;
            }
            continue;
        }

        current.push(ch);
        has_token = true;
    }

    if in_single_quote || in_double_quote || escape_next {
        return Err(DispatchError::Syntax("unterminated quote in command".to_string()));
    }
    if has_token {
        tokens.push(current);
    }

    Ok(tokens)
}
