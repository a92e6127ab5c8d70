//! Context path normalization and `session@workspace://path` URLs.

use std::fmt;
use std::str::FromStr;

use crate::error::{IndexError, IndexResult};

pub const ROOT_PATH: &str = "/";

/// Characters that may never appear in a context path or URL.
const DISALLOWED: &[char] = &[
    '`', '$', '%', '^', '*', ';', '\'', '"', ',', '<', '>', '{', '}', '[', ']',
];

/// Normalize a context path.
///
/// Backslashes become `/`, runs of spaces become `_`, empty segments are
/// dropped. The result always starts with `/` and never ends with one
/// (except the root itself).
pub fn normalize_path(input: &str) -> IndexResult<String> {
    check_chars("normalize_path", input)?;
    let unified = collapse_spaces(&input.replace('\\', "/"));
    let segments: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();
    Ok(format!("/{}", segments.join("/")))
}

/// Segments of a normalized path; empty for the root.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Parent of a normalized path. The root has no parent.
pub fn parent_path(path: &str) -> Option<String> {
    let segs = segments(path);
    if segs.is_empty() {
        return None;
    }
    Some(format!("/{}", segs[..segs.len() - 1].join("/")))
}

/// Join a normalized parent path and one segment.
pub fn join_path(parent: &str, segment: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{}", segment)
    } else {
        format!("{}/{}", parent, segment)
    }
}

fn check_chars(operation: &'static str, input: &str) -> IndexResult<()> {
    if let Some(c) = input.chars().find(|c| DISALLOWED.contains(c)) {
        return Err(IndexError::validation(
            operation,
            format!("unsupported character '{}' in '{}'", c, input),
        ));
    }
    Ok(())
}

fn collapse_spaces(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for c in input.chars() {
        if c == ' ' {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// A parsed context URL.
///
/// Accepted forms: `session@workspace://path`, `workspace://path`, and a bare
/// path (`/a/b` or `a/b`), which leaves the workspace unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextUrl {
    pub session: Option<String>,
    pub workspace: Option<String>,
    pub path: String,
}

impl ContextUrl {
    pub fn parse(input: &str) -> IndexResult<Self> {
        const OP: &str = "parse_context_url";
        if input.trim().is_empty() {
            return Err(IndexError::validation(OP, "context URL must not be empty"));
        }
        check_chars(OP, input)?;
        let unified = collapse_spaces(&input.replace('\\', "/"));

        let (authority, raw_path) = match unified.split_once("://") {
            Some((authority, rest)) => (Some(authority), rest),
            None => (None, unified.as_str()),
        };
        let (session, workspace) = match authority {
            None => (None, None),
            Some(a) => {
                let (session, workspace) = match a.split_once('@') {
                    Some((s, w)) => (Some(s), w),
                    None => (None, a),
                };
                if workspace.is_empty() || workspace.contains('/') || workspace.contains(':') {
                    return Err(IndexError::validation(
                        OP,
                        format!("invalid workspace in '{}'", input),
                    ));
                }
                if session.map(str::is_empty).unwrap_or(false) {
                    return Err(IndexError::validation(
                        OP,
                        format!("empty session in '{}'", input),
                    ));
                }
                (session.map(str::to_string), Some(workspace.to_string()))
            }
        };
        Ok(Self {
            session,
            workspace,
            path: normalize_path(raw_path)?,
        })
    }
}

impl fmt::Display for ContextUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bare = self.path.trim_start_matches('/');
        match (&self.session, &self.workspace) {
            (Some(s), Some(w)) => write!(f, "{}@{}://{}", s, w, bare),
            (None, Some(w)) => write!(f, "{}://{}", w, bare),
            _ => f.write_str(&self.path),
        }
    }
}

impl FromStr for ContextUrl {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("").unwrap(), "/");
        assert_eq!(normalize_path("a//b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("\\work\\my   project").unwrap(), "/work/my_project");
        assert_eq!(normalize_path("/Work/Reports").unwrap(), "/Work/Reports");
        assert!(normalize_path("/a/$b").is_err());
        assert!(normalize_path("/a/[b]").is_err());
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(parent_path("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent_path("/a").as_deref(), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_parse_url_forms() {
        let full: ContextUrl = "laptop@work://projects/report".parse().unwrap();
        assert_eq!(full.session.as_deref(), Some("laptop"));
        assert_eq!(full.workspace.as_deref(), Some("work"));
        assert_eq!(full.path, "/projects/report");
        assert_eq!(full.to_string(), "laptop@work://projects/report");

        let ws = ContextUrl::parse("universe:///a").unwrap();
        assert_eq!(ws.session, None);
        assert_eq!(ws.workspace.as_deref(), Some("universe"));
        assert_eq!(ws.path, "/a");

        let bare = ContextUrl::parse("a b\\c").unwrap();
        assert_eq!(bare.workspace, None);
        assert_eq!(bare.path, "/a_b/c");
        assert_eq!(bare.to_string(), "/a_b/c");

        assert!(ContextUrl::parse("@work://a").is_err());
        assert!(ContextUrl::parse("://a").is_err());
        assert!(ContextUrl::parse("  ").is_err());
        assert!(ContextUrl::parse("work://a;b").is_err());
    }
}
