//! Parsing and validation of `remotedoc://` addresses.
//!
//! An address names one file in one mirrored branch:
//!
//! ```text
//! remotedoc://<owner>/<repo>/<branch>/<path/to/file>
//! ```
//!
//! The first three segments are single path components; the remainder is the
//! repository-relative file path and may itself contain `/`. Validation
//! rejects traversal components (`..`), no-op components (`.`), empty
//! segments, and characters the underlying filesystem cannot represent
//! unambiguously.
//!
//! [`resolve_within`] is the single choke point through which every
//! caller-influenced path reaches the filesystem: it joins a validated
//! repository-relative path onto a mirror root and verifies the canonical
//! result stays strictly inside that root, which also catches symlink
//! escapes hiding in fetched repository content.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ReadError;

/// URL scheme prefix for document addresses.
pub const SCHEME: &str = "remotedoc://";

/// A parsed `(owner, repo, branch, path)` document address.
///
/// Constructed per request via [`Address::parse`]; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Repository-relative file path. Always non-empty, `/`-separated,
    /// free of `.` and `..` components.
    pub path: String,
}

impl Address {
    /// Parse and validate a raw address string.
    ///
    /// Returns `InvalidAddress` with a human-readable reason for every
    /// malformed input; never panics.
    pub fn parse(raw: &str) -> Result<Self, ReadError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        let rest = trimmed.strip_prefix(SCHEME).ok_or_else(|| {
            invalid(format!("address must start with '{SCHEME}', got '{trimmed}'"))
        })?;

        let mut segments = rest.splitn(4, '/');
        let owner = segments.next().unwrap_or("");
        let repo = segments.next().unwrap_or("");
        let branch = segments.next().unwrap_or("");
        let path = segments.next().unwrap_or("");

        if owner.is_empty() || repo.is_empty() || branch.is_empty() || path.is_empty() {
            return Err(invalid(
                "address requires four segments: owner/repo/branch/path",
            ));
        }

        for (label, segment) in [("owner", owner), ("repo", repo), ("branch", branch)] {
            check_segment(label, segment)?;
        }
        for segment in path.split('/') {
            check_segment("path", segment)?;
        }

        Ok(Address {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
        })
    }

    /// Directory component of `path`, or `""` for files at the repo root.
    pub fn parent_dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }

}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}{}/{}/{}/{}",
            self.owner, self.repo, self.branch, self.path
        )
    }
}

fn invalid(reason: impl Into<String>) -> ReadError {
    ReadError::InvalidAddress {
        reason: reason.into(),
    }
}

/// Reject a single address segment that could change meaning once joined
/// onto a filesystem path.
fn check_segment(label: &str, segment: &str) -> Result<(), ReadError> {
    if segment.is_empty() {
        return Err(invalid(format!("{label} contains an empty segment")));
    }
    if segment == "." || segment == ".." {
        return Err(invalid(format!("{label} contains a '{segment}' segment")));
    }
    if segment
        .chars()
        .any(|c| c == '\0' || c == '\r' || c == '\n' || c == '\\')
    {
        return Err(invalid(format!("{label} contains a forbidden character")));
    }
    Ok(())
}

/// Resolve a validated repository-relative path against a mirror root.
///
/// Canonicalizes the joined path and requires the result to be a strict
/// descendant of the canonical `mirror_root`. Every filesystem access with
/// caller-influenced segments must go through here; no other code path joins
/// raw segments onto a directory.
pub fn resolve_within(mirror_root: &Path, rel_path: &str) -> Result<PathBuf, ReadError> {
    // Re-validate defensively: this function is also reachable with paths
    // produced outside Address::parse. Traversal components are an escape
    // attempt, not merely a malformed address.
    for segment in rel_path.split('/') {
        if segment == ".." || segment == "." {
            return Err(ReadError::PathEscape {
                path: rel_path.to_string(),
            });
        }
        check_segment("path", segment)?;
    }

    let root = mirror_root.canonicalize().map_err(|source| ReadError::Io {
        path: mirror_root.display().to_string(),
        source,
    })?;

    let joined = root.join(rel_path);
    let canonical = match joined.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ReadError::FileNotFound {
                path: rel_path.to_string(),
            })
        }
        Err(source) => {
            return Err(ReadError::Io {
                path: rel_path.to_string(),
                source,
            })
        }
    };

    if canonical == root || !canonical.starts_with(&root) {
        return Err(ReadError::PathEscape {
            path: rel_path.to_string(),
        });
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(raw: &str) -> Address {
        Address::parse(raw).unwrap_or_else(|e| panic!("expected {raw} to parse: {e}"))
    }

    #[test]
    fn test_parse_basic() {
        let addr = parse_ok("remotedoc://octo/widgets/main/spec.md");
        assert_eq!(addr.owner, "octo");
        assert_eq!(addr.repo, "widgets");
        assert_eq!(addr.branch, "main");
        assert_eq!(addr.path, "spec.md");
    }

    #[test]
    fn test_parse_nested_path() {
        let addr = parse_ok("remotedoc://octo/widgets/main/docs/api/spec.md");
        assert_eq!(addr.path, "docs/api/spec.md");
        assert_eq!(addr.parent_dir(), "docs/api");
    }

    #[test]
    fn test_round_trip() {
        for raw in [
            "remotedoc://octo/widgets/main/spec.md",
            "remotedoc://a/b/release-1.2/docs/guide.md",
        ] {
            let addr = parse_ok(raw);
            assert_eq!(addr.to_string(), raw);
            assert_eq!(parse_ok(&addr.to_string()), addr);
        }
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let addr = parse_ok("  remotedoc://octo/widgets/main/spec.md\n");
        assert_eq!(addr.path, "spec.md");
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        for raw in ["https://octo/widgets/main/spec.md", "octo/widgets/main/spec.md", ""] {
            assert!(matches!(
                Address::parse(raw),
                Err(ReadError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn test_rejects_missing_segments() {
        for raw in [
            "remotedoc://",
            "remotedoc://octo",
            "remotedoc://octo/widgets",
            "remotedoc://octo/widgets/main",
            "remotedoc://octo/widgets/main/",
        ] {
            assert!(Address::parse(raw).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn test_rejects_traversal_segments() {
        for raw in [
            "remotedoc://octo/widgets/main/../secrets.md",
            "remotedoc://octo/widgets/main/docs/../../escape.md",
            "remotedoc://../widgets/main/spec.md",
            "remotedoc://octo/widgets/main/./spec.md",
        ] {
            assert!(Address::parse(raw).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn test_rejects_empty_inner_segment() {
        assert!(Address::parse("remotedoc://octo/widgets/main//spec.md").is_err());
        assert!(Address::parse("remotedoc://octo//main/spec.md").is_err());
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        assert!(Address::parse("remotedoc://octo/widgets/main/sp\0ec.md").is_err());
        assert!(Address::parse("remotedoc://octo/widgets/main/docs\\spec.md").is_err());
        assert!(Address::parse("remotedoc://octo/widgets/main/a\nb.md").is_err());
    }

    #[test]
    fn test_resolve_within_descendant() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/spec.md"), "hello").unwrap();

        let resolved = resolve_within(tmp.path(), "docs/spec.md").unwrap();
        assert!(resolved.ends_with("docs/spec.md"));
    }

    #[test]
    fn test_resolve_within_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_within(tmp.path(), "nope.md"),
            Err(ReadError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_within_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        for path in ["../outside.md", "docs/../../outside.md", "..", ".", "a/./b.md"] {
            let err = resolve_within(tmp.path(), path).unwrap_err();
            assert!(
                matches!(err, ReadError::PathEscape { .. }),
                "{path} resolved to {err:?}"
            );
        }
    }

    #[test]
    fn test_resolve_within_rejects_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.md"), "secret").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path().join("secret.md"), tmp.path().join("link.md"))
                .unwrap();
            assert!(matches!(
                resolve_within(tmp.path(), "link.md"),
                Err(ReadError::PathEscape { .. })
            ));
        }
    }
}
