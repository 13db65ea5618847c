//! Rewriting of relative markdown links into `remotedoc://` addresses.
//!
//! A document fetched in isolation must stay navigable: every relative link
//! target is resolved against the directory of the document's own address
//! and re-emitted as a full `remotedoc://owner/repo/branch/path` URL.
//! Absolute URLs, protocol-relative URLs, `mailto:` links, and in-document
//! anchors are left alone, which also makes the rewrite idempotent:
//! already-rewritten targets carry the `remotedoc` scheme and are skipped.
//!
//! Only link *targets* change. Link text, titles, and all surrounding
//! content are byte-identical to the source.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::address::{Address, SCHEME};

/// Inline links and images: `[text](target)`, `[text](target "title")`.
static INLINE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)]+)\)").unwrap());

/// Target/title split inside an inline link's parentheses.
static TARGET_AND_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^([^\s"'<>]+)(?:\s+["']([^"']*)["'])?$"#).unwrap());

/// Reference link definitions: `[ref]: target` with an optional title.
static REFERENCE_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^([ \t]*)\[([^\]]+)\]:[ \t]+([^\s"']+)(?:[ \t]+["']([^"']*)["'])?[ \t]*$"#)
        .unwrap()
});

/// Any scheme-qualified URL, e.g. `http://`, `https://`, `remotedoc://`.
static HAS_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").unwrap());

/// Rewrite all relative link targets in `content` against `self_address`.
pub fn rewrite_links(content: &str, self_address: &Address) -> String {
    if content.is_empty() {
        return String::new();
    }

    let rewritten = INLINE_LINK.replace_all(content, |caps: &Captures<'_>| {
        let text = &caps[1];
        let inner = &caps[2];
        match TARGET_AND_TITLE.captures(inner) {
            Some(parts) => {
                let target = rewrite_target(&parts[1], self_address);
                match parts.get(2) {
                    Some(title) => format!("[{text}]({target} \"{}\")", title.as_str()),
                    None => format!("[{text}]({target})"),
                }
            }
            // Unsplittable inner text (angle brackets, embedded quotes):
            // treat the whole thing as the target, as a best effort.
            None => format!("[{text}]({})", rewrite_target(inner, self_address)),
        }
    });

    REFERENCE_DEF
        .replace_all(&rewritten, |caps: &Captures<'_>| {
            let indent = &caps[1];
            let label = &caps[2];
            let target = rewrite_target(&caps[3], self_address);
            match caps.get(4) {
                Some(title) => format!("{indent}[{label}]: {target} \"{}\"", title.as_str()),
                None => format!("{indent}[{label}]: {target}"),
            }
        })
        .into_owned()
}

/// Rewrite one link target, or return it unchanged when it is not a
/// rewritable relative path.
fn rewrite_target(target: &str, self_address: &Address) -> String {
    if target.starts_with('#') {
        return target.to_string();
    }

    // Query string / fragment travel with the link, not the path.
    let split_at = target.find(['?', '#']).unwrap_or(target.len());
    let (path_part, suffix) = target.split_at(split_at);

    if path_part.is_empty()
        || HAS_SCHEME.is_match(path_part)
        || path_part.starts_with("//")
        || path_part.starts_with("mailto:")
    {
        return target.to_string();
    }

    match resolve_relative(self_address.parent_dir(), path_part) {
        Some(resolved) => format!(
            "{SCHEME}{}/{}/{}/{}{}",
            self_address.owner, self_address.repo, self_address.branch, resolved, suffix
        ),
        // A `..` that climbs past the repository root cannot be mapped to
        // an address; pass the original target through untouched.
        None => target.to_string(),
    }
}

/// Normalize `rel` against the directory `base`, collapsing `.` and `..`.
///
/// Returns `None` when a `..` would escape the repository root.
fn resolve_relative(base: &str, rel: &str) -> Option<String> {
    let mut parts: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };

    for segment in rel.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(path: &str) -> Address {
        Address {
            owner: "octo".to_string(),
            repo: "widgets".to_string(),
            branch: "main".to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_sibling_link_from_repo_root() {
        let out = rewrite_links("[Spec](docs/spec.md)", &addr("README.md"));
        assert_eq!(out, "[Spec](remotedoc://octo/widgets/main/docs/spec.md)");
    }

    #[test]
    fn test_relative_link_resolves_against_document_directory() {
        let out = rewrite_links("[API](api/spec.md)", &addr("docs/guide.md"));
        assert_eq!(out, "[API](remotedoc://octo/widgets/main/docs/api/spec.md)");
    }

    #[test]
    fn test_dot_prefix_and_parent_navigation() {
        let a = addr("docs/guide.md");
        assert_eq!(
            rewrite_links("![Logo](./images/logo.png)", &a),
            "![Logo](remotedoc://octo/widgets/main/docs/images/logo.png)"
        );
        assert_eq!(
            rewrite_links("[Up](../README.md)", &a),
            "[Up](remotedoc://octo/widgets/main/README.md)"
        );
    }

    #[test]
    fn test_escaping_dotdot_passes_through_unchanged() {
        let out = rewrite_links("[Out](../../outside.md)", &addr("docs/guide.md"));
        assert_eq!(out, "[Out](../../outside.md)");
    }

    #[test]
    fn test_absolute_urls_untouched() {
        let content = "[A](https://example.com/x) [B](http://e.com) [C](mailto:a@b.c) [D](//cdn.example.com/y)";
        assert_eq!(rewrite_links(content, &addr("README.md")), content);
    }

    #[test]
    fn test_anchor_links_untouched() {
        let content = "[Section](#usage)";
        assert_eq!(rewrite_links(content, &addr("docs/guide.md")), content);
    }

    #[test]
    fn test_fragment_and_query_preserved() {
        let a = addr("docs/guide.md");
        assert_eq!(
            rewrite_links("[S](api/spec.md#section-2)", &a),
            "[S](remotedoc://octo/widgets/main/docs/api/spec.md#section-2)"
        );
        assert_eq!(
            rewrite_links("[S](api/spec.md?plain=1)", &a),
            "[S](remotedoc://octo/widgets/main/docs/api/spec.md?plain=1)"
        );
    }

    #[test]
    fn test_title_preserved() {
        let out = rewrite_links(r#"[Spec](spec.md "The spec")"#, &addr("README.md"));
        assert_eq!(
            out,
            r#"[Spec](remotedoc://octo/widgets/main/spec.md "The spec")"#
        );
    }

    #[test]
    fn test_reference_definitions_rewritten() {
        let content = "See [the spec][s].\n\n[s]: api/spec.md \"Spec\"\n[ext]: https://example.com\n";
        let out = rewrite_links(content, &addr("docs/guide.md"));
        assert!(out.contains("[s]: remotedoc://octo/widgets/main/docs/api/spec.md \"Spec\""));
        assert!(out.contains("[ext]: https://example.com"));
    }

    #[test]
    fn test_idempotent() {
        let content = "[A](api/spec.md) [B](#x) [C](https://e.com) [D](../../esc.md)";
        let a = addr("docs/guide.md");
        let once = rewrite_links(content, &a);
        let twice = rewrite_links(&once, &a);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_link_text_and_prose_untouched() {
        let content = "Intro text.\n\nRead [the API spec](api/spec.md) carefully.\n";
        let out = rewrite_links(content, &addr("docs/guide.md"));
        assert!(out.starts_with("Intro text.\n\nRead [the API spec]("));
        assert!(out.ends_with(") carefully.\n"));
    }

    #[test]
    fn test_empty_content() {
        assert_eq!(rewrite_links("", &addr("README.md")), "");
    }
}
