//! Pattern matching primitives shared by the rule types.

use aegis_domain::{Error, Result};
use globset::{Glob, GlobBuilder, GlobMatcher};

/// Compile a path glob: `**` spans segments, `*` matches within one
/// segment, `?` matches one character.
pub fn compile_path_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::Config(format!("path pattern '{pattern}': {e}")))
}

/// Compile a plain glob over an opaque string (shell commands, secret
/// names): `*` matches anything including separators.
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::Config(format!("pattern '{pattern}': {e}")))
}

/// Host pattern match. `*.suffix` matches any label followed by
/// `.suffix` and the bare `suffix` itself; anything else is an exact,
/// case-insensitive comparison.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        host == pattern
    }
}

/// Whether `path` is inside `base` at a path-segment boundary
/// (`/tmp-other/x` is not within `/tmp`).
pub fn path_within(base: &str, path: &str) -> bool {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return path.starts_with('/');
    }
    path == base || path.strip_prefix(base).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_glob_segments() {
        let m = compile_path_glob("/home/*/.ssh/**").unwrap();
        assert!(m.is_match("/home/u/.ssh/id_rsa"));
        assert!(m.is_match("/home/u/.ssh/keys/old/id_rsa"));
        assert!(!m.is_match("/home/a/b/.ssh/id_rsa")); // `*` is one segment

        let m = compile_path_glob("**/.ssh/**").unwrap();
        assert!(m.is_match("/home/u/.ssh/id_rsa"));
        assert!(m.is_match("var/data/.ssh/x"));
    }

    #[test]
    fn path_glob_question_mark() {
        let m = compile_path_glob("/tmp/file?.txt").unwrap();
        assert!(m.is_match("/tmp/file1.txt"));
        assert!(!m.is_match("/tmp/file10.txt"));
    }

    #[test]
    fn plain_glob_spans_everything() {
        let m = compile_glob("rm *").unwrap();
        assert!(m.is_match("rm -rf /"));
        assert!(!m.is_match("firm -rf /"));

        let m = compile_glob("AWS_*").unwrap();
        assert!(m.is_match("AWS_SECRET_ACCESS_KEY"));
        assert!(!m.is_match("MY_AWS_KEY"));
    }

    #[test]
    fn host_wildcards() {
        assert!(host_matches("*.example.com", "a.example.com"));
        assert!(host_matches("*.example.com", "deep.a.example.com"));
        assert!(host_matches("*.example.com", "example.com"));
        assert!(!host_matches("*.example.com", "notexample.com"));
        assert!(host_matches("api.internal", "API.INTERNAL"));
        assert!(!host_matches("api.internal", "api.internal.evil.com"));
    }

    #[test]
    fn within_respects_segment_boundaries() {
        assert!(path_within("/tmp", "/tmp/x"));
        assert!(path_within("/tmp", "/tmp"));
        assert!(path_within("/tmp/", "/tmp/a/b"));
        assert!(!path_within("/tmp", "/tmp-other/x"));
        assert!(!path_within("/tmp", "/var/tmp"));
    }
}
