//! Identity types: `SessionKey` (spec.md §3) and `SessionContext` (spec.md §9).

use std::fmt;

/// Canonicalizes a context path the way every adapter in this workspace
/// expects it: `/`, `.`, and `\` are folded to `_`, and an empty path stays
/// empty (the root context).
///
/// Grounded in the file-store filename convention of `spec.md` §6, which is
/// the one place the source spec nails down exact canonicalization rules;
/// every other component reuses this so that `(id, contextPath, vhost)`
/// triples compare consistently regardless of store.
pub fn canonicalize_context_path(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' | '.' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// Explicit, per-call context passed to every operation that needs to know
/// which deployment it is acting for, rather than a thread-local (spec.md
/// §9, "Global session context on a thread").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Server-wide worker/node name. Empty means "no worker suffix".
    pub worker_name: String,
    /// Canonicalized context path owning this session scope.
    pub canonical_context_path: String,
    /// Virtual host owning this session scope.
    pub vhost: String,
    /// Set by callers whose attribute type belongs to "system" space as
    /// opposed to "application" space. Single-runtime implementations that
    /// have no such distinction should leave this `false`.
    pub classloader_hint: bool,
}

impl SessionContext {
    pub fn new(worker_name: impl Into<String>, context_path: &str, vhost: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            canonical_context_path: canonicalize_context_path(context_path),
            vhost: vhost.into(),
            classloader_hint: false,
        }
    }

    /// Build the identity key for a session id under this context.
    pub fn key(&self, id: impl Into<String>) -> SessionKey {
        SessionKey {
            id: id.into(),
            context_path: self.canonical_context_path.clone(),
            vhost: self.vhost.clone(),
        }
    }
}

/// Identity triple `(id, canonicalContextPath, canonicalVirtualHost)` from
/// `spec.md` §3. Two sessions with identical `id` may exist in two distinct
/// contexts and are different sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub id: String,
    pub context_path: String,
    pub vhost: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.id, self.vhost, self.context_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_path_separators() {
        assert_eq!(canonicalize_context_path("/foo/bar.baz"), "_foo_bar_baz");
        assert_eq!(canonicalize_context_path(""), "");
        assert_eq!(canonicalize_context_path("a\\b"), "a_b");
    }

    #[test]
    fn context_builds_distinct_keys_for_same_id() {
        let a = SessionContext::new("node1", "/app", "host-a");
        let b = SessionContext::new("node1", "/other", "host-a");

        assert_ne!(a.key("S1"), b.key("S1"));
    }
}
