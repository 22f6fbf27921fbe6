use std::collections::HashSet;

use regex::Regex;

// ─── Placeholders ────────────────────────────────────────────────

pub const UUID_PLACEHOLDER: &str = ":uuid";
pub const TOKEN_PLACEHOLDER: &str = ":token";
pub const ID_PLACEHOLDER: &str = ":id";
pub const KEY_PLACEHOLDER: &str = ":key";

/// Route words that are never collapsed into `:key`, matched
/// case-insensitively.
const STATIC_SEGMENTS: &[&str] = &[
    "api", "v1", "v2", "v3", "admin", "auth", "login", "logout", "health",
    "metrics", "status", "info", "docs", "swagger", "users", "posts",
    "comments", "orders", "products", "items", "search", "create", "update",
    "delete", "list", "get", "put", "post", "public", "private", "static",
    "assets", "images", "css", "js",
];

/// Purely alphabetic segments shorter than this are treated as route words.
const MAX_ALPHA_STATIC_LEN: usize = 20;

/// Segments of this length or shorter are never turned into `:id`.
const MAX_SHORT_NUMERIC_LEN: usize = 2;

// ─── Public types ────────────────────────────────────────────────

/// Maps raw request paths onto a bounded set of label templates.
///
/// Every non-empty segment is classified independently. The first matching
/// rule wins:
///
///   `:uuid`   an 8-4-4-4-12 hex group
///   `:token`  a base64 run of 16+ characters
///   `:id`     a whole-word digit run, segment longer than 2 characters
///   `:key`    a whole-word alphanumeric run of 8+ characters that isn't a
///             known route word
///
/// Anything else is kept literally. Placeholders never match any rule, so
/// normalizing an already-normalized path is a no-op.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    uuid: Regex,
    token: Regex,
    integer: Regex,
    alphanumeric: Regex,
    alphabetic: Regex,
    static_segments: HashSet<String>,
}

impl PathNormalizer {
    pub fn new() -> Self {
        Self::with_static_segments(std::iter::empty::<String>())
    }

    /// Build a normalizer whose static vocabulary is extended by `extra`.
    pub fn with_static_segments<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let static_segments = STATIC_SEGMENTS
            .iter()
            .map(|s| s.to_string())
            .chain(extra.into_iter().map(|s| s.as_ref().to_ascii_lowercase()))
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            uuid: compile(
                r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            ),
            token: compile(r"[A-Za-z0-9+/]{16,}={0,2}"),
            integer: compile(r"(?-u:\b)[0-9]+(?-u:\b)"),
            alphanumeric: compile(r"(?-u:\b)[a-zA-Z0-9]{8,}(?-u:\b)"),
            alphabetic: compile(r"^[a-zA-Z]+$"),
            static_segments,
        }
    }

    /// Normalize `path` into its label template.
    ///
    /// The query string (if any) is split off before classification and
    /// appended back untouched.
    pub fn normalize(&self, path: &str) -> String {
        if path.is_empty() || path == "/" {
            return path.to_owned();
        }

        let (path, query) = match path.find('?') {
            Some(idx) => path.split_at(idx),
            None => (path, ""),
        };

        let mut out = String::with_capacity(path.len() + query.len());
        for (i, segment) in path.split('/').enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(self.classify(segment));
        }
        out.push_str(query);
        out
    }

    /// Returns the placeholder for `segment`, or the segment itself.
    fn classify<'a>(&self, segment: &'a str) -> &'a str {
        if segment.is_empty() {
            return segment;
        }

        if self.uuid.is_match(segment) {
            UUID_PLACEHOLDER
        } else if self.token.is_match(segment) {
            TOKEN_PLACEHOLDER
        } else if segment.len() > MAX_SHORT_NUMERIC_LEN
            && self.integer.is_match(segment)
        {
            ID_PLACEHOLDER
        } else if self.alphanumeric.is_match(segment)
            && !self.is_static_segment(segment)
        {
            KEY_PLACEHOLDER
        } else {
            segment
        }
    }

    fn is_static_segment(&self, segment: &str) -> bool {
        if self.static_segments.contains(&segment.to_ascii_lowercase()) {
            return true;
        }

        // Filenames and extensions
        if segment.contains('.') {
            return true;
        }

        segment.len() < MAX_ALPHA_STATIC_LEN && self.alphabetic.is_match(segment)
    }
}

impl Default for PathNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Patterns are compile-time literals; a failure here is a programming error.
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("normalizer pattern")
}
