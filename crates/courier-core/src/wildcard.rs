//! AMQP-style topic wildcards.
//!
//! Routing keys are `.`-separated segments. In a pattern, `*` matches
//! exactly one segment and `#` matches zero or more segments. Patterns are
//! compiled once into anchored regular expressions.
//!
//! When several wildcard patterns match the same routing key, the one
//! registered first wins. Registration order is therefore significant.

use std::sync::Arc;

use regex::Regex;

/// Whether `pattern` contains a topic wildcard.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('#')
}

/// Compile a routing-key pattern into an anchored regex.
///
/// Returns `None` if the pattern has no wildcard (exact lookups handle
/// those) or if the generated expression is rejected.
pub fn compile_routing_key(pattern: &str) -> Option<Regex> {
    if !is_wildcard(pattern) {
        return None;
    }

    let mut source = String::from("^");
    let mut emitted = false;
    let mut pending_hash = false;

    for segment in pattern.split('.') {
        if segment == "#" {
            pending_hash = true;
            continue;
        }
        let token = if segment == "*" {
            "[^.]+".to_owned()
        } else {
            regex::escape(segment)
        };
        match (emitted, pending_hash) {
            (false, false) => {}
            (false, true) => source.push_str("(?:.*\\.)?"),
            (true, false) => source.push_str("\\."),
            (true, true) => source.push_str("(?:\\..*)?\\."),
        }
        source.push_str(&token);
        emitted = true;
        pending_hash = false;
    }

    if pending_hash {
        source.push_str(if emitted { "(?:\\..*)?" } else { ".*" });
    }
    source.push('$');

    Regex::new(&source).ok()
}

/// A compiled wildcard pattern bound to a handler.
#[derive(Debug)]
pub struct WildcardEntry<H: ?Sized> {
    /// Pattern as registered.
    pub pattern: String,
    /// Compiled matcher.
    pub regex: Regex,
    /// Handler invoked on match.
    pub handler: Arc<H>,
}

/// Ordered list of wildcard entries; first match wins.
#[derive(Debug)]
pub struct WildcardRouter<H: ?Sized> {
    entries: Vec<WildcardEntry<H>>,
}

impl<H: ?Sized> Default for WildcardRouter<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<H: ?Sized> WildcardRouter<H> {
    /// Build a router from `(pattern, handler)` pairs in registration order.
    /// Patterns without wildcards are skipped.
    pub fn from_patterns<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = (String, Arc<H>)>,
    {
        let entries = patterns
            .into_iter()
            .filter_map(|(pattern, handler)| {
                let regex = compile_routing_key(&pattern)?;
                Some(WildcardEntry {
                    pattern,
                    regex,
                    handler,
                })
            })
            .collect();
        Self { entries }
    }

    /// First entry whose regex matches `routing_key`.
    pub fn find(&self, routing_key: &str) -> Option<&WildcardEntry<H>> {
        self.entries.iter().find(|e| e.regex.is_match(routing_key))
    }

    /// Number of compiled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no wildcard patterns were registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
