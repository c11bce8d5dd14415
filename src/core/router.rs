//! Prefix trie mapping request paths to handler keys.
//!
//! Patterns are split on `/` into segments. A segment is either a literal, a
//! named parameter (`:id`) or a trailing wildcard (`*`). Matching walks the
//! trie one segment at a time, preferring a literal child, then the parameter
//! child, then the wildcard child. A wildcard ends the walk immediately.
//!
//! Matching never backtracks: once a parameter or wildcard branch is taken a
//! dead end further down falls back to the default key, even when a sibling
//! branch could have matched.
//!
//! The tree is built once and then only read. Callers that need a different
//! route set build a fresh tree and swap it in.
use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while registering a route.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    #[error("route '{pattern}' declares parameter ':{new}' where ':{existing}' is already registered")]
    ParameterConflict {
        pattern: String,
        existing: String,
        new: String,
    },

    #[error("route '{0}' has segments after the '*' wildcard")]
    WildcardNotLast(String),

    #[error("route '{0}' has an empty parameter name")]
    EmptyParameter(String),
}

/// Captured `:name` parameters, keyed without the leading colon.
pub type Params = HashMap<String, String>;

#[derive(Debug, Default, Clone)]
struct Node {
    handler: Option<String>,
    literals: HashMap<String, Node>,
    param: Option<Box<ParamNode>>,
    wildcard: Option<Box<Node>>,
}

#[derive(Debug, Clone)]
struct ParamNode {
    name: String,
    node: Node,
}

/// Route trie with a fallback handler key.
#[derive(Debug, Default, Clone)]
pub struct RouteTree {
    root: Node,
    not_found: String,
}

impl RouteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key returned when nothing matches. An empty key means "no handler".
    pub fn set_default(&mut self, handler: impl Into<String>) {
        self.not_found = handler.into();
    }

    pub fn default_handler(&self) -> &str {
        &self.not_found
    }

    /// Insert `pattern`, overwriting any handler already stored at that position.
    pub fn add(&mut self, pattern: &str, handler: impl Into<String>) -> Result<(), RouteError> {
        let segments = clean(pattern);
        let mut current = &mut self.root;

        for (i, segment) in segments.iter().enumerate() {
            if *segment == "*" {
                if i + 1 != segments.len() {
                    return Err(RouteError::WildcardNotLast(pattern.to_string()));
                }
                current = &mut **current.wildcard.get_or_insert_with(Box::default);
            } else if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouteError::EmptyParameter(pattern.to_string()));
                }
                let param = current.param.get_or_insert_with(|| {
                    Box::new(ParamNode {
                        name: name.to_string(),
                        node: Node::default(),
                    })
                });
                if param.name != name {
                    return Err(RouteError::ParameterConflict {
                        pattern: pattern.to_string(),
                        existing: param.name.clone(),
                        new: name.to_string(),
                    });
                }
                current = &mut param.node;
            } else {
                current = current.literals.entry(segment.to_string()).or_default();
            }
        }

        current.handler = Some(handler.into());
        Ok(())
    }

    /// Resolve `path` (query string allowed) to a handler key and its parameters.
    pub fn match_path(&self, path: &str) -> (&str, Params) {
        let mut params = Params::new();
        let mut current = &self.root;

        for segment in clean(path) {
            if let Some(child) = current.literals.get(segment) {
                current = child;
            } else if let Some(param) = &current.param {
                params.insert(param.name.clone(), segment.to_string());
                current = &param.node;
            } else if let Some(wildcard) = &current.wildcard {
                return (self.handler_or_default(wildcard), params);
            } else {
                return (&self.not_found, params);
            }
        }

        (self.handler_or_default(current), params)
    }

    fn handler_or_default<'a>(&'a self, node: &'a Node) -> &'a str {
        node.handler.as_deref().unwrap_or(&self.not_found)
    }
}

/// Strip the query string, collapse repeated slashes and drop the leading one.
fn clean(path: &str) -> Vec<&str> {
    let path = path.split('?').next().unwrap_or_default();
    let path = path.trim_start_matches('/');

    let mut segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    let mut index = 0;
    // empty segments before the last one come from "//"
    segments.retain(|segment| {
        let keep = !segment.is_empty() || index == last;
        index += 1;
        keep
    });
    segments
}
