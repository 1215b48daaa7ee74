//! Raw value resolution
//!
//! Collapses a query result into one trimmed string: the first match wins,
//! attributes contribute their literal value and elements their text.

use crate::query::{Match, QueryEngine, QueryResult};

/// Resolve `result` to a single scalar string, or `None` when nothing matched
pub fn resolve_raw<Q: QueryEngine>(engine: &Q, result: QueryResult<Q::Node>) -> Option<String> {
    let raw = match result {
        QueryResult::Scalar(s) => s,
        QueryResult::Matches(matches) => match_value(engine, matches.into_iter().next()?),
    };
    Some(raw.trim().to_string())
}

/// The raw string carried by a single match
pub fn match_value<Q: QueryEngine>(engine: &Q, m: Match<Q::Node>) -> String {
    match m {
        Match::Node(node) => engine.text_content(&node),
        Match::Attribute { value, .. } => value,
        Match::Text(text) => text,
    }
}
