//! Scope satisfaction. Pure set logic: given the scopes a
//! request demands and the scopes a token carries, decide whether the token
//! satisfies the demand under an `all` or `any` policy.

use std::collections::BTreeSet;

/// How the scopes named in `scope=` combine: every one of them required, or
/// at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Satisfy {
    #[default]
    All,
    Any,
}

impl Satisfy {
    pub fn parse(s: &str) -> Self {
        match s {
            "any" => Satisfy::Any,
            _ => Satisfy::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Satisfy::All => "all",
            Satisfy::Any => "any",
        }
    }
}

/// Splits a comma-separated `scope=` (or the legacy `capability=`) parameter
/// into a normalized scope set. Empty segments are dropped.
pub fn parse_scopes(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// True if `token_scopes` satisfies `required` under `satisfy`. An empty
/// `required` set is always satisfied (no scope requirement at all).
pub fn satisfies(required: &BTreeSet<String>, token_scopes: &BTreeSet<String>, satisfy: Satisfy) -> bool {
    if required.is_empty() {
        return true;
    }
    match satisfy {
        Satisfy::All => required.is_subset(token_scopes),
        Satisfy::Any => required.iter().any(|s| token_scopes.contains(s)),
    }
}
