//! Method-name routing convention shared by server and client.
//!
//! A method name splits into an optional verb prefix and a noun:
//! `getUser` → (`GET`, `User`), `delete_item` → (`DELETE`, `item`),
//! `createThing` → (`POST`, `createThing`). The server registers
//! `verb:noun` as the primary key and `verb:fullname` as an alternate key,
//! both lowercased. The client derives the same verb and path segment, and
//! forces bodiless verbs to POST when the call carries arguments.

use std::fmt;

/// HTTP verbs recognised as method-name prefixes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl Verb {
    /// All verbs, in prefix-matching order.
    pub const ALL: [Self; 4] = [Self::Get, Self::Post, Self::Put, Self::Delete];

    /// Lowercase name, as used in route keys and method prefixes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }

    /// Uppercase HTTP method name.
    pub fn as_method(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Parse an HTTP method name (case-insensitive).
    pub fn parse(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(method))
    }

    /// Whether requests with this verb carry a body.
    pub fn carries_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_method())
    }
}

/// Split a method name into its verb and noun.
///
/// The prefix only counts when followed by an uppercase ASCII letter or an
/// underscore, so `getaway` stays a POST noun. Names without a recognised
/// prefix default to POST with the whole name as the noun.
pub fn split_method_name(name: &str) -> (Verb, &str) {
    for verb in Verb::ALL {
        let prefix = verb.as_str();
        if name.len() <= prefix.len() || !name.is_char_boundary(prefix.len()) {
            continue;
        }
        let (head, rest) = name.split_at(prefix.len());
        if !head.eq_ignore_ascii_case(prefix) {
            continue;
        }
        let Some(next) = rest.chars().next() else {
            continue;
        };
        if next.is_ascii_uppercase() || next == '_' {
            let noun = rest.trim_start_matches('_');
            if !noun.is_empty() {
                return (verb, noun);
            }
        }
    }
    (Verb::Post, name)
}

/// Build a lookup key: `lowercase(verb):lowercase(name)`.
pub fn route_key(verb: Verb, name: &str) -> String {
    format!("{}:{}", verb.as_str(), name.to_lowercase())
}

/// Verbs the server retries, using the full method name, after an
/// unmatched request with `verb`.
pub fn fallback_verbs(verb: Verb) -> &'static [Verb] {
    match verb {
        Verb::Post => &[Verb::Get, Verb::Delete],
        _ => &[],
    }
}

/// How a call is laid out on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireCall {
    /// HTTP verb actually sent.
    pub verb: Verb,
    /// Path segment naming the operation (noun, or full name when forced).
    pub segment: String,
    /// Whether arguments travel as trailing path segments.
    pub args_in_path: bool,
    /// Whether a bodiless verb was rewritten to POST.
    pub forced_post: bool,
}

/// Derive the wire layout of a call to `method`.
///
/// GET/DELETE calls with arguments become POSTs carrying the full method
/// name when `force_post` is set; otherwise their arguments go in the path.
pub fn plan_call(method: &str, has_args: bool, force_post: bool) -> WireCall {
    let (verb, noun) = split_method_name(method);
    if verb.carries_body() {
        return WireCall {
            verb,
            segment: noun.to_owned(),
            args_in_path: false,
            forced_post: false,
        };
    }
    if has_args && force_post {
        WireCall {
            verb: Verb::Post,
            segment: method.to_owned(),
            args_in_path: false,
            forced_post: true,
        }
    } else {
        WireCall {
            verb,
            segment: noun.to_owned(),
            args_in_path: has_args,
            forced_post: false,
        }
    }
}
