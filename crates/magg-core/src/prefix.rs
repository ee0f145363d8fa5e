//! Prefix derivation and capability namespacing
//!
//! Every backend's capabilities are exposed under `<prefix><sep><name>`.
//! Prefixes must be identifier-like and must not contain the separator,
//! so prefixed names can be split unambiguously on the first separator.

use crate::error::{Error, Result};

/// Default separator between a prefix and a capability name.
pub const PREFIX_SEP: &str = "_";

/// Maximum length of a derived prefix.
const MAX_PREFIX_LEN: usize = 30;

/// Stem prepended when a derived prefix would start with a digit.
const DIGIT_STEM: &str = "srv";

/// Fallback prefix when nothing usable survives derivation.
const FALLBACK_PREFIX: &str = "server";

/// Check that a string is usable as a prefix: ASCII alphanumeric, not
/// starting with a digit, and free of the separator.
pub fn is_valid_prefix(prefix: &str, sep: &str) -> bool {
    if prefix.is_empty() || prefix.contains(sep) {
        return false;
    }
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    prefix.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Validate a user-supplied prefix, returning a `Validation` error on failure.
pub fn validate_prefix(prefix: &str, sep: &str) -> Result<()> {
    if is_valid_prefix(prefix, sep) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "prefix {:?} must be alphanumeric, start with a letter, and not contain {:?}",
            prefix, sep
        )))
    }
}

/// Derive a valid prefix from a server name.
///
/// Strips everything non-alphanumeric, lowercases, caps the length, and
/// prepends a stable alphabetic stem when the result starts with a digit.
pub fn prefix_from_name(name: &str) -> String {
    let mut prefix: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    if prefix.chars().next().map_or(false, |c| c.is_ascii_digit()) {
        prefix = format!("{}{}", DIGIT_STEM, prefix);
    }

    if prefix.is_empty() {
        prefix = FALLBACK_PREFIX.to_string();
    }

    prefix.truncate(MAX_PREFIX_LEN);
    prefix
}

/// Join a prefix and a capability name: `calc` + `add` -> `calc_add`.
pub fn prefixed_name(prefix: &str, name: &str, sep: &str) -> String {
    format!("{}{}{}", prefix, sep, name)
}

/// Split a prefixed capability name on the first separator.
///
/// Returns `(prefix, rest)`, or `None` when the name carries no separator.
pub fn split_prefixed_name<'a>(name: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    name.split_once(sep)
}

/// Namespace a resource URI under a prefix: `data://x/y` with prefix `calc`
/// becomes `data://calc/x/y`. URIs without a `://` are prefixed path-style.
pub fn prefixed_resource_uri(prefix: &str, uri: &str) -> String {
    match uri.split_once("://") {
        Some((scheme, rest)) => format!("{}://{}/{}", scheme, prefix, rest),
        None => format!("{}/{}", prefix, uri),
    }
}

/// Strip a prefix from a namespaced resource URI.
///
/// Returns the original backend URI when the URI's first path segment
/// matches `prefix`, otherwise `None`.
pub fn strip_resource_prefix(prefix: &str, uri: &str) -> Option<String> {
    match uri.split_once("://") {
        Some((scheme, rest)) => {
            let (first, remainder) = rest.split_once('/')?;
            if first == prefix {
                Some(format!("{}://{}", scheme, remainder))
            } else {
                None
            }
        }
        None => {
            let (first, remainder) = uri.split_once('/')?;
            (first == prefix).then(|| remainder.to_string())
        }
    }
}
