//! Key-encoding rules for the index caches that key on something other than
//! a bare id: accts, emoji names, and federated-instance hosts (§4.5.2).

use crate::error::{QkvcError, Result};

/// Lowercases a host and strips a trailing dot, the closest this stack gets
/// to "punycoded registered-domain form" without pulling in a full IDNA
/// crate the rest of the dependency tree has no other use for — every host
/// this substrate keys on arrives already ASCII from the layer above it.
#[must_use]
pub fn punyhost(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Encodes an acct key: `"username"` if `host` is `None`, else
/// `"username@host"` with the host punycoded. The caller is responsible for
/// null-normalizing a host equal to the local server's configured host
/// *before* calling this (§4.5.2).
#[must_use]
pub fn encode_acct_key(username: &str, host: Option<&str>) -> String {
    let username = username.to_ascii_lowercase();
    match host {
        Some(host) => format!("{username}@{}", punyhost(host)),
        None => username,
    }
}

/// Normalizes a host against the locally configured host: an exact match
/// (case-insensitive, after punycoding) becomes `None` so local accts always
/// key without a host suffix.
#[must_use]
pub fn normalize_acct_host(host: Option<&str>, local_host: Option<&str>) -> Option<String> {
    let host = host.map(|h| punyhost(h))?;
    match local_host {
        Some(local) if host == punyhost(local) => None,
        _ => Some(host),
    }
}

/// Encodes an emoji key: `"name"` if `host` is `None`, else `"name host"`
/// (single ASCII space). Validates the name/host grammar from §4.5.2.
pub fn encode_emoji_key(name: &str, host: Option<&str>) -> Result<String> {
    if name.is_empty() || name.contains(' ') {
        return Err(QkvcError::invalid_emoji_name(name));
    }
    match host {
        None => Ok(name.to_string()),
        Some(host) => {
            if host.is_empty() || host.contains(' ') {
                return Err(QkvcError::invalid_emoji_host(host));
            }
            Ok(format!("{name} {host}"))
        }
    }
}

/// Splits an emoji key back into `(name, host)` on the first space.
pub fn decode_emoji_key(key: &str) -> Result<(String, Option<String>)> {
    match key.split_once(' ') {
        Some((name, host)) if !name.is_empty() && !host.is_empty() => {
            Ok((name.to_string(), Some(host.to_string())))
        }
        Some(_) => Err(QkvcError::invalid_emoji_key(key)),
        None if !key.is_empty() => Ok((key.to_string(), None)),
        None => Err(QkvcError::invalid_emoji_key(key)),
    }
}
