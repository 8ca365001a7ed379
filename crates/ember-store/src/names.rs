//! Cache name validation.
//!
//! Valid cache names:
//! - Must be non-empty and at most 128 bytes
//! - Must start with an ASCII letter or `_`
//! - May contain only ASCII letters, digits, `_` and `-`
//!
//! In particular `.` is forbidden, because it separates the backend identity
//! from the cache name in a qualified name, and `/` is forbidden because
//! file-backed stores use the name as a directory.

use crate::error::{StoreError, StoreResult};

/// Longest accepted cache name, in bytes.
pub const MAX_CACHE_NAME_LEN: usize = 128;

/// Validate a cache name, returning `Ok(())` if valid.
///
/// # Examples
///
/// ```
/// use ember_store::names::validate_cache_name;
///
/// assert!(validate_cache_name("people").is_ok());
/// assert!(validate_cache_name("order_lines-v2").is_ok());
/// assert!(validate_cache_name("").is_err());
/// assert!(validate_cache_name("a.b").is_err());
/// ```
pub fn validate_cache_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: String| StoreError::InvalidCacheName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("cache name must not be empty".into()));
    }

    if name.len() > MAX_CACHE_NAME_LEN {
        return Err(invalid(format!(
            "longer than {MAX_CACHE_NAME_LEN} bytes"
        )));
    }

    let first = name.chars().next().unwrap_or_default();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(invalid("must start with a letter or '_'".into()));
    }

    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(format!("contains forbidden character: {ch:?}")));
    }

    Ok(())
}
