//! Input validation for tablegate
//!
//! Rejects malformed names, oversized free text, and bad operation lists
//! before any engine reads storage.

use crate::{ControlError, Result};

/// Maximum length for scope, resource, and application names
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length for intros, reasons, and node descriptions
pub const MAX_TEXT_LEN: usize = 1024;

/// Maximum length of one operation name
pub const MAX_OP_LEN: usize = 64;

/// Maximum number of operations on a grant
pub const MAX_OPS: usize = 64;

/// Validate a scope, resource, or application name
///
/// Requirements:
/// - Not empty
/// - <= 64 characters
/// - Alphanumeric, underscore, hyphen, dot only
pub fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ControlError::InvalidParam(format!("{} name cannot be empty", what)));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(ControlError::InvalidParam(format!(
            "{} name too long: {} > {} characters",
            what,
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ControlError::InvalidParam(format!(
            "{} name contains invalid characters (allowed: alphanumeric, _, -, .)",
            what
        )));
    }

    Ok(())
}

/// Validate free text such as an intro or a reason. Empty is allowed.
pub fn validate_text(text: &str, what: &str) -> Result<()> {
    if text.len() > MAX_TEXT_LEN {
        return Err(ControlError::InvalidParam(format!(
            "{} too long: {} > {} characters",
            what,
            text.len(),
            MAX_TEXT_LEN
        )));
    }
    Ok(())
}

/// Normalize a grant's operation list.
///
/// Trims and lowercases each entry and drops duplicates, keeping first-seen
/// order. Fails on an empty list, a blank entry, or an entry that is not a
/// plain identifier.
pub fn normalize_ops(ops: &[String]) -> Result<Vec<String>> {
    if ops.is_empty() {
        return Err(ControlError::InvalidParam(
            "operation list cannot be empty".to_string(),
        ));
    }
    if ops.len() > MAX_OPS {
        return Err(ControlError::InvalidParam(format!(
            "too many operations: {} > {}",
            ops.len(),
            MAX_OPS
        )));
    }

    let mut out: Vec<String> = Vec::with_capacity(ops.len());
    for op in ops {
        let op = op.trim().to_lowercase();
        if op.is_empty() {
            return Err(ControlError::InvalidParam(
                "operation names cannot be blank".to_string(),
            ));
        }
        if op.len() > MAX_OP_LEN || !op.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ControlError::InvalidParam(format!("invalid operation: {}", op)));
        }
        if !out.contains(&op) {
            out.push(op);
        }
    }
    Ok(out)
}

/// Trim a listing keyword. Blank means no filter.
pub fn normalize_keyword(keyword: Option<&str>) -> Result<Option<&str>> {
    let Some(keyword) = keyword.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    if keyword.chars().count() > MAX_NAME_LEN {
        return Err(ControlError::InvalidParam(format!(
            "keyword exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(Some(keyword))
}

/// Deduplicate a user list, keeping first-seen order.
pub fn dedup_users(users: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(users.len());
    for user in users {
        if !out.contains(user) {
            out.push(*user);
        }
    }
    out
}
