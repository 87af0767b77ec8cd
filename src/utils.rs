// ABOUTME: Utility functions for validation and retry handling
// ABOUTME: Provides identifier validation and exponential backoff for transient failures

use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Maximum accepted identifier length (SQL Server's `sysname` limit).
const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate a table identifier.
///
/// Table names end up in file paths and SQL text, so only letters, digits and
/// underscores are accepted, starting with a letter or underscore.
///
/// # Examples
///
/// ```
/// # use cdc_mirror::utils::validate_identifier;
/// assert!(validate_identifier("Customers").is_ok());
/// assert!(validate_identifier("_audit_2024").is_ok());
///
/// assert!(validate_identifier("2024_orders").is_err());
/// assert!(validate_identifier("dbo.Customers").is_err());
/// assert!(validate_identifier("../state").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> SyncResult<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config(
            "Identifier cannot be empty or whitespace-only".to_string(),
        ));
    }

    if trimmed.len() > MAX_IDENTIFIER_LEN {
        return Err(SyncError::Config(format!(
            "Identifier '{}' exceeds maximum length of {} characters (got {})",
            sanitize_identifier(trimmed),
            MAX_IDENTIFIER_LEN,
            trimmed.len()
        )));
    }

    let starts_ok = trimmed
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok {
        return Err(SyncError::Config(format!(
            "Identifier '{}' must start with a letter or underscore",
            sanitize_identifier(trimmed)
        )));
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(SyncError::Config(format!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            )));
        }
    }

    Ok(())
}

/// Strip control characters and cap the length of an identifier for display.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Retry an async operation with exponential backoff.
///
/// Only transient errors (see [`SyncError::is_transient`]) are retried; anything
/// else is returned immediately so callers can react to it (for example a
/// `RangeUnavailable` forcing a full reload).
///
/// # Arguments
///
/// * `operation` - Function that returns a future producing the result
/// * `max_retries` - Maximum number of retries (0 = just the initial attempt)
/// * `initial_delay` - Delay before the first retry, doubled after each attempt
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = next_backoff(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Double a backoff delay, saturating instead of overflowing.
fn next_backoff(delay: Duration) -> Duration {
    delay.saturating_mul(2)
}
