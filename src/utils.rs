// ABOUTME: Utility functions for identifier handling and retries
// ABOUTME: Provides SQL quoting, identifier validation, backoff and URL sanitizing

use std::fmt::Display;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Validate a PostgreSQL identifier (table, column, view name)
///
/// Identifiers end up interpolated into generated DDL, so configuration is
/// rejected early unless each name is a plain unquoted identifier:
/// - 1 to 63 characters
/// - starts with a letter or underscore
/// - letters, digits and underscores only
///
/// # Examples
///
/// ```
/// # use table_sync::utils::validate_postgres_identifier;
/// assert!(validate_postgres_identifier("users").is_ok());
/// assert!(validate_postgres_identifier("_private").is_ok());
/// assert!(validate_postgres_identifier("123abc").is_err());
/// assert!(validate_postgres_identifier("users\"; DROP TABLE x; --").is_err());
/// ```
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config(
            "Identifier cannot be empty or whitespace-only".to_string(),
        ));
    }

    if trimmed.len() > 63 {
        return Err(SyncError::Config(format!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        )));
    }

    let mut chars = trimmed.chars();
    if let Some(first_char) = chars.next() {
        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            return Err(SyncError::Config(format!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first_char
            )));
        }
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

/// Sanitize an identifier for display
///
/// Removes control characters and limits length so names taken from
/// configuration cannot inject lines into logs.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier (table, column, view)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote and join a list of identifiers with `", "`.
pub fn quote_ident_list<S: AsRef<str>>(identifiers: &[S]) -> String {
    identifiers
        .iter()
        .map(|i| quote_ident(i.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quote a SQL string literal
///
/// # Examples
///
/// ```
/// use table_sync::utils::quote_literal;
/// assert_eq!(quote_literal("hello"), "'hello'");
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Retry an async operation with exponential backoff
///
/// Runs `operation` up to `max_retries + 1` times, doubling the delay after
/// each failure. Returns the last error once retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Strip the password from a connection URL for logging
///
/// Non-URL connection strings (key/value form) are returned with any
/// `password=` value masked.
pub fn strip_password_from_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        return parsed.to_string();
    }

    url.split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("password") => format!("{}=***", key),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
