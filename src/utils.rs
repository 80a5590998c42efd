// ABOUTME: Shared helpers for validation, retries and log-safe formatting
// ABOUTME: Identifier checks, exponential backoff, password stripping, path expansion

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Retry an async operation with exponential backoff
///
/// Runs `operation` up to `max_retries + 1` times, sleeping `initial_delay`
/// before the first retry and doubling it after each failure.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use tosh_sync::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok("connected") },
///     3,
///     Duration::from_secs(1)
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}): {:#}; retrying in {:?}",
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Validate a name used as a PostgreSQL identifier or source name
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*` up to 63 characters, the PostgreSQL
/// identifier limit.
///
/// ```
/// # use tosh_sync::utils::validate_identifier;
/// assert!(validate_identifier("messages").is_ok());
/// assert!(validate_identifier("_calls_2").is_ok());
/// assert!(validate_identifier("2fast").is_err());
/// assert!(validate_identifier("bad-name").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        bail!("Identifier cannot be empty");
    }
    if identifier.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(identifier),
            identifier.len()
        );
    }

    for (i, c) in identifier.chars().enumerate() {
        let allowed = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if !allowed {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed, and it must not start with a digit",
                sanitize_identifier(identifier),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Strip control characters and cap length so a name is safe to print.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier (schema, table, column)
///
/// Assumes the identifier has already been validated. Escapes embedded quotes
/// and wraps the identifier in double quotes.
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

/// Replace the password in a connection URL with `***` for logging.
///
/// Strings that do not parse as URLs (e.g. `host=... user=...` key/value
/// strings) are reduced to their non-password pairs.
pub fn sanitize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => url
            .split_whitespace()
            .filter(|pair| !pair.to_ascii_lowercase().starts_with("password="))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Correlation id attached to one delivery cycle, e.g. `sync_1a2b3c4d5e6f`.
pub fn correlation_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sync_{}", &id[..12])
}
