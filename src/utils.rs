// ABOUTME: Utility functions shared by the sync components
// ABOUTME: Provides the retry policy, identifier validation/quoting, and URL sanitizing

use anyhow::{bail, Result};
use std::future::Future;
use std::time::Duration;

/// Default number of attempts before an operation is reported as failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for linear backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Fixed-attempt linear backoff shared by every component that writes to a store.
///
/// Attempt `k` (1-indexed) that fails waits `base_delay * k` before attempt `k + 1`.
/// After `max_attempts` failures the last error is returned to the caller, which
/// decides whether to skip the work item or abort its pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay slept after the given failed attempt (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// `label` names the operation in log lines (e.g. "upsert public.orders").
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use anyhow::Result;
    /// # use sync_worker::utils::RetryPolicy;
    /// # async fn example() -> Result<()> {
    /// let policy = RetryPolicy::default();
    /// let value = policy.run("ping", || async { Ok::<_, anyhow::Error>(42) }).await?;
    /// assert_eq!(value, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    return Err(e.context(format!(
                        "{} failed after {} attempts",
                        label, max_attempts
                    )));
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {:#}, retrying in {:?}",
                        label,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Validate a PostgreSQL identifier (schema, table, or column name).
///
/// Identifiers coming from configuration are interpolated into SQL, so they must be
/// 1-63 characters, start with a letter or underscore, and contain only letters,
/// digits and underscores.
///
/// # Examples
///
/// ```
/// # use sync_worker::utils::validate_postgres_identifier;
/// assert!(validate_postgres_identifier("orders").is_ok());
/// assert!(validate_postgres_identifier("_private").is_ok());
/// assert!(validate_postgres_identifier("123abc").is_err());
/// assert!(validate_postgres_identifier("x\"; DROP TABLE users; --").is_err());
/// ```
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first_char) = chars.next() {
        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first_char
            );
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
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

/// Strip control characters and cap length so an identifier is safe to log.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier, doubling embedded quotes.
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

/// Quote `schema.table` as a qualified relation name.
pub fn quote_relation(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Remove the password component of a connection URL for logging.
///
/// Values that do not parse as URLs are returned unchanged.
pub fn strip_password_from_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}
