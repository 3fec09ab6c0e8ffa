// External crates
use rand::{Rng, distr::Alphanumeric};
use std::fmt;
use std::sync::Arc;

/// Prefix every canonical session id carries.
pub const SESSION_PREFIX: &str = "session_";

const GENERATED_ID_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id contains unsupported character {0:?}")]
    InvalidCharacter(char),
    #[error("session id is longer than {max} characters")]
    TooLong { max: usize },
}

/// Canonical identity of the stream destination.
///
/// Built once at startup and only read afterwards; clones share the same
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Longest accepted id, prefix included.
    pub const MAX_LEN: usize = 128;

    /// Normalize a user supplied id into its canonical `session_<id>` form.
    ///
    /// Whitespace is trimmed and an existing prefix is kept as is. A missing
    /// or blank id yields a freshly generated one.
    pub fn normalize(raw: Option<&str>) -> Result<Self, SessionIdError> {
        let trimmed = raw.map(str::trim).unwrap_or_default();
        if trimmed.is_empty() {
            return Ok(Self::generate());
        }

        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(SessionIdError::InvalidCharacter(bad));
        }

        let canonical = if trimmed.starts_with(SESSION_PREFIX) {
            trimmed.to_string()
        } else {
            format!("{SESSION_PREFIX}{trimmed}")
        };

        if canonical.len() > Self::MAX_LEN {
            return Err(SessionIdError::TooLong { max: Self::MAX_LEN });
        }

        Ok(Self(canonical.into()))
    }

    /// Random id for runs started without one.
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(GENERATED_ID_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!("{SESSION_PREFIX}{suffix}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
