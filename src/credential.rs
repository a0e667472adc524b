use std::sync::Arc;

use crate::{RelayError, Result};

/// Default environment variable holding the comma-separated key list.
pub const DEFAULT_KEYS_ENV: &str = "ALL_GEMINI_API_KEYS";

/// An upstream API key. `Debug` never prints the raw value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First 8 and last 4 characters; `***` for keys of 12 characters or fewer.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 12 {
            return "***".to_string();
        }
        let prefix: String = chars[..8].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{prefix}...{suffix}")
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&self.masked()).finish()
    }
}

/// Ordered, immutable set of credentials loaded once at startup.
///
/// Cloning is cheap; every clone shares the same backing slice.
#[derive(Clone)]
pub struct KeyPool {
    keys: Arc<[Credential]>,
}

impl KeyPool {
    /// Parses a comma-separated list. Entries are trimmed and blanks dropped;
    /// duplicates are kept in place.
    pub fn load(raw: &str) -> Result<Self> {
        let keys: Vec<Credential> = raw
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(Credential::new)
            .collect();
        Self::from_credentials(keys)
    }

    pub fn from_credentials(keys: Vec<Credential>) -> Result<Self> {
        if keys.is_empty() {
            return Err(RelayError::Config(
                "no usable API keys found in the key list".to_string(),
            ));
        }
        Ok(Self { keys: keys.into() })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Credential> {
        self.keys.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.keys.iter()
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("len", &self.keys.len())
            .finish()
    }
}
