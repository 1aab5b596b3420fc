use std::collections::HashSet;

/// Credentials presented with a write request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
        }
    }
}

/// Pass/fail check in front of mutating operations
pub trait AuthGate: Send + Sync {
    fn check(&self, credentials: &Credentials) -> bool;
}

/// Lets every request through. Used when no keys are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl AuthGate for OpenGate {
    fn check(&self, _credentials: &Credentials) -> bool {
        true
    }
}

/// Accepts requests carrying one of a fixed set of API keys
#[derive(Debug, Clone)]
pub struct ApiKeyGate {
    keys: HashSet<String>,
}

impl ApiKeyGate {
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .map(|key: String| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl AuthGate for ApiKeyGate {
    fn check(&self, credentials: &Credentials) -> bool {
        credentials
            .api_key
            .as_deref()
            .is_some_and(|key| self.keys.contains(key.trim()))
    }
}
