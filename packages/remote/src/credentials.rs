//! API credentials from the environment.

use crate::RemoteError;

pub const TENANT_ID_VAR: &str = "DVLA_TENANT_ID";
pub const CLIENT_ID_VAR: &str = "DVLA_CLIENT_ID";
pub const CLIENT_SECRET_VAR: &str = "DVLA_CLIENT_SECRET";
pub const API_KEY_VAR: &str = "DVLA_API_KEY";

/// Credentials for the token endpoint and the API gateway.
#[derive(Clone)]
pub struct Credentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Reads all four `DVLA_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::MissingConfig`] naming the first variable
    /// that is unset or blank.
    pub fn from_env() -> Result<Self, RemoteError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads credentials through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::MissingConfig`] naming the first variable
    /// that is unset or blank.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RemoteError> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RemoteError::MissingConfig {
                    name: name.to_string(),
                })
        };

        Ok(Self {
            tenant_id: get(TENANT_ID_VAR)?,
            client_id: get(CLIENT_ID_VAR)?,
            client_secret: get(CLIENT_SECRET_VAR)?,
            api_key: get(API_KEY_VAR)?,
        })
    }
}
