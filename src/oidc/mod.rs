//! Identity-provider client descriptors and their configuration source.

pub mod store;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::HashSet, fmt, path::PathBuf};
use thiserror::Error;
use url::Url;

/// One identity-provider-registered client, uniquely keyed by `client_id`.
#[derive(Clone, Deserialize)]
pub struct ClientDescriptor {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uris: Vec<String>,
}

// Keep the secret out of logs; descriptors end up in debug output of the
// seeding path.
impl fmt::Debug for ClientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDescriptor")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uris", &self.redirect_uris)
            .finish()
    }
}

/// Client registry configuration is malformed or missing required fields.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ConfigError(String);

impl ConfigError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Supplies the static list of client descriptors to seed.
#[async_trait]
pub trait ClientConfigSource: Send + Sync {
    /// Load and validate the descriptor list.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the registry cannot be read or fails
    /// validation.
    async fn load(&self) -> Result<Vec<ClientDescriptor>, ConfigError>;
}

/// Reads the descriptor list from a JSON file given on the command line.
///
/// Expected shape:
///
/// ```json
/// [
///   {
///     "client_id": "console",
///     "client_secret": "…",
///     "redirect_uris": ["https://console.example.com/callback"]
///   }
/// ]
/// ```
pub struct FileClientConfigSource {
    path: PathBuf,
}

impl FileClientConfigSource {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ClientConfigSource for FileClientConfigSource {
    async fn load(&self) -> Result<Vec<ClientDescriptor>, ConfigError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|err| {
            ConfigError::new(format!(
                "failed to read client registry {}: {err}",
                self.path.display()
            ))
        })?;

        let clients: Vec<ClientDescriptor> = serde_json::from_slice(&bytes).map_err(|err| {
            ConfigError::new(format!(
                "invalid client registry {}: {err}",
                self.path.display()
            ))
        })?;

        validate(&clients)?;

        Ok(clients)
    }
}

/// Validate a descriptor list: unique non-empty ids, non-empty secrets, and
/// at least one absolute redirect URL per client.
pub fn validate(clients: &[ClientDescriptor]) -> Result<(), ConfigError> {
    if clients.is_empty() {
        return Err(ConfigError::new(
            "client registry is empty while the identity-provider integration is enabled",
        ));
    }

    let mut seen = HashSet::new();

    for client in clients {
        if client.client_id.is_empty() {
            return Err(ConfigError::new("client with empty client_id"));
        }

        if !seen.insert(client.client_id.as_str()) {
            return Err(ConfigError::new(format!(
                "duplicate client id: {}",
                client.client_id
            )));
        }

        if client.client_secret.expose_secret().is_empty() {
            return Err(ConfigError::new(format!(
                "client {} has an empty secret",
                client.client_id
            )));
        }

        if client.redirect_uris.is_empty() {
            return Err(ConfigError::new(format!(
                "client {} has no redirect URIs",
                client.client_id
            )));
        }

        for uri in &client.redirect_uris {
            Url::parse(uri).map_err(|err| {
                ConfigError::new(format!(
                    "client {} has an invalid redirect URI {uri}: {err}",
                    client.client_id
                ))
            })?;
        }
    }

    Ok(())
}
