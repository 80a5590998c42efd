// ABOUTME: Pluggable retrieval of the destination password
// ABOUTME: Keychain, environment, file and Vault backends behind one trait

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::SecretConfig;

const KEYCHAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret backend unavailable: {0}")]
    Unavailable(String),
    #[error("secret backend returned an invalid response: {0}")]
    Invalid(String),
}

/// Source of the destination password. Called once at startup; the value is
/// held in memory only.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Human-readable description for logs; never contains the secret.
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<String, SecretError>;
}

/// macOS keychain lookup via `security find-generic-password`.
pub struct KeychainSecret {
    pub service: String,
    pub account: String,
}

#[async_trait]
impl SecretProvider for KeychainSecret {
    fn describe(&self) -> String {
        format!("keychain service '{}' account '{}'", self.service, self.account)
    }

    async fn fetch(&self) -> Result<String, SecretError> {
        let security = which::which("security").map_err(|_| {
            SecretError::Unavailable("'security' command not found (keychain requires macOS)".into())
        })?;

        let output = tokio::time::timeout(
            KEYCHAIN_TIMEOUT,
            tokio::process::Command::new(security)
                .args([
                    "find-generic-password",
                    "-s",
                    self.service.as_str(),
                    "-a",
                    self.account.as_str(),
                    "-w",
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            SecretError::Unavailable(format!(
                "keychain lookup timed out after {}s",
                KEYCHAIN_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| SecretError::Unavailable(format!("failed to run 'security': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SecretError::NotFound(format!(
                "{}: {}",
                self.describe(),
                stderr.trim()
            )));
        }
        non_empty(String::from_utf8_lossy(&output.stdout).as_ref(), || self.describe())
    }
}

pub struct EnvSecret {
    pub var: String,
}

#[async_trait]
impl SecretProvider for EnvSecret {
    fn describe(&self) -> String {
        format!("environment variable {}", self.var)
    }

    async fn fetch(&self) -> Result<String, SecretError> {
        let value = std::env::var(&self.var)
            .map_err(|_| SecretError::NotFound(format!("{} is not set", self.var)))?;
        non_empty(&value, || self.describe())
    }
}

pub struct FileSecret {
    pub path: PathBuf,
}

#[async_trait]
impl SecretProvider for FileSecret {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch(&self) -> Result<String, SecretError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SecretError::NotFound(self.describe())
            } else {
                SecretError::Unavailable(format!("failed to read {}: {e}", self.describe()))
            }
        })?;
        non_empty(&contents, || self.describe())
    }
}

/// HashiCorp Vault KV v2 lookup: `GET {address}/v1/{path}`, value at
/// `data.data.{field}`.
pub struct VaultSecret {
    pub address: String,
    pub path: String,
    pub field: String,
    pub token_env: String,
}

impl VaultSecret {
    fn endpoint(&self) -> String {
        format!(
            "{}/v1/{}",
            self.address.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl SecretProvider for VaultSecret {
    fn describe(&self) -> String {
        format!("vault {} field '{}'", self.endpoint(), self.field)
    }

    async fn fetch(&self) -> Result<String, SecretError> {
        let token = std::env::var(&self.token_env).map_err(|_| {
            SecretError::Unavailable(format!("vault token variable {} is not set", self.token_env))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SecretError::Unavailable(e.to_string()))?;
        let response = client
            .get(self.endpoint())
            .header("X-Vault-Token", token)
            .send()
            .await
            .map_err(|e| SecretError::Unavailable(format!("vault request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(self.describe()));
        }
        if !status.is_success() {
            return Err(SecretError::Unavailable(format!(
                "vault returned HTTP {status}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SecretError::Invalid(format!("vault response is not JSON: {e}")))?;
        extract_vault_field(&body, &self.field)
    }
}

fn extract_vault_field(body: &serde_json::Value, field: &str) -> Result<String, SecretError> {
    match body.pointer(&format!("/data/data/{field}")) {
        Some(serde_json::Value::String(value)) => non_empty(value, || format!("vault field '{field}'")),
        Some(_) => Err(SecretError::Invalid(format!(
            "vault field '{field}' is not a string"
        ))),
        None => Err(SecretError::NotFound(format!("vault field '{field}'"))),
    }
}

fn non_empty(value: &str, describe: impl FnOnce() -> String) -> Result<String, SecretError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SecretError::Invalid(format!("{} is empty", describe())));
    }
    Ok(trimmed.to_string())
}

/// Build the provider selected in configuration. `None` means the URL is
/// used as-is.
pub fn provider_from_config(config: &SecretConfig) -> Option<Box<dyn SecretProvider>> {
    match config {
        SecretConfig::Keychain { service, account } => Some(Box::new(KeychainSecret {
            service: service.clone(),
            account: account.clone(),
        })),
        SecretConfig::Env { var } => Some(Box::new(EnvSecret { var: var.clone() })),
        SecretConfig::File { path } => Some(Box::new(FileSecret { path: path.clone() })),
        SecretConfig::Vault {
            address,
            path,
            field,
            token_env,
        } => Some(Box::new(VaultSecret {
            address: address.clone(),
            path: path.clone(),
            field: field.clone(),
            token_env: token_env.clone(),
        })),
        SecretConfig::None => None,
    }
}
