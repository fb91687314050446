//! Declarative infrastructure source.
//!
//! When the autoscaler was already disabled before the session started, the
//! live max size may have been overridden by hand. The value declared in the
//! infrastructure code is used instead.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::KrollError;

/// Key holding the worker group max size.
pub const ASG_MAX_SIZE_KEY: &str = "asg_max_size";

/// Read-only key lookup in the infrastructure definition.
#[async_trait]
pub trait InfraSource: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<String>;
}

/// An HCL file on disk or behind an HTTP(S) URL.
pub struct HclSource {
    location: String,
    token: Option<SecretString>,
}

impl HclSource {
    pub fn new(location: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            location: location.into(),
            token,
        }
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("https://") || self.location.starts_with("http://")
    }

    async fn fetch(&self) -> Result<String> {
        if !self.is_remote() {
            debug!("Reading infra source file {}", self.location);
            return tokio::fs::read_to_string(&self.location)
                .await
                .with_context(|| format!("Failed to read {}", self.location));
        }

        debug!("Fetching infra source {}", self.location);
        let mut request = reqwest::Client::new().get(&self.location);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| KrollError::InfraSource(format!("{}: {}", self.location, e)))?;

        if !response.status().is_success() {
            return Err(KrollError::InfraSource(format!(
                "{} returned HTTP {}",
                self.location,
                response.status()
            ))
            .into());
        }

        let body = response
            .text()
            .await
            .map_err(|e| KrollError::InfraSource(format!("{}: {}", self.location, e)))?;
        Ok(body)
    }
}

#[async_trait]
impl InfraSource for HclSource {
    async fn lookup(&self, key: &str) -> Result<String> {
        let text = self.fetch().await?;
        extract_hcl_value(&text, key).ok_or_else(|| {
            KrollError::InfraKeyNotFound {
                key: key.to_string(),
                source_name: self.location.clone(),
            }
            .into()
        })
    }
}

/// Quoted value on the first line that assigns `key`, e.g. `asg_max_size = "6"`.
pub fn extract_hcl_value(text: &str, key: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with("//"))
        .find(|line| {
            line.strip_prefix(key)
                .is_some_and(|rest| rest.trim_start().starts_with('='))
        })
        .and_then(|line| {
            let start = line.find('"')?;
            let end = line.rfind('"')?;
            (end > start).then(|| line[start + 1..end].to_string())
        })
}

/// Parse the declared max size.
pub async fn declared_max_size(source: &dyn InfraSource) -> Result<i32> {
    let raw = source.lookup(ASG_MAX_SIZE_KEY).await?;
    raw.trim().parse::<i32>().map_err(|_| {
        KrollError::InfraSource(format!("{} is not a number: '{}'", ASG_MAX_SIZE_KEY, raw)).into()
    })
}
