//! Execution request validation
//!
//! Turns the raw JSON body into an immutable `ExecutionRequest`. Nothing is
//! provisioned here.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::ServiceConfig;
use crate::languages::{LanguageConfig, LanguageRegistry};

const DEFAULT_LANGUAGE: &str = "java";

/// Body of `POST /execute`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub source: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("No code provided")]
    MissingSource,
    #[error("Source code too large (max {max} bytes)")]
    SourceTooLarge { max: usize },
    #[error("timeoutMs must be positive")]
    ZeroTimeout,
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Invalid request body: {0}")]
    Malformed(String),
}

/// A validated submission
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub source: String,
    pub stdin: Option<String>,
    /// Run-step time limit, already clamped to the service maximum
    pub timeout: Duration,
    pub language: LanguageConfig,
}

impl ExecutionRequest {
    pub fn validate(
        body: ExecuteBody,
        config: &ServiceConfig,
        languages: &LanguageRegistry,
    ) -> Result<Self, ValidationError> {
        let source = match body.source {
            Some(source) if !source.trim().is_empty() => source,
            _ => return Err(ValidationError::MissingSource),
        };
        if source.len() > config.max_source_bytes {
            return Err(ValidationError::SourceTooLarge {
                max: config.max_source_bytes,
            });
        }

        let timeout = match body.timeout_ms {
            Some(0) => return Err(ValidationError::ZeroTimeout),
            Some(ms) => Duration::from_millis(ms).min(config.max_timeout),
            None => config.default_timeout,
        };

        let language_name = body.language.as_deref().unwrap_or(DEFAULT_LANGUAGE);
        let language = languages
            .get(language_name)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language_name.to_string()))?;

        Ok(Self {
            source,
            stdin: body.stdin,
            timeout,
            language,
        })
    }
}
