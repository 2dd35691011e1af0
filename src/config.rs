//! Service configuration
//!
//! Loaded once from the environment at startup and shared read-only afterwards.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which isolation backend executes submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One Docker container per request
    Container,
    /// Plain child process group, OS limits only
    Subprocess,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "container" | "docker" => Ok(BackendKind::Container),
            "subprocess" | "process" => Ok(BackendKind::Subprocess),
            other => anyhow::bail!("Unknown sandbox backend: {}", other),
        }
    }
}

/// How stderr output of an otherwise successful run is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrPolicy {
    /// Any stderr output marks the run as a runtime error
    Failure,
    /// Only the exit status decides
    Ignore,
}

impl FromStr for StderrPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "failure" | "fail" => Ok(StderrPolicy::Failure),
            "ignore" | "exit-code" => Ok(StderrPolicy::Ignore),
            other => anyhow::bail!("Unknown stderr policy: {}", other),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub backend: BackendKind,
    /// Runtime image for the container backend
    pub image: String,
    /// Memory ceiling per container in MB (container backend only)
    pub memory_mb: u64,
    /// Relative CPU weight per container (container backend only)
    pub cpu_shares: i64,
    /// Maximum number of processes per container (container backend only)
    pub pids_limit: i64,
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub compile_timeout: Duration,
    pub max_source_bytes: usize,
    /// Cap on captured stdout + stderr per step
    pub max_output_bytes: usize,
    pub max_body_bytes: usize,
    /// Parent directory of per-request workspaces
    pub workspace_root: PathBuf,
    /// Language table override (embedded table when unset)
    pub languages_path: Option<PathBuf>,
    pub stderr_policy: StderrPolicy,
    pub cors_origins: Vec<String>,
    /// PATH for subprocess steps; the backend's default when unset
    pub subprocess_path: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            backend: BackendKind::Container,
            image: "java-sandbox:latest".to_string(),
            memory_mb: 256,
            cpu_shares: 256,
            pids_limit: 64,
            max_concurrent: 2,
            default_timeout: Duration::from_millis(20_000),
            max_timeout: Duration::from_millis(30_000),
            compile_timeout: Duration::from_millis(10_000),
            max_source_bytes: 50_000,
            max_output_bytes: 64 * 1024,
            max_body_bytes: 100 * 1024,
            workspace_root: std::env::temp_dir(),
            languages_path: None,
            stderr_policy: StderrPolicy::Failure,
            cors_origins: vec!["http://localhost:3000".to_string()],
            subprocess_path: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            port: env_or("PORT", defaults.port)?,
            backend: env_or("SANDBOX_BACKEND", defaults.backend)?,
            image: std::env::var("SANDBOX_IMAGE").unwrap_or(defaults.image),
            memory_mb: env_or("SANDBOX_MEMORY_MB", defaults.memory_mb)?,
            cpu_shares: env_or("SANDBOX_CPU_SHARES", defaults.cpu_shares)?,
            pids_limit: env_or("SANDBOX_PIDS_LIMIT", defaults.pids_limit)?,
            max_concurrent: env_or("MAX_CONCURRENT_EXECUTIONS", defaults.max_concurrent)?,
            default_timeout: env_millis("DEFAULT_TIMEOUT_MS", defaults.default_timeout)?,
            max_timeout: env_millis("MAX_TIMEOUT_MS", defaults.max_timeout)?,
            compile_timeout: env_millis("COMPILE_TIMEOUT_MS", defaults.compile_timeout)?,
            max_source_bytes: env_or("MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            max_output_bytes: env_or("MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            max_body_bytes: env_or("MAX_BODY_BYTES", defaults.max_body_bytes)?,
            workspace_root: std::env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            languages_path: std::env::var("LANGUAGES_CONFIG").ok().map(PathBuf::from),
            stderr_policy: env_or("STDERR_POLICY", defaults.stderr_policy)?,
            cors_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.cors_origins),
            subprocess_path: std::env::var("SANDBOX_PATH").ok().filter(|p| !p.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Settings the selected backend accepts but cannot enforce
    pub fn unenforced_limits(&self) -> &'static [&'static str] {
        match self.backend {
            BackendKind::Container => &[],
            BackendKind::Subprocess => &["SANDBOX_MEMORY_MB", "SANDBOX_CPU_SHARES", "SANDBOX_PIDS_LIMIT"],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("MAX_CONCURRENT_EXECUTIONS must be at least 1");
        }
        if self.max_timeout.is_zero() || self.compile_timeout.is_zero() {
            anyhow::bail!("Timeouts must be positive");
        }
        if self.default_timeout > self.max_timeout {
            anyhow::bail!(
                "DEFAULT_TIMEOUT_MS ({}) exceeds MAX_TIMEOUT_MS ({})",
                self.default_timeout.as_millis(),
                self.max_timeout.as_millis()
            );
        }
        if self.memory_mb == 0 {
            anyhow::bail!("SANDBOX_MEMORY_MB must be positive");
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    let ms = env_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Container);
        assert_eq!(
            " Subprocess ".parse::<BackendKind>().unwrap(),
            BackendKind::Subprocess
        );
        assert!("vm".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_stderr_policy_parse() {
        assert_eq!("failure".parse::<StderrPolicy>().unwrap(), StderrPolicy::Failure);
        assert_eq!("ignore".parse::<StderrPolicy>().unwrap(), StderrPolicy::Ignore);
        assert!("sometimes".parse::<StderrPolicy>().is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list("http://a.test, https://b.test,,"),
            vec!["http://a.test".to_string(), "https://b.test".to_string()]
        );
    }

    #[test]
    fn test_default_is_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.max_source_bytes, 50_000);
    }

    #[test]
    fn test_subprocess_backend_reports_unenforced_limits() {
        let container = ServiceConfig::default();
        assert!(container.unenforced_limits().is_empty());

        let subprocess = ServiceConfig {
            backend: BackendKind::Subprocess,
            ..ServiceConfig::default()
        };
        assert!(subprocess.unenforced_limits().contains(&"SANDBOX_MEMORY_MB"));
        assert!(subprocess.unenforced_limits().contains(&"SANDBOX_PIDS_LIMIT"));
    }

    #[test]
    fn test_default_timeout_above_max_is_rejected() {
        let config = ServiceConfig {
            default_timeout: Duration::from_secs(60),
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
