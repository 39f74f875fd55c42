//! Configuration
//!
//! Layered lookup: `codewright.yaml` in the workspace root wins, then the
//! user config directory, then built-in defaults. The file only ever
//! narrows behavior; all keys are optional except where a provider demands
//! one (`openai-compatible` needs both an explicit endpoint and an explicit
//! model).

use std::path::Path;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::provider::{default_model, known_provider};

pub const CONFIG_FILE: &str = "codewright.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// `openai`, `anthropic`, or `openai-compatible`.
    pub provider: Option<String>,

    /// Model id; defaults per provider.
    pub model: Option<String>,

    /// Endpoint for `openai-compatible`.
    #[serde(
        alias = "openai_compatible_endpoint",
        alias = "openai-compatible-endpoint"
    )]
    pub openai_compatible_endpoint: Option<String>,
}

impl Config {
    /// Load the nearest config file; absence is fine, a file that fails to
    /// parse is a fatal validation error.
    pub fn load(workspace: &Path) -> Result<Self> {
        let local = workspace.join(CONFIG_FILE);
        if local.exists() {
            return Self::parse_file(&local);
        }

        if let Some(dirs) = ProjectDirs::from("dev", "codewright", "codewright") {
            let global = dirs.config_dir().join("config.yaml");
            if global.exists() {
                return Self::parse_file(&global);
            }
        }

        Ok(Self::default())
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))
    }
}

/// The fully resolved provider choice for one session.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub provider: String,
    pub model: String,
    pub endpoint: Option<String>,
}

/// Resolution order for the model: explicit request, then config file,
/// then the provider default.
pub fn resolve_provider(
    config: &Config,
    provider_override: Option<&str>,
    model_override: Option<&str>,
) -> Result<ResolvedProvider> {
    let provider = provider_override
        .map(str::to_string)
        .or_else(|| config.provider.clone())
        .unwrap_or_else(|| "openai".to_string());

    if !known_provider(&provider) {
        anyhow::bail!("unknown provider: {provider}");
    }

    let model = model_override
        .map(str::to_string)
        .or_else(|| config.model.clone())
        .or_else(|| default_model(&provider).map(str::to_string));

    let endpoint = config.openai_compatible_endpoint.clone();

    if provider == "openai-compatible" {
        if endpoint.is_none() {
            anyhow::bail!("openai-compatible provider requires openaiCompatibleEndpoint");
        }
        if model_override.is_none() && config.model.is_none() {
            anyhow::bail!("openai-compatible provider requires an explicit model");
        }
    }

    let model = model.ok_or_else(|| anyhow::anyhow!("no model configured for {provider}"))?;

    Ok(ResolvedProvider {
        provider,
        model,
        endpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_to_openai_with_its_default_model() {
        let resolved = resolve_provider(&Config::default(), None, None).unwrap();
        assert_eq!(resolved.provider, "openai");
        assert_eq!(resolved.model, "gpt-4o");
    }

    #[test]
    fn request_overrides_beat_the_config_file() {
        let config = Config {
            provider: Some("openai".to_string()),
            model: Some("gpt-4o-mini".to_string()),
            ..Default::default()
        };
        let resolved = resolve_provider(&config, Some("anthropic"), Some("claude-x")).unwrap();
        assert_eq!(resolved.provider, "anthropic");
        assert_eq!(resolved.model, "claude-x");
    }

    #[test]
    fn unknown_provider_is_fatal() {
        assert!(resolve_provider(&Config::default(), Some("mystery"), None).is_err());
    }

    #[test]
    fn compatible_requires_endpoint_and_model() {
        let bare = Config {
            provider: Some("openai-compatible".to_string()),
            ..Default::default()
        };
        assert!(resolve_provider(&bare, None, None).is_err());

        let with_endpoint = Config {
            provider: Some("openai-compatible".to_string()),
            openai_compatible_endpoint: Some("http://localhost:8000/v1".to_string()),
            ..Default::default()
        };
        assert!(resolve_provider(&with_endpoint, None, None).is_err());

        let complete = Config {
            model: Some("local-model".to_string()),
            ..with_endpoint
        };
        let resolved = resolve_provider(&complete, None, None).unwrap();
        assert_eq!(resolved.endpoint.as_deref(), Some("http://localhost:8000/v1"));
        assert_eq!(resolved.model, "local-model");
    }

    #[test]
    fn yaml_keys_accept_all_alias_spellings() {
        for key in [
            "openaiCompatibleEndpoint",
            "openai_compatible_endpoint",
            "openai-compatible-endpoint",
        ] {
            let yaml = format!("provider: openai-compatible\nmodel: m\n{key}: http://x/v1\n");
            let config: Config = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(
                config.openai_compatible_endpoint.as_deref(),
                Some("http://x/v1"),
                "alias {key} did not parse"
            );
        }
    }

    #[test]
    fn workspace_config_file_is_loaded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "provider: anthropic\nmodel: claude-sonnet-4-20250514\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn invalid_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "provider: [broken\n").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
