//! Merged configuration.
//!
//! Two JSON files under `<root>/config/` make up the effective
//! configuration: `config.json` ships the defaults and `config.user.json`
//! overlays the deployment-specific values. Both are read once at startup;
//! the merged result is immutable for the life of the process.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Compiled-in relay endpoint, overridable via `common.relayBaseUrl`.
pub const DEFAULT_RELAY_BASE_URL: &str = "https://relay.bluelock.com";

/// The integrations this worker can be pointed at. Only Bitbucket Cloud has
/// an implementation; the rest reserve their tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKey {
    BitbucketServer,
    BitbucketCloud,
    Github,
    Jenkins,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKey::BitbucketServer => "BitbucketServer",
            ServiceKey::BitbucketCloud => "BitbucketCloud",
            ServiceKey::Github => "Github",
            ServiceKey::Jenkins => "Jenkins",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub active_service: Option<ServiceKey>,
    pub integrations: Integrations,
    pub common: Common,
    pub defaults: Defaults,
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Integrations {
    pub bitbucket_server: HostConfig,
    pub bitbucket_cloud: BitbucketCloudConfig,
    pub github: HostConfig,
    pub jenkins: HostConfig,
}

/// Addressing for URL+port style integrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub url: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BitbucketCloudConfig {
    pub workspace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Common {
    pub cron_expression: String,
    pub rework_threshold_days: i64,
    pub org_code: String,
    pub relay_base_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub request_size_threshold_in_bytes: u64,
    pub default_data_pull_days: i64,
    pub waiting_time_for_rate_limit_in_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Secrets {
    pub dd_api_key: String,
}

impl Config {
    /// Reads a single config file.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Loads `<root>/config/config.json`, validates it, overlays
    /// `<root>/config/config.user.json`, and validates the merged result.
    pub fn load_merged(root_dir: &Path) -> Result<Config> {
        let defaults_path = root_dir.join("config").join("config.json");
        let defaults = Config::load_from_file(&defaults_path)?;
        defaults
            .validate_defaults_and_common()
            .with_context(|| format!("invalid defaults config: {}", defaults_path.display()))?;

        let user_path = root_dir.join("config").join("config.user.json");
        let user = Config::load_from_file(&user_path)?;

        let merged = defaults.merge_user_overlay(user)?;
        merged
            .validate_defaults_and_common()
            .context("merged configuration failed validation")?;
        Ok(merged)
    }

    /// Applies the user overlay. The user file must name the active service
    /// with its addressing and a non-empty `orgCode`; everything else only
    /// overrides when set.
    fn merge_user_overlay(&self, user: Config) -> Result<Config> {
        let mut merged = self.clone();

        let active = match user.active_service {
            Some(key) => key,
            None => bail!("activeService is required in the user config"),
        };
        merged.active_service = Some(active);

        match active {
            ServiceKey::BitbucketServer => {
                if user.integrations.bitbucket_server.url.is_empty() {
                    bail!("bitbucketServer URL is required");
                }
                merged.integrations.bitbucket_server = user.integrations.bitbucket_server;
            }
            ServiceKey::BitbucketCloud => {
                if user.integrations.bitbucket_cloud.workspace.is_empty() {
                    bail!("bitbucketCloud workspace is required");
                }
                merged.integrations.bitbucket_cloud = user.integrations.bitbucket_cloud;
            }
            ServiceKey::Github => {
                if !user.integrations.github.url.is_empty() {
                    merged.integrations.github = user.integrations.github;
                }
            }
            ServiceKey::Jenkins => {
                if user.integrations.jenkins.url.is_empty() {
                    bail!("jenkins URL is required");
                }
                merged.integrations.jenkins = user.integrations.jenkins;
            }
        }

        if user.common.org_code.is_empty() {
            bail!("orgCode is required in the user config");
        }
        merged.common.org_code = user.common.org_code;

        if !user.common.cron_expression.is_empty() {
            merged.common.cron_expression = user.common.cron_expression;
        }
        if user.common.rework_threshold_days != 0 {
            merged.common.rework_threshold_days = user.common.rework_threshold_days;
        }
        if !user.common.relay_base_url.is_empty() {
            merged.common.relay_base_url = user.common.relay_base_url;
        }
        if merged.common.relay_base_url.is_empty() {
            merged.common.relay_base_url = DEFAULT_RELAY_BASE_URL.to_string();
        }

        if user.defaults.request_size_threshold_in_bytes != 0 {
            merged.defaults.request_size_threshold_in_bytes =
                user.defaults.request_size_threshold_in_bytes;
        }
        if user.defaults.default_data_pull_days != 0 {
            merged.defaults.default_data_pull_days = user.defaults.default_data_pull_days;
        }
        if user.defaults.waiting_time_for_rate_limit_in_seconds != 0 {
            merged.defaults.waiting_time_for_rate_limit_in_seconds =
                user.defaults.waiting_time_for_rate_limit_in_seconds;
        }
        if !user.secrets.dd_api_key.is_empty() {
            merged.secrets.dd_api_key = user.secrets.dd_api_key;
        }

        Ok(merged)
    }

    /// Range checks on the common and defaults sections.
    pub fn validate_defaults_and_common(&self) -> Result<()> {
        if self.active_service.is_none() {
            bail!("activeService is required");
        }
        if self.common.cron_expression.is_empty() {
            bail!("cronExpression is required");
        }
        if self.common.rework_threshold_days <= 0 {
            bail!("reworkThresholdDays must be greater than 0");
        }
        // Downstream queue messages cap out at 256KB; 200KB leaves headroom
        // for the envelope.
        if self.defaults.request_size_threshold_in_bytes == 0
            || self.defaults.request_size_threshold_in_bytes >= 200 * 1024
        {
            bail!("requestSizeThresholdInBytes must be between 0KB and 200KB");
        }
        if self.defaults.default_data_pull_days <= 1 {
            bail!("defaultDataPullDays must be greater than 1");
        }
        if self.defaults.waiting_time_for_rate_limit_in_seconds == 0 {
            bail!("waitingTimeForRateLimitInSeconds must be greater than 0");
        }
        Ok(())
    }

    /// The workspace slug for the Bitbucket Cloud integration.
    pub fn bitbucket_cloud_workspace(&self) -> &str {
        &self.integrations.bitbucket_cloud.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const DEFAULTS_JSON: &str = r#"{
        "activeService": "BitbucketCloud",
        "common": {
            "cronExpression": "0 2 * * *",
            "reworkThresholdDays": 14,
            "orgCode": "default-org"
        },
        "defaults": {
            "requestSizeThresholdInBytes": 102400,
            "defaultDataPullDays": 30,
            "waitingTimeForRateLimitInSeconds": 3600
        }
    }"#;

    const USER_JSON: &str = r#"{
        "activeService": "BitbucketCloud",
        "integrations": {
            "bitbucketCloud": {"workspace": "acme"}
        },
        "common": {
            "orgCode": "acme-org"
        },
        "defaults": {
            "waitingTimeForRateLimitInSeconds": 3
        },
        "secrets": {
            "ddApiKey": "relay-key"
        }
    }"#;

    fn write_configs(defaults: &str, user: &str) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("config.json"), defaults).unwrap();
        fs::write(config_dir.join("config.user.json"), user).unwrap();
        dir
    }

    #[test]
    fn merged_config_overlays_user_values() {
        let dir = write_configs(DEFAULTS_JSON, USER_JSON);
        let config = Config::load_merged(dir.path()).unwrap();

        assert_eq!(config.active_service, Some(ServiceKey::BitbucketCloud));
        assert_eq!(config.bitbucket_cloud_workspace(), "acme");
        assert_eq!(config.common.org_code, "acme-org");
        assert_eq!(config.common.cron_expression, "0 2 * * *");
        assert_eq!(config.defaults.waiting_time_for_rate_limit_in_seconds, 3);
        assert_eq!(config.defaults.default_data_pull_days, 30);
        assert_eq!(config.secrets.dd_api_key, "relay-key");
        assert_eq!(config.common.relay_base_url, DEFAULT_RELAY_BASE_URL);
    }

    #[test]
    fn missing_workspace_for_bitbucket_cloud_is_rejected() {
        let user = r#"{
            "activeService": "BitbucketCloud",
            "common": {"orgCode": "acme-org"}
        }"#;
        let dir = write_configs(DEFAULTS_JSON, user);

        let err = Config::load_merged(dir.path()).unwrap_err();
        assert!(err.to_string().contains("workspace"));
    }

    #[test]
    fn missing_org_code_is_rejected() {
        let user = r#"{
            "activeService": "BitbucketCloud",
            "integrations": {"bitbucketCloud": {"workspace": "acme"}}
        }"#;
        let dir = write_configs(DEFAULTS_JSON, user);

        let err = Config::load_merged(dir.path()).unwrap_err();
        assert!(err.to_string().contains("orgCode"));
    }

    #[test]
    fn unknown_service_key_fails_to_parse() {
        let user = USER_JSON.replace("BitbucketCloud", "Gitea");
        let dir = write_configs(DEFAULTS_JSON, &user);

        assert!(Config::load_merged(dir.path()).is_err());
    }

    #[test]
    fn request_size_threshold_must_stay_under_200kb() {
        let defaults = DEFAULTS_JSON.replace("102400", "204800");
        let dir = write_configs(&defaults, USER_JSON);

        let err = Config::load_merged(dir.path()).unwrap_err();
        assert!(err.to_string().contains("requestSizeThresholdInBytes"));
    }

    #[test]
    fn default_data_pull_days_must_exceed_one() {
        let defaults = DEFAULTS_JSON.replace("\"defaultDataPullDays\": 30", "\"defaultDataPullDays\": 1");
        let dir = write_configs(&defaults, USER_JSON);

        assert!(Config::load_merged(dir.path()).is_err());
    }

    #[test]
    fn service_key_display_matches_wire_names() {
        assert_eq!(ServiceKey::BitbucketCloud.to_string(), "BitbucketCloud");
        assert_eq!(ServiceKey::BitbucketServer.to_string(), "BitbucketServer");
    }
}
