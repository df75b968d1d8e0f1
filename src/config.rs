//! Operator configuration, read from a YAML file at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    pub controllers: ControllersConfig,
    pub webhooks: WebhooksConfig,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllersConfig {
    pub shoot: ShootControllerConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ShootControllerConfig {
    /// Upper bound of reconciles running at the same time
    pub max_concurrent_reconciles: usize,
    /// Upper bound of reconciles running at the same time within one namespace
    pub max_concurrent_reconciles_per_namespace: usize,
    /// Delay before a shoot that was blocked by its namespace's quota is retried
    #[serde(with = "humantime_serde")]
    pub quota_exceeded_retry_delay: Duration,
    /// Lower bound of the requeue delay after a denied admission
    #[serde(with = "humantime_serde")]
    pub admission_requeue_min: Duration,
    /// Upper bound of the requeue delay after a denied admission
    #[serde(with = "humantime_serde")]
    pub admission_requeue_max: Duration,
}

impl Default for ShootControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 50,
            max_concurrent_reconciles_per_namespace: 3,
            quota_exceeded_retry_delay: Duration::from_secs(10 * 60),
            admission_requeue_min: Duration::from_millis(100),
            admission_requeue_max: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhooksConfig {
    pub config_map_validation: ConfigMapValidationConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigMapValidationConfig {
    /// Largest accepted kubeconfig ConfigMap in bytes
    pub max_object_size: usize,
}

impl Default for ConfigMapValidationConfig {
    fn default() -> Self {
        Self {
            max_object_size: 100 * 1024,
        }
    }
}

impl OperatorConfig {
    /// Loads the configuration from `path`, falling back to the defaults without a file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        // an empty document decodes to null, which means all defaults
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let shoot = &self.controllers.shoot;

        if shoot.max_concurrent_reconciles < 1 {
            return Err(ConfigError::Invalid {
                field: "controllers.shoot.maxConcurrentReconciles",
                message: "must be 1 or greater".into(),
            });
        }
        if shoot.max_concurrent_reconciles_per_namespace < 1 {
            return Err(ConfigError::Invalid {
                field: "controllers.shoot.maxConcurrentReconcilesPerNamespace",
                message: "must be 1 or greater".into(),
            });
        }
        if shoot.max_concurrent_reconciles_per_namespace > shoot.max_concurrent_reconciles {
            return Err(ConfigError::Invalid {
                field: "controllers.shoot.maxConcurrentReconcilesPerNamespace",
                message: "must not be greater than maxConcurrentReconciles".into(),
            });
        }
        if shoot.admission_requeue_min > shoot.admission_requeue_max {
            return Err(ConfigError::Invalid {
                field: "controllers.shoot.admissionRequeueMin",
                message: "must not be greater than admissionRequeueMax".into(),
            });
        }
        if self.webhooks.config_map_validation.max_object_size < 1 {
            return Err(ConfigError::Invalid {
                field: "webhooks.configMapValidation.maxObjectSize",
                message: "must be 1 or greater".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = OperatorConfig::from_yaml("").unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.controllers.shoot.max_concurrent_reconciles, 50);
        assert_eq!(config.controllers.shoot.max_concurrent_reconciles_per_namespace, 3);
        assert_eq!(
            config.webhooks.config_map_validation.max_object_size,
            102_400
        );
    }

    #[test]
    fn full_document() {
        let config = OperatorConfig::from_yaml(
            r#"
controllers:
  shoot:
    maxConcurrentReconciles: 10
    maxConcurrentReconcilesPerNamespace: 2
    quotaExceededRetryDelay: 1h30m
    admissionRequeueMin: 50ms
    admissionRequeueMax: 2s
webhooks:
  configMapValidation:
    maxObjectSize: 2048
"#,
        )
        .unwrap();
        config.validate().unwrap();

        let shoot = &config.controllers.shoot;
        assert_eq!(shoot.max_concurrent_reconciles, 10);
        assert_eq!(shoot.max_concurrent_reconciles_per_namespace, 2);
        assert_eq!(shoot.quota_exceeded_retry_delay, Duration::from_secs(5400));
        assert_eq!(shoot.admission_requeue_min, Duration::from_millis(50));
        assert_eq!(shoot.admission_requeue_max, Duration::from_secs(2));
        assert_eq!(config.webhooks.config_map_validation.max_object_size, 2048);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = OperatorConfig::from_yaml(
            "controllers:\n  shoot:\n    maxConcurrentReconcilesPerNamespace: 5\n",
        )
        .unwrap();
        assert_eq!(config.controllers.shoot.max_concurrent_reconciles, 50);
        assert_eq!(
            config.controllers.shoot.max_concurrent_reconciles_per_namespace,
            5
        );
        assert_eq!(
            config.controllers.shoot.quota_exceeded_retry_delay,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn unknown_kind_fields_are_ignored() {
        let config = OperatorConfig::from_yaml(
            "apiVersion: v1alpha1\nkind: ControllerManagerConfiguration\n",
        )
        .unwrap();
        assert_eq!(config, OperatorConfig::default());
    }

    #[test]
    fn validation_rejects_bad_ceilings() {
        let mut config = OperatorConfig::default();
        config.controllers.shoot.max_concurrent_reconciles = 0;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.controllers.shoot.max_concurrent_reconciles_per_namespace = 0;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.controllers.shoot.max_concurrent_reconciles = 2;
        config.controllers.shoot.max_concurrent_reconciles_per_namespace = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not be greater than"));
    }

    #[test]
    fn validation_rejects_inverted_jitter_window() {
        let mut config = OperatorConfig::default();
        config.controllers.shoot.admission_requeue_min = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_object_size() {
        let mut config = OperatorConfig::default();
        config.webhooks.config_map_validation.max_object_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = OperatorConfig::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn durations() {
        let shoot = |raw: &str| {
            OperatorConfig::from_yaml(&format!(
                "controllers:\n  shoot:\n    quotaExceededRetryDelay: {raw}\n"
            ))
            .map(|c| c.controllers.shoot.quota_exceeded_retry_delay)
        };

        assert_eq!(shoot("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(shoot("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(shoot("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(shoot("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(shoot("1m30s").unwrap(), Duration::from_secs(90));

        for invalid in ["10x", "-1s", "soon"] {
            let err = shoot(invalid).unwrap_err();
            assert!(matches!(err, ConfigError::Parse(_)), "{invalid}");
        }
    }
}
