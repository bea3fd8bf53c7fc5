use crate::error::{PipelineError, Result};
use crate::pipeline::PipelineBuilder;
use crate::wait::WaitStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File-driven pipeline settings.
///
/// ```toml
/// capacity = 1024
/// stages = ["parse", "enrich", "sink"]
/// wait_strategy = { kind = "yielding" }
/// ```
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub wait_strategy: WaitStrategy,
    #[serde(default = "defaults::stages")]
    pub stages: Vec<String>,
}

mod defaults {
    pub fn capacity() -> usize {
        1024
    }

    pub fn stages() -> Vec<String> {
        vec!["stage".into()]
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::capacity(),
            wait_strategy: WaitStrategy::default(),
            stages: defaults::stages(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let toml_to_str =
            std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml_str(&toml_to_str)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings before anything is allocated
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_power_of_two() {
            return Err(PipelineError::InvalidCapacity {
                capacity: self.capacity,
            });
        }
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        if let Some(blank) = self.stages.iter().position(|name| name.trim().is_empty()) {
            return Err(PipelineError::ConfigError(format!(
                "stage {blank} has an empty name"
            )));
        }
        if let WaitStrategy::Sleeping { max_micros: 0 } = self.wait_strategy {
            return Err(PipelineError::ConfigError(
                "sleeping wait strategy needs max_micros > 0".into(),
            ));
        }
        Ok(())
    }

    /// A builder with the configured capacity, strategy and stage chain
    pub fn builder<T>(&self) -> Result<PipelineBuilder<T>> {
        self.validate()?;
        let builder = self
            .stages
            .iter()
            .fold(PipelineBuilder::new(self.capacity), |b, name| {
                b.add_stage(name.as_str())
            });
        Ok(builder.with_wait_strategy(self.wait_strategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.capacity, 1024);
    }

    #[test]
    fn test_full_config() {
        let config = PipelineConfig::from_toml_str(
            r#"
            capacity = 16
            stages = ["parse", "enrich", "sink"]
            wait_strategy = { kind = "sleeping", max_micros = 200 }
            "#,
        )
        .unwrap();
        assert_eq!(config.capacity, 16);
        assert_eq!(
            config.wait_strategy,
            WaitStrategy::Sleeping { max_micros: 200 }
        );

        let pipeline = config.builder::<u64>().unwrap().build().unwrap();
        assert_eq!(pipeline.capacity(), 16);
        assert_eq!(pipeline.stage_names(), vec!["parse", "enrich", "sink"]);
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        let err = PipelineConfig::from_toml_str("capacity = 5").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidCapacity { capacity: 5 }));
        assert!(PipelineConfig::from_toml_str("capacity = 16").is_ok());
    }

    #[test]
    fn test_rejects_empty_chain_and_blank_names() {
        assert!(matches!(
            PipelineConfig::from_toml_str("stages = []"),
            Err(PipelineError::NoStages)
        ));
        let err = PipelineConfig::from_toml_str(r#"stages = ["a", " "]"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "configuration error: stage 1 has an empty name");
    }

    #[test]
    fn test_parse_error() {
        let err = PipelineConfig::from_toml_str("capacity = \"big\"").unwrap_err();
        assert!(matches!(err, PipelineError::ConfigParse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let missing = std::path::PathBuf::from("/nonexistent/ring-pipeline.toml");
        let err = PipelineConfig::load(&missing).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ConfigRead { ref path, .. } if path == "/nonexistent/ring-pipeline.toml"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "ring-pipeline-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "capacity = 8\nstages = [\"only\"]\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.stages, vec!["only"]);
    }
}
