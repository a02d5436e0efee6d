//! TOML configuration of a pipeline run.
//!
//! Every field has a default, so an empty file is a valid configuration and
//! command-line flags only need to override what differs.

use crate::bayes::hmc::NutsConfig;
use crate::bayes::spec::Hypothesis;
use crate::lakes::corrections::{RecordCorrection, default_corrections};
use crate::lakes::data::LakeSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Unknown model '{0}'. Known models: edw, forecasting, mass_balance, monsoonality")]
    UnknownModel(String),
    #[error("Invalid [mcmc] section: {0}")]
    InvalidMcmc(String),
    #[error("The separator '{0}' must be a single ASCII character")]
    InvalidSeparator(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Lake inventory with outburst records.
    pub lakes: PathBuf,
    /// Per-lake climate and glacier statistics.
    pub climate: PathBuf,
    pub separator: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            lakes: PathBuf::from("data/lakes.csv"),
            climate: PathBuf::from("data/climate.csv"),
            separator: ",".to_string(),
        }
    }
}

impl InputConfig {
    pub fn separator_byte(&self) -> Result<u8, ConfigError> {
        match self.separator.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(ConfigError::InvalidSeparator(self.separator.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// Models to fit, by slug. Empty means all four.
    pub models: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("results"),
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub inputs: InputConfig,
    pub schema: LakeSchema,
    pub mcmc: NutsConfig,
    pub corrections: Vec<RecordCorrection>,
    pub output: OutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inputs: InputConfig::default(),
            schema: LakeSchema::default(),
            mcmc: NutsConfig::default(),
            corrections: default_corrections(),
            output: OutputConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml(&toml_string)
    }

    pub fn from_toml(toml_string: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_string)?)
    }

    /// Writes the effective configuration, so a run can be repeated exactly.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// The selected models in canonical order.
    pub fn hypotheses(&self) -> Result<Vec<Hypothesis>, ConfigError> {
        if self.output.models.is_empty() {
            return Ok(Hypothesis::ALL.to_vec());
        }
        let mut selected = Vec::with_capacity(self.output.models.len());
        for slug in &self.output.models {
            let hypothesis = Hypothesis::from_slug(slug.trim())
                .ok_or_else(|| ConfigError::UnknownModel(slug.clone()))?;
            if !selected.contains(&hypothesis) {
                selected.push(hypothesis);
            }
        }
        selected.sort_by_key(|h| Hypothesis::ALL.iter().position(|a| a == h));
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_gives_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.mcmc.chains, 4);
        assert_eq!(config.mcmc.iterations, 2000);
        assert_eq!(config.corrections.len(), 1);
        assert_eq!(config.corrections[0].row, 1544);
        assert_eq!(config.schema.primary_key, "glims_id");
        assert_eq!(config.hypotheses().unwrap(), Hypothesis::ALL.to_vec());
    }

    #[test]
    fn sections_override_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [inputs]
            lakes = "a.tsv"
            separator = "\t"

            [schema]
            glof = "GLOF"

            [mcmc]
            chains = 2
            seed = 7

            [output]
            models = ["monsoonality", "edw", "edw"]
            "#,
        )
        .unwrap();
        assert_eq!(config.inputs.lakes, PathBuf::from("a.tsv"));
        assert_eq!(config.inputs.separator_byte().unwrap(), b'\t');
        assert_eq!(config.schema.glof, "GLOF");
        assert_eq!(config.schema.region, "region");
        assert_eq!(config.mcmc.chains, 2);
        assert_eq!(config.mcmc.warmup, 1000);
        assert_eq!(
            config.hypotheses().unwrap(),
            vec![Hypothesis::ElevationDependentWarming, Hypothesis::Monsoonality]
        );
    }

    #[test]
    fn explicit_empty_corrections_disable_the_default() {
        let config = PipelineConfig::from_toml("corrections = []").unwrap();
        assert!(config.corrections.is_empty());
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(matches!(
            PipelineConfig::from_toml("[mcmc]\nchainz = 3"),
            Err(ConfigError::TomlParse(_))
        ));
        let mut config = PipelineConfig::default();
        config.output.models = vec!["glacier".into()];
        assert!(matches!(config.hypotheses(), Err(ConfigError::UnknownModel(_))));
        config.inputs.separator = ";;".into();
        assert!(config.inputs.separator_byte().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut config = PipelineConfig::default();
        config.mcmc.seed = 99;
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }
}
