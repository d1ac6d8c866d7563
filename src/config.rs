use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub suggestion: SuggestionConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub language: LanguageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Tuning for the rule suggestion generator.
#[derive(Debug, Deserialize, Clone)]
pub struct SuggestionConfig {
    /// Normalized Levenshtein similarity above which an example-span term
    /// enters the lexical clause.
    #[serde(default = "default_lev_cutoff")]
    pub lev_cutoff: f64,
    /// Embedding similarity above which a term enters the semantic clause.
    #[serde(default = "default_sim_cutoff")]
    pub sim_cutoff: f64,
    /// Attempts to locate an example annotation before giving up on rule
    /// synthesis.
    #[serde(default = "default_max_rule_attempts")]
    pub max_rule_attempts: u32,
}

fn default_lev_cutoff() -> f64 {
    0.30
}
fn default_sim_cutoff() -> f64 {
    0.45
}
fn default_max_rule_attempts() -> u32 {
    3
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            lev_cutoff: default_lev_cutoff(),
            sim_cutoff: default_sim_cutoff(),
            max_rule_attempts: default_max_rule_attempts(),
        }
    }
}

/// Tuning for the semi-supervised label trainer.
#[derive(Debug, Deserialize, Clone)]
pub struct TrainerConfig {
    /// Fraction of the labeled and artificial-negative sets held out as
    /// spies for cutoff calibration.
    #[serde(default = "default_spy_fraction")]
    pub spy_fraction: f64,
    /// Vocabulary floor: terms must appear in at least this many training
    /// rows.
    #[serde(default = "default_min_df")]
    pub min_df: usize,
    /// SGD epochs over the shuffled training set.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Elastic-net regularization strength.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Elastic-net mixing: 1.0 is pure l1, 0.0 pure l2.
    #[serde(default = "default_l1_ratio")]
    pub l1_ratio: f64,
    /// Largest word-subset size the explainer will try before giving up.
    #[serde(default = "default_max_combination_size")]
    pub max_combination_size: usize,
    /// Seed for the spy splits and SGD shuffling. `None` draws from the
    /// thread RNG; tests pin it for reproducibility.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_spy_fraction() -> f64 {
    0.1
}
fn default_min_df() -> usize {
    2
}
fn default_epochs() -> usize {
    30
}
fn default_alpha() -> f64 {
    1e-4
}
fn default_l1_ratio() -> f64 {
    0.15
}
fn default_max_combination_size() -> usize {
    3
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            spy_fraction: default_spy_fraction(),
            min_df: default_min_df(),
            epochs: default_epochs(),
            alpha: default_alpha(),
            l1_ratio: default_l1_ratio(),
            max_combination_size: default_max_combination_size(),
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LanguageConfig {
    /// Language assumed when inference is inconclusive.
    #[serde(default = "default_language")]
    pub default: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            default: default_language(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !(0.0..=1.0).contains(&config.suggestion.lev_cutoff) {
        anyhow::bail!("suggestion.lev_cutoff must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.suggestion.sim_cutoff) {
        anyhow::bail!("suggestion.sim_cutoff must be in [0.0, 1.0]");
    }
    if config.suggestion.max_rule_attempts == 0 {
        anyhow::bail!("suggestion.max_rule_attempts must be >= 1");
    }

    if !(0.0..0.5).contains(&config.trainer.spy_fraction) || config.trainer.spy_fraction <= 0.0 {
        anyhow::bail!("trainer.spy_fraction must be in (0.0, 0.5)");
    }
    if config.trainer.epochs == 0 {
        anyhow::bail!("trainer.epochs must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.trainer.l1_ratio) {
        anyhow::bail!("trainer.l1_ratio must be in [0.0, 1.0]");
    }
    if config.trainer.max_combination_size == 0 {
        anyhow::bail!("trainer.max_combination_size must be >= 1");
    }

    match config.language.default.as_str() {
        "en" | "de" => {}
        other => anyhow::bail!("Unknown default language: '{}'. Must be en or de.", other),
    }

    Ok(config)
}
