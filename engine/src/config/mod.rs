//! Configuration management
//!
//! This module handles loading, validation, and management of the Warden configuration.
//! Configuration is stored in TOML format at ~/.warden/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level
//! - **execution**: Concurrency bound, timeouts, kill grace period, output cap
//! - **strategy**: Default decision strategy and per-capability overrides
//! - **fuzzy**, **evolutionary**, **q_learning**: Strategy tuning surfaces
//! - **registry**: Performance history window and expertise learning rate
//! - **tools**: Binary path overrides and wordlists
//!
//! # Examples
//!
//! ```no_run
//! use warden_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Max concurrency: {}", config.execution.max_concurrency);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::Capability;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
///
/// Every section falls back to its defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Subprocess execution limits
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Decision strategy selection
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Fuzzy strategy tuning
    #[serde(default)]
    pub fuzzy: FuzzyConfig,

    /// Evolutionary strategy tuning
    #[serde(default)]
    pub evolutionary: EvolutionaryConfig,

    /// Action-value strategy tuning
    #[serde(default)]
    pub q_learning: QLearningConfig,

    /// Agent registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Tool binaries and wordlists
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Execution limits shared by every tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum concurrent tool invocations across all agents
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Base timeout unit; per-tool ceilings are multiples of it
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Per-stream cap on captured stdout/stderr
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,

    /// Root directory for tool output such as carved files (supports ~ expansion)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

/// Which decision strategy handles which capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// fuzzy, evolutionary, or q_learning
    #[serde(default = "default_strategy")]
    pub default: String,

    /// Capability name to strategy name
    #[serde(default)]
    pub overrides: HashMap<String, String>,

    /// Confidence distance under which two tools are considered tied
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyConfig {
    #[serde(default = "default_fuzzy_rate")]
    pub adaptation_rate: f64,

    #[serde(default = "default_min_rule_weight")]
    pub min_rule_weight: f64,

    #[serde(default = "default_max_rule_weight")]
    pub max_rule_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionaryConfig {
    #[serde(default = "default_population_size")]
    pub population_size: usize,

    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,

    #[serde(default = "default_mutation_sigma")]
    pub mutation_sigma: f64,

    /// Fraction of the population carried over unchanged each generation
    #[serde(default = "default_elite_fraction")]
    pub elite_fraction: f64,

    /// Learning samples per generation
    #[serde(default = "default_evolve_every")]
    pub evolve_every: usize,

    /// Fixed RNG seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLearningConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_discount_factor")]
    pub discount_factor: f64,

    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    #[serde(default = "default_min_epsilon")]
    pub min_epsilon: f64,

    #[serde(default = "default_max_epsilon")]
    pub max_epsilon: f64,

    #[serde(default = "default_buckets")]
    pub risk_buckets: usize,

    #[serde(default = "default_buckets")]
    pub load_buckets: usize,

    /// Softmax temperature used to turn action values into a confidence
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Number of performance samples kept per capability
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Exponential moving average rate for expertise scores
    #[serde(default = "default_expertise_rate")]
    pub expertise_rate: f64,
}

/// Tool binaries configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool name to binary path; tools without an entry are looked up on PATH
    #[serde(default)]
    pub paths: HashMap<String, PathBuf>,

    /// Default wordlist for directory brute forcing
    #[serde(default = "default_wordlist")]
    pub wordlist: PathBuf,
}

/// Strategy identifiers accepted in config and on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Fuzzy,
    Evolutionary,
    QLearning,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Fuzzy => "fuzzy",
            StrategyKind::Evolutionary => "evolutionary",
            StrategyKind::QLearning => "q_learning",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fuzzy" => Ok(StrategyKind::Fuzzy),
            "evolutionary" | "genetic" => Ok(StrategyKind::Evolutionary),
            "q_learning" | "qlearning" => Ok(StrategyKind::QLearning),
            other => Err(EngineError::Config(format!(
                "Invalid strategy '{}'. Must be one of: fuzzy, evolutionary, q_learning",
                other
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrency() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_kill_grace_secs() -> u64 {
    2
}

fn default_output_limit() -> usize {
    1024 * 1024
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("~/.warden/work")
}

fn default_strategy() -> String {
    "fuzzy".to_string()
}

fn default_tie_epsilon() -> f64 {
    0.01
}

fn default_fuzzy_rate() -> f64 {
    0.05
}

fn default_min_rule_weight() -> f64 {
    0.1
}

fn default_max_rule_weight() -> f64 {
    1.0
}

fn default_population_size() -> usize {
    20
}

fn default_mutation_rate() -> f64 {
    0.1
}

fn default_mutation_sigma() -> f64 {
    0.1
}

fn default_elite_fraction() -> f64 {
    0.5
}

fn default_evolve_every() -> usize {
    5
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_discount_factor() -> f64 {
    0.9
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_min_epsilon() -> f64 {
    0.01
}

fn default_max_epsilon() -> f64 {
    0.3
}

fn default_buckets() -> usize {
    3
}

fn default_temperature() -> f64 {
    0.25
}

fn default_history_window() -> usize {
    50
}

fn default_expertise_rate() -> f64 {
    0.1
}

fn default_wordlist() -> PathBuf {
    PathBuf::from("/usr/share/wordlists/dirb/common.txt")
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_secs: default_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            output_limit_bytes: default_output_limit(),
            work_dir: default_work_dir(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            default: default_strategy(),
            overrides: HashMap::new(),
            tie_epsilon: default_tie_epsilon(),
        }
    }
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            adaptation_rate: default_fuzzy_rate(),
            min_rule_weight: default_min_rule_weight(),
            max_rule_weight: default_max_rule_weight(),
        }
    }
}

impl Default for EvolutionaryConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            mutation_rate: default_mutation_rate(),
            mutation_sigma: default_mutation_sigma(),
            elite_fraction: default_elite_fraction(),
            evolve_every: default_evolve_every(),
            seed: None,
        }
    }
}

impl Default for QLearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            discount_factor: default_discount_factor(),
            epsilon: default_epsilon(),
            min_epsilon: default_min_epsilon(),
            max_epsilon: default_max_epsilon(),
            risk_buckets: default_buckets(),
            load_buckets: default_buckets(),
            temperature: default_temperature(),
            seed: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            expertise_rate: default_expertise_rate(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            paths: HashMap::new(),
            wordlist: default_wordlist(),
        }
    }
}

impl ExecutionConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Config {
    /// Load configuration from the default location (~/.warden/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();

        // Serialize before path expansion so the file keeps the portable ~ form
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.warden/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".warden").join("config.toml"))
    }

    /// Strategy responsible for a capability, honouring per-capability overrides
    pub fn strategy_for(&self, capability: Capability) -> StrategyKind {
        self.strategy
            .overrides
            .get(capability.as_str())
            .and_then(|s| s.parse().ok())
            .or_else(|| self.strategy.default.parse().ok())
            .unwrap_or(StrategyKind::Fuzzy)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, strategy names, and numeric ranges
    /// - Expands ~ in paths
    ///
    /// Directories are not created here; the dispatcher creates the work
    /// directory lazily when a tool first needs it.
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.strategy.default.parse::<StrategyKind>()?;
        for (capability, strategy) in &self.strategy.overrides {
            capability
                .parse::<Capability>()
                .map_err(EngineError::Config)?;
            strategy.parse::<StrategyKind>()?;
        }

        if self.execution.max_concurrency == 0 {
            return Err(EngineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.execution.default_timeout_secs == 0 {
            return Err(EngineError::Config(
                "default_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.execution.output_limit_bytes < 1024 {
            return Err(EngineError::Config(
                "output_limit_bytes must be at least 1024".to_string(),
            ));
        }

        check_unit("strategy.tie_epsilon", self.strategy.tie_epsilon)?;
        check_unit("fuzzy.adaptation_rate", self.fuzzy.adaptation_rate)?;
        check_unit("fuzzy.min_rule_weight", self.fuzzy.min_rule_weight)?;
        check_unit("fuzzy.max_rule_weight", self.fuzzy.max_rule_weight)?;
        if self.fuzzy.min_rule_weight > self.fuzzy.max_rule_weight {
            return Err(EngineError::Config(
                "fuzzy.min_rule_weight must not exceed max_rule_weight".to_string(),
            ));
        }

        if self.evolutionary.population_size < 2 {
            return Err(EngineError::Config(
                "evolutionary.population_size must be at least 2".to_string(),
            ));
        }
        check_unit("evolutionary.mutation_rate", self.evolutionary.mutation_rate)?;
        check_unit("evolutionary.mutation_sigma", self.evolutionary.mutation_sigma)?;
        check_unit("evolutionary.elite_fraction", self.evolutionary.elite_fraction)?;
        if self.evolutionary.evolve_every == 0 {
            return Err(EngineError::Config(
                "evolutionary.evolve_every must be at least 1".to_string(),
            ));
        }

        let q = &self.q_learning;
        if q.learning_rate <= 0.0 || q.learning_rate > 1.0 {
            return Err(EngineError::Config(
                "q_learning.learning_rate must be in (0, 1]".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&q.discount_factor) {
            return Err(EngineError::Config(
                "q_learning.discount_factor must be in [0, 1)".to_string(),
            ));
        }
        check_unit("q_learning.epsilon", q.epsilon)?;
        check_unit("q_learning.min_epsilon", q.min_epsilon)?;
        check_unit("q_learning.max_epsilon", q.max_epsilon)?;
        if q.min_epsilon > q.max_epsilon {
            return Err(EngineError::Config(
                "q_learning.min_epsilon must not exceed max_epsilon".to_string(),
            ));
        }
        if q.risk_buckets == 0 || q.load_buckets == 0 {
            return Err(EngineError::Config(
                "q_learning bucket counts must be at least 1".to_string(),
            ));
        }
        if q.temperature <= 0.0 {
            return Err(EngineError::Config(
                "q_learning.temperature must be positive".to_string(),
            ));
        }

        if self.registry.history_window == 0 {
            return Err(EngineError::Config(
                "registry.history_window must be at least 1".to_string(),
            ));
        }
        check_unit("registry.expertise_rate", self.registry.expertise_rate)?;

        self.execution.work_dir = expand_path(&self.execution.work_dir)?;
        for path in self.tools.paths.values_mut() {
            *path = expand_path(path)?;
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Config(format!(
            "{} must be between 0.0 and 1.0",
            name
        )));
    }
    Ok(())
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.execution.max_concurrency, 5);
        assert_eq!(config.execution.default_timeout_secs, 30);
        assert_eq!(config.evolutionary.population_size, 20);
        assert_eq!(config.registry.history_window, 50);
        assert_eq!(config.strategy_for(Capability::Web), StrategyKind::Fuzzy);
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.q_learning.discount_factor, 0.9);
    }

    #[test]
    fn test_strategy_overrides() {
        let config = Config::from_toml_str(
            r#"
[strategy]
default = "evolutionary"

[strategy.overrides]
network = "q_learning"
"#,
        )
        .unwrap();

        assert_eq!(
            config.strategy_for(Capability::Network),
            StrategyKind::QLearning
        );
        assert_eq!(
            config.strategy_for(Capability::Forensic),
            StrategyKind::Evolutionary
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml_str("[core]\nlog_level = \"loud\"").is_err());
        assert!(Config::from_toml_str("[strategy]\ndefault = \"astrology\"").is_err());
        assert!(Config::from_toml_str("[strategy.overrides]\nplumbing = \"fuzzy\"").is_err());
        assert!(Config::from_toml_str("[execution]\nmax_concurrency = 0").is_err());
        assert!(Config::from_toml_str("[q_learning]\ndiscount_factor = 1.0").is_err());
        assert!(Config::from_toml_str("[fuzzy]\nmin_rule_weight = 0.9\nmax_rule_weight = 0.5").is_err());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.strategy.default, deserialized.strategy.default);
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("Q-Learning".parse::<StrategyKind>().unwrap(), StrategyKind::QLearning);
        assert_eq!("genetic".parse::<StrategyKind>().unwrap(), StrategyKind::Evolutionary);
        assert!("bayes".parse::<StrategyKind>().is_err());
    }
}
