//! The typed, immutable run configuration.
//!
//! A `TrainingConfig` is read once from a JSON file, every missing field
//! takes its default, and it's validated before any collective runs so a bad
//! value can't leave ranks out of step.

use std::{
    env, error::Error, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Reasons a configuration is rejected.
#[derive(Debug)]
pub enum ConfigErr {
    UnknownOptimizer(String),
    InvalidExecMode(String),
    Invalid { field: &'static str, reason: String },
    Read { path: PathBuf, source: io::Error },
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOptimizer(name) => write!(f, "optimizer {name} unknown"),
            Self::InvalidExecMode(mode) => write!(f, "invalid exec_mode `{mode}`"),
            Self::Invalid { field, reason } => write!(f, "invalid `{field}`: {reason}"),
            Self::Read { path, source } => {
                write!(f, "couldn't read {}: {source}", path.display())
            }
            Self::Parse(e) => write!(f, "couldn't parse the configuration: {e}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

/// The optimizer family to train with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    Lamb,
}

impl FromStr for OptimizerKind {
    type Err = ConfigErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "lamb" => Ok(Self::Lamb),
            other => Err(ConfigErr::UnknownOptimizer(other.to_string())),
        }
    }
}

/// What a run does once the group is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Train,
    Evaluate,
}

impl FromStr for ExecMode {
    type Err = ConfigErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "evaluate" => Ok(Self::Evaluate),
            other => Err(ConfigErr::InvalidExecMode(other.to_string())),
        }
    }
}

/// Shape of the synthetic volumes the reference data pipeline generates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Validation volumes, split across ranks.
    pub val_size: usize,
    /// Voxels per volume.
    pub voxels: usize,
    /// Standard deviation of the noise added to the foreground signal.
    pub noise: f64,
    /// Standard deviation of the fresh noise the training loader adds to
    /// every batch it yields.
    pub jitter: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            val_size: 16,
            voxels: 64,
            noise: 0.5,
            jitter: 0.05,
        }
    }
}

/// Every knob a run reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub ga_steps: usize,
    pub quality_threshold: f64,
    /// The master seed, a fresh one is drawn when unset.
    pub seed: Option<u64>,

    pub optimizer: String,
    pub learning_rate: f64,
    pub init_learning_rate: f64,
    pub lr_warmup_epochs: usize,
    pub lr_decay_epochs: Vec<usize>,
    pub lr_decay_factor: f64,
    pub lamb_betas: [f64; 2],
    pub momentum: f64,
    pub weight_decay: f64,

    pub evaluate_every: Option<usize>,
    pub start_eval_at: Option<usize>,
    /// Steps per epoch are capped to this many when set.
    pub max_training_step: Option<usize>,

    pub amp: bool,
    pub cudnn_benchmark: bool,
    pub cudnn_deterministic: bool,
    /// Seconds each step sleeps in place of computing, disabled when negative.
    pub sleep: f64,
    pub exec_mode: String,
    pub verbose: bool,
    pub skip_reduce: bool,

    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub save_ckpt_path: Option<PathBuf>,

    pub dataset_size: usize,
    pub master_port: u16,
    /// Appended to the leader's host name, e.g. `.example.org`.
    pub host_suffix: Option<String>,
    pub progress_every: usize,
    pub data: DataConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 2,
            ga_steps: 1,
            quality_threshold: 0.908,
            seed: None,
            optimizer: "sgd".to_string(),
            learning_rate: 1.0,
            init_learning_rate: 1e-4,
            lr_warmup_epochs: 0,
            lr_decay_epochs: Vec::new(),
            lr_decay_factor: 1.0,
            lamb_betas: [0.9, 0.999],
            momentum: 0.9,
            weight_decay: 0.0,
            evaluate_every: None,
            start_eval_at: None,
            max_training_step: None,
            amp: false,
            cudnn_benchmark: false,
            cudnn_deterministic: false,
            sleep: -1.0,
            exec_mode: "train".to_string(),
            verbose: false,
            skip_reduce: false,
            output_dir: PathBuf::from("./results"),
            log_dir: PathBuf::from("/tmp"),
            save_ckpt_path: None,
            dataset_size: 168,
            master_port: 23456,
            host_suffix: None,
            progress_every: 50,
            data: DataConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Reads, completes and validates a configuration file.
    ///
    /// # Arguments
    /// * `path` - A JSON object, missing fields take their defaults.
    ///
    /// # Returns
    /// The validated configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigErr> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigErr::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_json(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration without validating it.
    pub fn from_json(raw: &str) -> Result<Self, ConfigErr> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Applies the environment overrides, currently `SKIP_REDUCE=1`.
    pub fn apply_env(&mut self) {
        if env::var("SKIP_REDUCE").is_ok_and(|v| v == "1") {
            self.skip_reduce = true;
        }
    }

    /// Checks every value the run depends on.
    ///
    /// The execution mode isn't checked here, an unknown mode is reported by
    /// the runner without failing the process.
    pub fn validate(&self) -> Result<(), ConfigErr> {
        self.optimizer_kind()?;

        let positive = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("ga_steps", self.ga_steps),
            ("dataset_size", self.dataset_size),
            ("progress_every", self.progress_every),
            ("data.val_size", self.data.val_size),
            ("data.voxels", self.data.voxels),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        let finite = [
            ("quality_threshold", self.quality_threshold),
            ("learning_rate", self.learning_rate),
            ("init_learning_rate", self.init_learning_rate),
            ("momentum", self.momentum),
            ("weight_decay", self.weight_decay),
            ("sleep", self.sleep),
            ("data.noise", self.data.noise),
            ("data.jitter", self.data.jitter),
        ];

        for (field, value) in finite {
            if !value.is_finite() {
                return Err(invalid(field, "must be a finite number"));
            }
        }

        if self.data.noise < 0.0 || self.data.jitter < 0.0 {
            return Err(invalid("data", "noise levels can't be negative"));
        }

        if self.sleep >= 0.0 && Duration::try_from_secs_f64(self.sleep).is_err() {
            return Err(invalid("sleep", "too long to be represented as a duration"));
        }

        if self.lr_decay_factor <= 0.0 || !self.lr_decay_factor.is_finite() {
            return Err(invalid("lr_decay_factor", "must be a positive number"));
        }

        if self.lamb_betas.iter().any(|b| !(0.0..1.0).contains(b)) {
            return Err(invalid("lamb_betas", "both betas must be in [0, 1)"));
        }

        if self.lr_decay_epochs.windows(2).any(|w| w[0] > w[1]) {
            return Err(invalid("lr_decay_epochs", "milestones must be sorted"));
        }

        Ok(())
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, ConfigErr> {
        self.optimizer.parse()
    }

    pub fn exec_mode(&self) -> Result<ExecMode, ConfigErr> {
        self.exec_mode.parse()
    }

    /// How long each step sleeps in place of computing, if it does.
    pub fn synthetic_sleep(&self) -> Option<Duration> {
        if self.sleep < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.sleep).ok()
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigErr {
    ConfigErr::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = TrainingConfig::from_json(r#"{ "epochs": 12, "optimizer": "adam" }"#).unwrap();

        assert_eq!(config.epochs, 12);
        assert_eq!(config.optimizer_kind().unwrap(), OptimizerKind::Adam);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.quality_threshold, 0.908);
        assert_eq!(config.lamb_betas, [0.9, 0.999]);
        assert_eq!(config.evaluate_every, None);
        assert_eq!(config.synthetic_sleep(), None);
        assert_eq!(config.exec_mode().unwrap(), ExecMode::Train);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_optimizer_is_rejected() {
        let config = TrainingConfig {
            optimizer: "adagrad".into(),
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigErr::UnknownOptimizer(name)) if name == "adagrad"
        ));
    }

    #[test]
    fn zero_ga_steps_is_rejected() {
        let config = TrainingConfig {
            ga_steps: 0,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigErr::Invalid { field: "ga_steps", .. })
        ));
    }

    #[test]
    fn invalid_exec_mode_passes_validation() {
        let config = TrainingConfig {
            exec_mode: "infer".into(),
            ..Default::default()
        };

        config.validate().unwrap();
        assert!(matches!(config.exec_mode(), Err(ConfigErr::InvalidExecMode(_))));
    }

    #[test]
    fn zero_sleep_still_sleeps() {
        let config = TrainingConfig {
            sleep: 0.0,
            ..Default::default()
        };

        assert_eq!(config.synthetic_sleep(), Some(Duration::ZERO));
    }

    #[test]
    fn unrepresentable_sleep_is_rejected() {
        let config = TrainingConfig {
            sleep: 1e20,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigErr::Invalid { field: "sleep", .. })
        ));
        assert_eq!(config.synthetic_sleep(), None);
    }

    #[test]
    fn negative_jitter_is_rejected() {
        let mut config = TrainingConfig::default();
        config.data.jitter = -0.1;

        assert!(matches!(
            config.validate(),
            Err(ConfigErr::Invalid { field: "data", .. })
        ));
    }

    #[test]
    fn explicit_zero_cadence_is_kept() {
        let config =
            TrainingConfig::from_json(r#"{ "evaluate_every": 0, "start_eval_at": 0 }"#).unwrap();

        assert_eq!(config.evaluate_every, Some(0));
        assert_eq!(config.start_eval_at, Some(0));
    }
}
