//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! of a configuration file can be found in the `configs/` directory located in the repository root.

use std::{
    convert::TryFrom,
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use derive_more::Display;
use serde::{
    de::{self, Deserializer, Unexpected, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[cfg(test)]
pub(crate) mod tests;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[serde(default)]
    #[validate]
    pub launch: LaunchSettings,
    #[validate]
    pub federation: FederationSettings,
    #[validate]
    pub data: DataSettings,
    #[serde(default)]
    #[validate]
    pub model: ModelSettings,
    #[validate]
    pub training: TrainingSettings,
    pub output: OutputSettings,
    #[serde(default)]
    pub gpu: GpuSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedavg").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Settings of the MPI invocation itself.
pub struct LaunchSettings {
    /// The MPI launcher program.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [launch]
    /// mpirun = "/usr/local/bin/mpirun"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_LAUNCH__MPIRUN=/usr/local/bin/mpirun
    /// ```
    #[serde(default = "default_mpirun")]
    pub mpirun: PathBuf,

    /// Extra arguments for the MPI launcher, placed before the process count.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [launch]
    /// mpirun_args = ["--allow-run-as-root", "--oversubscribe"]
    /// ```
    #[serde(default)]
    pub mpirun_args: Vec<String>,

    /// The host-list file handed to the MPI launcher. It is rewritten on every launch.
    #[serde(default = "default_host_file")]
    pub host_file: PathBuf,

    /// Overrides the detected hostname written into the host file.
    pub hostname: Option<String>,

    /// The interpreter running the training entry point.
    #[serde(default = "default_python")]
    pub python: PathBuf,

    /// The training module, started as `python -m <entry_point>`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [launch]
    /// entry_point = "fedavg_main_tc"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_LAUNCH__ENTRY_POINT=fedavg_main_tc
    /// ```
    #[serde(default = "default_entry_point")]
    #[validate(length(min = 1))]
    pub entry_point: String,

    /// When set, the standard error of the process group is written into this file.
    pub log_file: Option<PathBuf>,

    /// Extra environment variables for the process group.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [[launch.env]]
    /// name = "CUDA_VISIBLE_DEVICES"
    /// value = "0,1,2,3"
    /// ```
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            mpirun: default_mpirun(),
            mpirun_args: Vec::new(),
            host_file: default_host_file(),
            hostname: None,
            python: default_python(),
            entry_point: default_entry_point(),
            log_file: None,
            env: Vec::new(),
        }
    }
}

fn default_mpirun() -> PathBuf {
    PathBuf::from("mpirun")
}

fn default_host_file() -> PathBuf {
    PathBuf::from("mpi_host_file")
}

fn default_python() -> PathBuf {
    PathBuf::from("python")
}

fn default_entry_point() -> String {
    "fedavg_main_tc".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
/// An environment variable set for the process group.
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_federation"))]
/// Federated averaging settings.
pub struct FederationSettings {
    /// The number of workers, i.e. the number of clients participating per round. One additional
    /// process is launched for the aggregating server.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// worker_num = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__WORKER_NUM=10
    /// ```
    #[serde(deserialize_with = "deserialize_integer")]
    pub worker_num: u32,

    /// The number of communication rounds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// comm_round = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__COMM_ROUND=10
    /// ```
    #[serde(deserialize_with = "deserialize_integer")]
    #[validate(range(min = 1))]
    pub comm_round: u32,

    /// Runs the training program in continuous-integration mode.
    #[serde(default)]
    pub ci: bool,

    /// The total number of clients. Must not be smaller than `worker_num`.
    #[serde(default, deserialize_with = "deserialize_optional_integer")]
    pub client_num_in_total: Option<u32>,

    /// Evaluate every this many rounds.
    #[serde(default, deserialize_with = "deserialize_optional_integer")]
    pub frequency_of_the_test: Option<u32>,

    /// Whether the server side runs for mobile clients.
    pub is_mobile: Option<bool>,
}

impl FederationSettings {
    fn validate_federation(&self) -> Result<(), ValidationError> {
        if let Some(total) = self.client_num_in_total {
            if total < self.worker_num {
                return Err(ValidationError::new("client_num_in_total below worker_num"));
            }
        }
        if self.frequency_of_the_test == Some(0) {
            return Err(ValidationError::new("frequency_of_the_test must be positive"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_federation(s: &FederationSettings) -> Result<(), ValidationError> {
    s.validate_federation()
}

#[derive(Debug, Deserialize, Display, Clone, Copy, PartialEq, Eq)]
/// The datasets the training program ships a data loader for.
pub enum Dataset {
    #[serde(rename = "20news")]
    #[display(fmt = "20news")]
    News20,
    #[serde(rename = "agnews")]
    #[display(fmt = "agnews")]
    AgNews,
    #[serde(rename = "semeval_2010_task8")]
    #[display(fmt = "semeval_2010_task8")]
    SemEval2010Task8,
    #[serde(rename = "sentiment140")]
    #[display(fmt = "sentiment140")]
    Sentiment140,
    #[serde(rename = "sst_2")]
    #[display(fmt = "sst_2")]
    Sst2,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Dataset settings.
pub struct DataSettings {
    /// The dataset name.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// dataset = "agnews"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_DATA__DATASET=agnews
    /// ```
    pub dataset: Dataset,
    /// The preprocessed data file.
    pub data_file: PathBuf,
    /// The file describing how the data is split across clients.
    pub partition_file: PathBuf,
    /// The partition strategy stored in the partition file.
    #[serde(default = "default_partition_method")]
    #[validate(length(min = 1))]
    pub partition_method: String,
}

fn default_partition_method() -> String {
    "uniform".to_string()
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Model settings.
pub struct ModelSettings {
    #[serde(default = "default_model_type")]
    #[validate(length(min = 1))]
    pub model_type: String,
    #[serde(default = "default_model_name")]
    #[validate(length(min = 1))]
    pub model_name: String,
    #[serde(default = "default_do_lower_case")]
    pub do_lower_case: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            model_name: default_model_name(),
            do_lower_case: default_do_lower_case(),
        }
    }
}

fn default_model_type() -> String {
    "distilbert".to_string()
}

fn default_model_name() -> String {
    "distilbert-base-uncased".to_string()
}

fn default_do_lower_case() -> bool {
    true
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_training"))]
/// Local training hyperparameters.
pub struct TrainingSettings {
    #[validate(range(min = 1))]
    #[serde(deserialize_with = "deserialize_integer")]
    pub train_batch_size: u32,
    #[validate(range(min = 1))]
    #[serde(deserialize_with = "deserialize_integer")]
    pub eval_batch_size: u32,
    #[validate(range(min = 1))]
    #[serde(deserialize_with = "deserialize_integer")]
    pub max_seq_length: u32,

    /// The learning rate. The value must be positive. It is forwarded in scientific notation
    /// when below `1e-3` (`1e-5` stays `1e-5`), otherwise in plain decimal notation.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// learning_rate = 1e-5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_TRAINING__LEARNING_RATE=1e-5
    /// ```
    pub learning_rate: f64,

    /// The number of local epochs per round.
    #[validate(range(min = 1))]
    #[serde(deserialize_with = "deserialize_integer")]
    pub epochs: u32,

    /// Enables reduced-precision training.
    #[serde(default)]
    pub fp16: bool,

    pub weight_decay: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_integer")]
    pub gradient_accumulation_steps: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_optional_integer")]
    pub n_gpu: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_optional_integer")]
    pub manual_seed: Option<u64>,
}

impl TrainingSettings {
    fn validate_training(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts literals and no exclusive bounds
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            return Err(ValidationError::new("learning_rate must be positive"));
        }
        if let Some(weight_decay) = self.weight_decay {
            if !(weight_decay.is_finite() && weight_decay >= 0.) {
                return Err(ValidationError::new("weight_decay must not be negative"));
            }
        }
        if self.gradient_accumulation_steps == Some(0) {
            return Err(ValidationError::new(
                "gradient_accumulation_steps must be positive",
            ));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_training(s: &TrainingSettings) -> Result<(), ValidationError> {
    s.validate_training()
}

#[derive(Debug, Deserialize, Clone)]
/// Output settings.
pub struct OutputSettings {
    /// Where the training program saves results and checkpoints.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [output]
    /// dir = "/tmp/fedavg_agnews_output/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_OUTPUT__DIR=/tmp/fedavg_agnews_output/
    /// ```
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
/// Settings for mapping processes to GPU devices.
pub struct GpuSettings {
    /// A YAML file assigning the processes of each host to its GPUs.
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,
    /// The mapping to use within the mapping file.
    #[serde(default = "default_mapping_key")]
    pub mapping_key: String,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            mapping_file: default_mapping_file(),
            mapping_key: default_mapping_key(),
        }
    }
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("gpu_mapping.yaml")
}

fn default_mapping_key() -> String {
    "mapping_default".to_string()
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

/// Deserializes an unsigned integer without narrowing it.
///
/// The `config` crate casts integers to the requested width, so out-of-range and negative values
/// would silently wrap. They are read at full width and rejected instead.
fn deserialize_integer<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = i64::deserialize(deserializer)?;
    T::try_from(value).map_err(|_| {
        de::Error::invalid_value(Unexpected::Signed(value), &"a non-negative integer in range")
    })
}

fn deserialize_optional_integer<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    Option::<i64>::deserialize(deserializer)?
        .map(|value| {
            T::try_from(value).map_err(|_| {
                de::Error::invalid_value(
                    Unexpected::Signed(value),
                    &"a non-negative integer in range",
                )
            })
        })
        .transpose()
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
