use std::{env, path::PathBuf};

use config::{Config, FileFormat};
use serial_test::serial;
use validator::Validate;

use super::{Dataset, EnvVar, Settings, SettingsError};

/// The settings of the agnews experiment, without environment overrides.
pub(crate) const AGNEWS: &str = r#"
[federation]
worker_num = 10
comm_round = 10

[data]
dataset = "agnews"
data_file = "data/data_files/agnews_data.h5"
partition_file = "data/partition_files/agnews_partition.h5"

[training]
train_batch_size = 32
eval_batch_size = 8
max_seq_length = 256
learning_rate = 1e-5
epochs = 1
fp16 = true

[output]
dir = "/tmp/fedavg_agnews_output/"
"#;

/// Loads and validates settings from a TOML string.
pub(crate) fn settings_from_toml(toml: &str) -> Result<Settings, SettingsError> {
    let mut config = Config::new();
    config.merge(config::File::from_str(toml, FileFormat::Toml))?;
    let settings: Settings = config.try_into()?;
    settings.validate()?;
    Ok(settings)
}

pub(crate) fn agnews() -> Settings {
    settings_from_toml(AGNEWS).unwrap()
}

#[test]
#[serial]
fn test_settings_new() {
    assert!(Settings::new("configs/agnews.toml").is_ok());
    assert!(Settings::new("").is_err());
}

#[test]
#[serial]
fn test_settings_env_override() {
    env::set_var("FEDAVG_FEDERATION__WORKER_NUM", "4");
    env::set_var("FEDAVG_DATA__DATASET", "sst_2");
    let settings = Settings::new("configs/agnews.toml");
    env::remove_var("FEDAVG_FEDERATION__WORKER_NUM");
    env::remove_var("FEDAVG_DATA__DATASET");

    let settings = settings.unwrap();
    assert_eq!(settings.federation.worker_num, 4);
    assert_eq!(settings.data.dataset, Dataset::Sst2);
    assert_eq!(settings.federation.comm_round, 10);
}

#[test]
fn test_settings_defaults() {
    let settings = agnews();

    assert_eq!(settings.launch.mpirun, PathBuf::from("mpirun"));
    assert!(settings.launch.mpirun_args.is_empty());
    assert_eq!(settings.launch.host_file, PathBuf::from("mpi_host_file"));
    assert_eq!(settings.launch.hostname, None);
    assert_eq!(settings.launch.python, PathBuf::from("python"));
    assert_eq!(settings.launch.entry_point, "fedavg_main_tc");
    assert_eq!(settings.launch.log_file, None);
    assert!(settings.launch.env.is_empty());

    assert!(!settings.federation.ci);
    assert_eq!(settings.federation.client_num_in_total, None);
    assert_eq!(settings.data.partition_method, "uniform");
    assert_eq!(settings.model.model_type, "distilbert");
    assert_eq!(settings.model.model_name, "distilbert-base-uncased");
    assert!(settings.model.do_lower_case);
    assert_eq!(settings.training.manual_seed, None);
    assert_eq!(settings.gpu.mapping_file, PathBuf::from("gpu_mapping.yaml"));
    assert_eq!(settings.gpu.mapping_key, "mapping_default");
}

#[test]
fn test_settings_launch_env() {
    let toml = format!(
        r#"
        {}
        [[launch.env]]
        name = "CUDA_VISIBLE_DEVICES"
        value = "0,1"

        [[launch.env]]
        name = "OMP_NUM_THREADS"
        value = "1"
        "#,
        AGNEWS
    );
    let settings = settings_from_toml(&toml).unwrap();
    assert_eq!(
        settings.launch.env,
        vec![
            EnvVar {
                name: "CUDA_VISIBLE_DEVICES".to_string(),
                value: "0,1".to_string(),
            },
            EnvVar {
                name: "OMP_NUM_THREADS".to_string(),
                value: "1".to_string(),
            },
        ]
    );
}

#[test]
fn test_datasets() {
    for (name, dataset) in &[
        ("20news", Dataset::News20),
        ("agnews", Dataset::AgNews),
        ("semeval_2010_task8", Dataset::SemEval2010Task8),
        ("sentiment140", Dataset::Sentiment140),
        ("sst_2", Dataset::Sst2),
    ] {
        let toml = AGNEWS.replace("\"agnews\"", &format!("{:?}", name));
        let settings = settings_from_toml(&toml).unwrap();
        assert_eq!(settings.data.dataset, *dataset);
        assert_eq!(dataset.to_string(), *name);
    }

    let toml = AGNEWS.replace("\"agnews\"", "\"imdb\"");
    assert!(matches!(
        settings_from_toml(&toml),
        Err(SettingsError::Loading(_))
    ));
}

#[test]
fn test_missing_section() {
    let toml = AGNEWS.replace("[output]\ndir = \"/tmp/fedavg_agnews_output/\"\n", "");
    assert!(matches!(
        settings_from_toml(&toml),
        Err(SettingsError::Loading(_))
    ));
}

#[test]
fn test_out_of_range_integers() {
    for replacement in &["worker_num = -1", "worker_num = 4294967296"] {
        let toml = AGNEWS.replace("worker_num = 10", replacement);
        assert!(
            matches!(settings_from_toml(&toml), Err(SettingsError::Loading(_))),
            "{}",
            replacement
        );
    }

    let toml = AGNEWS.replace("epochs = 1", "epochs = 4294967297");
    assert!(settings_from_toml(&toml).is_err());

    let toml = AGNEWS.replace("fp16 = true", "fp16 = true\nmanual_seed = -42");
    assert!(settings_from_toml(&toml).is_err());

    let toml = AGNEWS.replace("comm_round = 10", "comm_round = 10\nclient_num_in_total = -10");
    assert!(settings_from_toml(&toml).is_err());
}

#[test]
fn test_integers_in_range() {
    let toml = AGNEWS
        .replace("worker_num = 10", "worker_num = 4294967294")
        .replace("fp16 = true", "fp16 = true\nmanual_seed = 9223372036854775807");
    let settings = settings_from_toml(&toml).unwrap();
    assert_eq!(settings.federation.worker_num, u32::MAX - 1);
    assert_eq!(settings.training.manual_seed, Some(i64::MAX as u64));
    assert_eq!(settings.training.n_gpu, None);
}

#[test]
fn test_invalid_log_filter() {
    let toml = format!("{}\n[log]\nfilter = \"fedavg_launcher=loud\"\n", AGNEWS);
    assert!(settings_from_toml(&toml).is_err());
}

#[test]
fn test_validate_federation() {
    let settings = agnews();
    assert!(settings.federation.validate().is_ok());

    let mut federation = settings.federation.clone();
    federation.worker_num = 0;
    assert!(federation.validate().is_ok());

    let mut federation = settings.federation.clone();
    federation.comm_round = 0;
    assert!(federation.validate().is_err());

    let mut federation = settings.federation.clone();
    federation.client_num_in_total = Some(10);
    assert!(federation.validate().is_ok());
    federation.client_num_in_total = Some(9);
    assert!(federation.validate().is_err());

    let mut federation = settings.federation;
    federation.frequency_of_the_test = Some(0);
    assert!(federation.validate().is_err());
}

#[test]
fn test_validate_training() {
    let settings = agnews();
    assert!(settings.training.validate().is_ok());

    let mut training = settings.training.clone();
    training.learning_rate = 0.;
    assert!(training.validate().is_err());
    training.learning_rate = -1e-5;
    assert!(training.validate().is_err());
    training.learning_rate = f64::NAN;
    assert!(training.validate().is_err());

    let mut training = settings.training.clone();
    training.train_batch_size = 0;
    assert!(training.validate().is_err());

    let mut training = settings.training.clone();
    training.epochs = 0;
    assert!(training.validate().is_err());

    let mut training = settings.training.clone();
    training.weight_decay = Some(0.);
    assert!(training.validate().is_ok());
    training.weight_decay = Some(-0.1);
    assert!(training.validate().is_err());

    let mut training = settings.training;
    training.gradient_accumulation_steps = Some(0);
    assert!(training.validate().is_err());
}

#[test]
fn test_validate_model() {
    let mut model = agnews().model;
    assert!(model.validate().is_ok());
    model.model_name = String::new();
    assert!(model.validate().is_err());
}
