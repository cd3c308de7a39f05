//! The command line forwarded to the training program.

use std::{
    ffi::{OsStr, OsString},
    fmt::Display,
    slice,
};

use crate::settings::Settings;

/// An ordered list of arguments forwarded to the training entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList(Vec<OsString>);

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `--<name> <value>`.
    pub fn flag(&mut self, name: &str, value: impl AsRef<OsStr>) -> &mut Self {
        self.0.push(format!("--{}", name).into());
        self.0.push(value.as_ref().to_os_string());
        self
    }

    /// Appends `--<name> <value>` if a value is configured.
    pub fn optional<T: Display>(&mut self, name: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.flag(name, value.to_string());
        }
        self
    }

    /// Appends the bare switch `--<name>` if `enabled` is set.
    pub fn switch(&mut self, name: &str, enabled: bool) -> &mut Self {
        if enabled {
            self.0.push(format!("--{}", name).into());
        }
        self
    }

    /// Counts the occurrences of `flag`, given with its leading dashes.
    pub fn count(&self, flag: &str) -> usize {
        self.0.iter().filter(|arg| *arg == flag).count()
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.count(flag) > 0
    }

    /// Returns the value following the first occurrence of `flag`.
    ///
    /// Returns `None` for absent flags and for switches.
    pub fn value(&self, flag: &str) -> Option<&OsStr> {
        let position = self.0.iter().position(|arg| arg == flag)?;
        self.0
            .get(position + 1)
            .map(OsString::as_os_str)
            .filter(|value| !value.to_string_lossy().starts_with("--"))
    }

    pub fn iter(&self) -> slice::Iter<'_, OsString> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a ArgList {
    type Item = &'a OsString;
    type IntoIter = slice::Iter<'a, OsString>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl From<ArgList> for Vec<OsString> {
    fn from(args: ArgList) -> Self {
        args.0
    }
}

/// Renders a boolean the way the training program's integer flags expect it.
fn int_flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Renders a boolean as a Python literal.
fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Renders a float like Python's `repr`: scientific notation below `1e-3`, plain decimals
/// otherwise.
fn float_flag(value: f64) -> String {
    if value != 0.0 && value.abs() < 1e-3 {
        format!("{:e}", value)
    } else {
        value.to_string()
    }
}

/// Builds the arguments of the training entry point.
///
/// Every configured flag is emitted exactly once with its value forwarded verbatim. Optional
/// settings which are not configured are left to the training program's defaults.
pub fn training_args(settings: &Settings) -> ArgList {
    let Settings {
        federation,
        data,
        model,
        training,
        output,
        gpu,
        ..
    } = settings;

    let mut args = ArgList::new();
    args.flag("client_num_per_round", federation.worker_num.to_string())
        .flag("comm_round", federation.comm_round.to_string())
        .flag("ci", int_flag(federation.ci))
        .flag("dataset", data.dataset.to_string())
        .flag("data_file", &data.data_file)
        .flag("partition_file", &data.partition_file)
        .flag("partition_method", &data.partition_method)
        .flag("model_type", &model.model_type)
        .flag("model_name", &model.model_name)
        .flag("do_lower_case", py_bool(model.do_lower_case))
        .flag("train_batch_size", training.train_batch_size.to_string())
        .flag("eval_batch_size", training.eval_batch_size.to_string())
        .flag("max_seq_length", training.max_seq_length.to_string())
        .flag("learning_rate", float_flag(training.learning_rate))
        .flag("epochs", training.epochs.to_string())
        .flag("output_dir", &output.dir)
        .switch("fp16", training.fp16)
        .flag("gpu_mapping_file", &gpu.mapping_file)
        .flag("gpu_mapping_key", &gpu.mapping_key)
        .optional("client_num_in_total", federation.client_num_in_total)
        .optional("frequency_of_the_test", federation.frequency_of_the_test)
        .optional("is_mobile", federation.is_mobile.map(int_flag))
        .optional("weight_decay", training.weight_decay.map(float_flag))
        .optional(
            "gradient_accumulation_steps",
            training.gradient_accumulation_steps,
        )
        .optional("n_gpu", training.n_gpu)
        .optional("manual_seed", training.manual_seed);
    args
}
