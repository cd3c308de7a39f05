//! Optional consistency checks of an experiment before it is launched.
//!
//! The launch itself never runs these checks. They catch the mistakes that would otherwise only
//! show up as a crash of the training program, after the whole process group has started.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::settings::Settings;

/// The GPU mapping file: mapping key, then host, then the number of processes on each GPU.
pub type GpuMappings = BTreeMap<String, BTreeMap<String, Vec<u32>>>;

#[derive(Error, Debug)]
/// A problem found by the checks.
pub enum Problem {
    #[error("{kind} {} does not exist", path.display())]
    MissingFile { kind: &'static str, path: PathBuf },
    #[error("failed to read GPU mapping file {}: {source}", path.display())]
    UnreadableGpuMapping { path: PathBuf, source: io::Error },
    #[error("invalid GPU mapping file {}: {source}", path.display())]
    InvalidGpuMapping {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("GPU mapping key `{key}` not found in {}", path.display())]
    MissingGpuMappingKey { key: String, path: PathBuf },
    #[error("GPU mapping `{key}` places {slots} processes but {expected} are launched")]
    GpuSlotMismatch {
        key: String,
        slots: u64,
        expected: u32,
    },
}

/// Checks the experiment's input files and its GPU mapping against `process_count`.
///
/// All problems are returned, not only the first one.
pub fn check(settings: &Settings, process_count: u32) -> Vec<Problem> {
    let mut problems = Vec::new();

    for (kind, path) in &[
        ("data file", &settings.data.data_file),
        ("partition file", &settings.data.partition_file),
        ("GPU mapping file", &settings.gpu.mapping_file),
    ] {
        if !path.is_file() {
            problems.push(Problem::MissingFile {
                kind: *kind,
                path: path.to_path_buf(),
            });
        }
    }

    let mapping_file = &settings.gpu.mapping_file;
    if mapping_file.is_file() {
        if let Err(problem) = check_gpu_mapping(
            mapping_file,
            &settings.gpu.mapping_key,
            process_count,
        ) {
            problems.push(problem);
        }
    }

    problems
}

/// Reads a GPU mapping file.
pub fn read_gpu_mappings(path: &Path) -> Result<GpuMappings, Problem> {
    let content = fs::read_to_string(path).map_err(|source| Problem::UnreadableGpuMapping {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| Problem::InvalidGpuMapping {
        path: path.to_path_buf(),
        source,
    })
}

/// Counts the process slots of all hosts in a mapping.
pub fn slot_count(hosts: &BTreeMap<String, Vec<u32>>) -> u64 {
    hosts
        .values()
        .flatten()
        .map(|&processes| u64::from(processes))
        .sum()
}

/// Checks that the mapping `key` exists and places exactly `process_count` processes.
pub fn check_gpu_mapping(path: &Path, key: &str, process_count: u32) -> Result<(), Problem> {
    let mappings = read_gpu_mappings(path)?;
    let hosts = mappings
        .get(key)
        .ok_or_else(|| Problem::MissingGpuMappingKey {
            key: key.to_string(),
            path: path.to_path_buf(),
        })?;

    let slots = slot_count(hosts);
    if slots == u64::from(process_count) {
        debug!("GPU mapping `{}` places {} processes", key, slots);
        Ok(())
    } else {
        Err(Problem::GpuSlotMismatch {
            key: key.to_string(),
            slots,
            expected: process_count,
        })
    }
}
