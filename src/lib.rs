//! # fedavg-launcher
//!
//! Launches a federated averaging NLP experiment on an MPI process group: one aggregating server
//! and one process per worker, all running the external training program.
//!
//! The experiment is described by a configuration file (see [`settings`]). A launch derives the
//! process count, writes the host file and starts `mpirun` in the foreground (see [`launcher`]).
//! The training itself, including aggregation and all communication between the processes, is
//! left to the training program and the MPI runtime.

#[macro_use]
extern crate tracing;

pub mod launcher;
pub mod preflight;
pub mod settings;
