//! Launching the federated averaging process group.
//!
//! A launch is a linear sequence: derive the process count, write the host file, then start
//! `mpirun` with one aggregating server and one process per worker. The launcher neither retries
//! nor validates the experiment's input files. Failures of the training program surface only
//! through the exit status of the process group.

pub mod args;
pub mod command;
pub mod host_file;

pub use self::{
    args::{training_args, ArgList},
    command::LaunchCommand,
    host_file::{local_hostname, write_host_file},
};

use std::{
    ffi::{OsStr, OsString},
    io,
    path::PathBuf,
    process::ExitStatus,
    time::Duration,
};

use thiserror::Error;
use tokio::{process::Child, signal, time};

use crate::settings::{LaunchSettings, Settings};

/// How long the process group may take to exit after being asked to terminate.
const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
/// An error raised while preparing or running a launch.
pub enum LaunchError {
    #[error("process count overflows for {0} workers")]
    ProcessCount(u32),
    #[error("failed to determine the local hostname: {0}")]
    Hostname(#[source] io::Error),
    #[error("failed to write host file {}: {source}", path.display())]
    HostFile { path: PathBuf, source: io::Error },
    #[error("failed to open log file {}: {source}", path.display())]
    LogFile { path: PathBuf, source: io::Error },
    #[error("failed to spawn {}: {source}", program.to_string_lossy())]
    Spawn { program: OsString, source: io::Error },
    #[error("failed to wait for the process group: {0}")]
    Wait(#[source] io::Error),
}

/// Returns the number of MPI processes for `worker_num` workers: one per worker plus the server.
pub fn process_count(worker_num: u32) -> Result<u32, LaunchError> {
    worker_num
        .checked_add(1)
        .ok_or(LaunchError::ProcessCount(worker_num))
}

/// Maps the status of the process group to an exit code of the launcher.
///
/// A group terminated by a signal yields `128 + signal`, like a shell does.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[derive(Debug, Clone)]
/// Launches one experiment.
pub struct Launcher {
    settings: LaunchSettings,
    process_count: u32,
    args: ArgList,
}

impl Launcher {
    /// Creates a launcher for the given settings.
    ///
    /// # Errors
    /// Fails when the process count can't be represented.
    pub fn new(settings: &Settings) -> Result<Self, LaunchError> {
        Ok(Self {
            settings: settings.launch.clone(),
            process_count: process_count(settings.federation.worker_num)?,
            args: training_args(settings),
        })
    }

    pub fn process_count(&self) -> u32 {
        self.process_count
    }

    /// The arguments forwarded to the training entry point.
    pub fn training_args(&self) -> &ArgList {
        &self.args
    }

    /// The hostname written into the host file.
    pub fn hostname(&self) -> Result<String, LaunchError> {
        match &self.settings.hostname {
            Some(hostname) => Ok(hostname.clone()),
            None => local_hostname().map_err(LaunchError::Hostname),
        }
    }

    /// Builds the `mpirun` invocation. Nothing is written.
    pub fn command(&self) -> LaunchCommand {
        let LaunchSettings {
            mpirun,
            mpirun_args,
            host_file,
            python,
            entry_point,
            log_file,
            env,
            ..
        } = &self.settings;

        let mut args: Vec<OsString> = mpirun_args.iter().map(OsString::from).collect();
        args.push("-np".into());
        args.push(self.process_count.to_string().into());
        args.push("-hostfile".into());
        args.push(host_file.into());
        args.push(python.into());
        args.push("-m".into());
        args.push(entry_point.into());
        args.extend(self.args.iter().cloned());

        LaunchCommand::new(mpirun, args, env.clone(), log_file.clone())
    }

    /// Writes the host file and returns the command to run.
    pub fn prepare(&self) -> Result<LaunchCommand, LaunchError> {
        let hostname = self.hostname()?;
        let path = &self.settings.host_file;
        write_host_file(path, &hostname).map_err(|source| LaunchError::HostFile {
            path: path.clone(),
            source,
        })?;
        debug!("wrote host file {} for host {}", path.display(), hostname);
        Ok(self.command())
    }

    /// Launches the process group and waits for it in the foreground.
    ///
    /// On Ctrl-C the group is asked to terminate and, after a grace period, killed. In every case
    /// the status of the group is returned as is.
    pub async fn run(&self) -> Result<ExitStatus, LaunchError> {
        let command = self.prepare()?;
        info!(
            "launching {} processes (1 server, {} workers)",
            self.process_count,
            self.process_count - 1
        );
        info!("{}", command);

        let mut child = command.spawn()?;
        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = signal::ctrl_c() => None,
        };
        let status = match outcome {
            Some(status) => status.map_err(LaunchError::Wait)?,
            None => {
                warn!("interrupted, terminating the process group");
                terminate(&mut child, command.program(), TERMINATION_GRACE_PERIOD).await?
            }
        };

        if status.success() {
            info!("process group finished");
        } else {
            warn!("process group exited with {}", status);
        }
        Ok(status)
    }
}

/// Asks the process group to terminate and kills it if it is still running after `grace_period`.
async fn terminate(
    child: &mut Child,
    program: &OsStr,
    grace_period: Duration,
) -> Result<ExitStatus, LaunchError> {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{kill, Signal},
            unistd::Pid,
        };

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(status) = time::timeout(grace_period, child.wait()).await
                    {
                        return status.map_err(LaunchError::Wait);
                    }
                    warn!(
                        "{} did not exit after SIGTERM, killing it",
                        program.to_string_lossy()
                    );
                }
                Err(err) => warn!("failed to send SIGTERM: {}", err),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (program, grace_period);

    child.kill().await.map_err(LaunchError::Wait)?;
    child.wait().await.map_err(LaunchError::Wait)
}
