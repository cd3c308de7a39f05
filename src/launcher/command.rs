//! The resolved `mpirun` invocation and how it is spawned.

use std::{
    ffi::{OsStr, OsString},
    fmt,
    fs::File,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};

use super::LaunchError;
use crate::settings::EnvVar;

/// A fully resolved invocation of the MPI launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<EnvVar>,
    log_file: Option<PathBuf>,
}

impl LaunchCommand {
    pub(crate) fn new(
        program: impl Into<OsString>,
        args: Vec<OsString>,
        envs: Vec<EnvVar>,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            envs,
            log_file,
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn envs(&self) -> &[EnvVar] {
        &self.envs
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Starts the process group.
    ///
    /// Standard input and output are inherited. Standard error goes to the log file if one is
    /// configured, which is truncated first.
    pub fn spawn(&self) -> Result<Child, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|var| (&var.name, &var.value)));

        if let Some(path) = &self.log_file {
            let file = File::create(path).map_err(|source| LaunchError::LogFile {
                path: path.clone(),
                source,
            })?;
            command.stderr(Stdio::from(file));
        }

        command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })
    }
}

fn quote(arg: &OsStr) -> String {
    let arg = arg.to_string_lossy();
    match shlex::try_quote(&arg) {
        Ok(quoted) => quoted.into_owned(),
        Err(_) => format!("{:?}", arg),
    }
}

impl fmt::Display for LaunchCommand {
    /// Renders the command as a shell command line.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for var in &self.envs {
            write!(f, "{}={} ", var.name, quote(OsStr::new(&var.value)))?;
        }
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        if let Some(path) = &self.log_file {
            write!(f, " 2> {}", quote(path.as_os_str()))?;
        }
        Ok(())
    }
}
