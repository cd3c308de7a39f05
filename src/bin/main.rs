use std::{path::PathBuf, process};

use fedavg_launcher::{
    launcher::{exit_code, Launcher},
    preflight,
    settings::Settings,
};
use structopt::StructOpt;
use tracing_subscriber::FmtSubscriber;

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedavg-launcher")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    /// Print the command without writing the host file or launching anything
    #[structopt(long)]
    dry_run: bool,

    /// Check the data files and the GPU mapping first and abort on problems
    #[structopt(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let launcher = Launcher::new(&settings);
    let problems = match &launcher {
        Ok(launcher) if opt.check => preflight::check(&settings, launcher.process_count()),
        _ => Vec::new(),
    };
    let Settings {
        log: log_settings, ..
    } = settings;

    FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let launcher = launcher.unwrap_or_else(|err| {
        error!("{}", err);
        process::exit(1);
    });

    if opt.check {
        if !problems.is_empty() {
            for problem in &problems {
                error!("{}", problem);
            }
            process::exit(1);
        }
        info!("preflight checks passed");
    }

    if opt.dry_run {
        println!("{}", launcher.command());
        return;
    }

    match launcher.run().await {
        Ok(status) => process::exit(exit_code(status)),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
