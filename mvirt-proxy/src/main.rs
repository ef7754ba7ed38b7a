//! mvirt-proxy - Runs a containerised program in place of its binary.
//!
//! Invoked through a symlink named after a program, the whole command line
//! belongs to that program and settings come from `MVIRT_PROXY_*` variables.
//! Invoked as `mvirt-proxy`, it takes its own flags and subcommands.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use mvirt_proxy::{Config, cleanup, exit_code, run};
use nix::sys::prctl;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PROXY_NAME: &str = "mvirt-proxy";

/// Runs a containerised program in place of its binary.
#[derive(Parser)]
#[command(name = "mvirt-proxy")]
#[command(version = VERSION)]
#[command(about = "Runs a containerised program in place of its binary")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run container ID as if invoked under its name
    Run {
        /// Container id
        id: String,

        /// Arguments passed on to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Kill and remove a task left behind by a crashed supervisor
    Cleanup {
        /// Container id
        id: String,
    },
}

#[derive(Args, Debug)]
struct Settings {
    /// Directory with per-container configurations
    #[arg(long, env = "MVIRT_PROXY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory for container records and images
    #[arg(long, env = "MVIRT_PROXY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Path to youki binary
    #[arg(long, env = "MVIRT_PROXY_YOUKI")]
    youki: Option<PathBuf>,

    /// Root directory for youki container state
    #[arg(long, env = "MVIRT_PROXY_YOUKI_ROOT")]
    youki_root: Option<PathBuf>,
}

/// Settings of a symlinked invocation, read from the environment only.
#[derive(Parser)]
#[command(name = "mvirt-proxy")]
struct EnvSettings {
    /// Container id (default: name this binary was invoked as)
    #[arg(long, env = "MVIRT_PROXY_ID")]
    id: Option<String>,

    #[command(flatten)]
    settings: Settings,
}

enum Invocation {
    /// Invoked under the name of a program.
    Program {
        id: String,
        program: String,
        args: Vec<String>,
        settings: Settings,
    },
    /// Invoked as mvirt-proxy itself.
    Proxy(Cli),
}

impl Invocation {
    fn parse<I, T>(argv: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let arg0 = argv.next().unwrap_or_else(|| PROXY_NAME.into());
        let program = basename(&arg0);

        if program == PROXY_NAME {
            return Cli::try_parse_from(std::iter::once(arg0).chain(argv)).map(Self::Proxy);
        }

        let env = EnvSettings::try_parse_from([PROXY_NAME])?;
        Ok(Self::Program {
            id: env.id.unwrap_or_else(|| program.clone()),
            program,
            args: argv.map(|arg| arg.to_string_lossy().into_owned()).collect(),
            settings: env.settings,
        })
    }
}

fn main() -> ExitCode {
    // Quiet unless asked, the proxy shares stderr with the program.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let invocation = match Invocation::parse(std::env::args_os()) {
        Ok(invocation) => invocation,
        Err(e) => e.exit(),
    };

    match execute(invocation) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("mvirt-proxy: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn execute(invocation: Invocation) -> Result<u8> {
    match invocation {
        Invocation::Program {
            id,
            program,
            args,
            settings,
        } => supervise(&setup(&settings), &id, &program, &args),
        Invocation::Proxy(Cli { settings, command }) => {
            let config = setup(&settings);
            match command {
                Command::Run { id, args } => supervise(&config, &id, &id, &args),
                Command::Cleanup { id } => {
                    if block_on(cleanup(&config, &id))?? {
                        info!("Removed leftover task of {}", id);
                    }
                    Ok(0)
                }
            }
        }
    }
}

fn supervise(config: &Config, id: &str, program: &str, args: &[String]) -> Result<u8> {
    // Container init processes are reparented to us so their exit can be
    // waited for.
    prctl::set_child_subreaper(true).context("Failed to set as child subreaper")?;

    debug!("Running {} as {} with {:?}", id, program, config);
    let result = block_on(run(config, id, program, args))?;
    let code = exit_code(&result);
    result?;
    Ok(code)
}

/// Run `future` to completion on a fresh runtime.
///
/// The runtime is not waited for on the way out: a reaper thread stays in
/// `waitpid` for as long as the task process lives.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

fn setup(settings: &Settings) -> Config {
    let mut config = Config::default();
    if let Some(dir) = &settings.config_dir {
        config.config_dir = dir.clone();
    }
    if let Some(dir) = &settings.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(path) = &settings.youki {
        config.youki_path = path.clone();
    }
    if let Some(root) = &settings.youki_root {
        config.youki_root = root.clone();
    }
    config
}

fn basename(arg0: &OsString) -> String {
    Path::new(arg0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| PROXY_NAME.to_string())
}
