//! CLI argument parsing and runtime context
//!
//! Uses clap for argument parsing with derive macros.
//! Provides a Context struct for runtime configuration.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

use simoffload::config::OffloadConfig;
use simoffload::registry::ServerRegistry;

/// Offload simulation cases to remote backends: bind, sync, queue, follow
#[derive(Parser, Debug)]
#[command(name = "simoffload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Case directory
    #[arg(
        short = 'd',
        long,
        env = "SIMOFFLOAD_CASE_DIR",
        default_value = ".",
        global = true
    )]
    pub case_dir: PathBuf,

    /// Location file inside the case directory (default from config: meta.foam)
    #[arg(short = 'm', long, global = true)]
    pub meta_file: Option<PathBuf>,

    /// Server registry file (default: global and per-user registries)
    #[arg(short = 'r', long, env = "SIMOFFLOAD_REGISTRY", global = true)]
    pub registry: Option<PathBuf>,

    /// Configuration file (default: ~/.config/simoffload/config.toml)
    #[arg(short = 'c', long, env = "SIMOFFLOAD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG", default_value = "warn", global = true)]
    pub log_level: String,

    /// Write logs to daily-rotated files in this directory instead of stderr
    #[arg(long, env = "SIMOFFLOAD_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List configured remote servers
    Servers,

    /// Bind the case directory to a new remote location
    Create {
        /// Server label (default: preferred server)
        server: Option<String>,

        /// Remote directory, absolute or relative to the server's base directory
        /// (default: fresh temporary directory)
        #[arg(long)]
        remote_dir: Option<PathBuf>,

        /// Replace an existing binding
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// List the remote directory
    Ls,

    /// List subdirectories of the remote directory
    Subdirs,

    /// Mirror the case directory to the remote location
    Push {
        /// Additional rsync exclude pattern (repeatable)
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
    },

    /// Copy results back from the remote location
    Pull {
        /// Leave numbered time step directories on the remote side
        #[arg(short = 's', long, default_value_t = false)]
        skip_timesteps: bool,

        /// Additional rsync exclude pattern (repeatable)
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
    },

    /// Enqueue a command on the remote queue
    Queue {
        /// Start without waiting for the previously queued command
        #[arg(short = 'i', long, default_value_t = false)]
        immediate: bool,

        /// Command line to run in the remote directory
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Wait until the remote queue has drained
    Wait,

    /// Wait until the last queued command has finished
    WaitLast,

    /// Cancel all queued commands and stop the queue daemon
    Cancel,

    /// Show the remote queue
    Jobs {
        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Follow the output of the running job until it ends
    Tail,

    /// Run a command in the remote directory
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Mount the remote directory at <case>/mnt_remote/default
    Mount {
        /// Leave the mount in place on exit
        #[arg(long, default_value_t = false)]
        keep: bool,
    },

    /// Cancel queued commands, release the remote location and remove the binding
    Clean {
        /// Delete the remote directory even if it is not temporary
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Print an example configuration file
    ExampleConfig,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "simoffload", &mut io::stdout());
}

/// Runtime context derived from CLI arguments and the configuration file
#[derive(Debug)]
pub struct Context {
    /// Case directory
    pub case_dir: PathBuf,
    /// Location file path
    pub meta_file: PathBuf,
    /// Application settings
    pub config: OffloadConfig,
    /// Known servers
    pub registry: ServerRegistry,
}

impl Context {
    pub fn new(cli: &Cli) -> simoffload::Result<Self> {
        let config = cli
            .config
            .clone()
            .map_or_else(OffloadConfig::load, OffloadConfig::load_from_path);

        let registry = match &cli.registry {
            Some(path) => ServerRegistry::load(path)?,
            None => ServerRegistry::load_layered(&config.registry.search_paths())?,
        };

        let meta_file = cli
            .meta_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.location.config_file_name));
        let meta_file = if meta_file.is_absolute() {
            meta_file
        } else {
            cli.case_dir.join(meta_file)
        };

        Ok(Self {
            case_dir: cli.case_dir.clone(),
            meta_file,
            config,
            registry,
        })
    }
}
