//! simoffload - command-line front end
//!
//! Usage:
//!   simoffload servers                     # List configured servers
//!   simoffload create cluster              # Bind the current case to a new remote directory
//!   simoffload push && simoffload queue -- ./Allrun
//!   simoffload tail                        # Follow the running job
//!   simoffload pull --skip-timesteps       # Fetch results, leave time steps remote
//!   simoffload clean                       # Release everything

mod cli;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use cli::{Cli, Commands, Context};
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use simoffload::config::OffloadConfig;
use simoffload::{MountPoint, RemoteExecutionConfig, RemoteLocation};

/// Mountpoint used by `mount`, relative to the case directory
const DEFAULT_MOUNT_DIR: &str = "mnt_remote/default";

/// Install the tracing subscriber. The returned guard must live until exit.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::new(format!("simoffload={}", cli.log_level));

    match &cli.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "simoffload.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
            Ok(None)
        }
    }
}

/// Progress line on stderr, rewritten in place
fn progress_printer() -> impl FnMut(u8, &str) {
    |percent: u8, message: &str| {
        eprint!("\r\x1b[2K{percent:>3}% {message}");
        let _ = std::io::stderr().flush();
    }
}

/// Restore the binding of the case directory and apply configured settings
fn open_binding(ctx: &Context) -> Result<RemoteExecutionConfig> {
    let mut binding = RemoteExecutionConfig::open(
        &ctx.registry,
        &ctx.case_dir,
        Some(ctx.meta_file.clone()),
    )
    .wrap_err_with(|| {
        format!(
            "No usable remote location for {} (run `simoffload create` first)",
            ctx.case_dir.display()
        )
    })?;

    let location = binding.location_mut();
    location.set_environment_preamble(ctx.config.location.environment_preamble.clone());
    location.set_queue_program(ctx.config.queue.program.clone());
    if let Some(server) = location.server() {
        server.set_transfer_bandwidth_limit(ctx.config.transfer.bandwidth_limit_kbps);
    }
    Ok(binding)
}

fn handle_servers(ctx: &Context) {
    if ctx.registry.is_empty() {
        println!("No remote servers configured");
        return;
    }
    let preferred = ctx.registry.preferred_server();
    println!("  {:<20} {:<40} {}", "LABEL", "KIND", "BASE DIRECTORY");
    println!("{}", "-".repeat(80));
    for server in ctx.registry.servers() {
        let marker = if preferred
            .as_ref()
            .is_some_and(|p| p.label() == server.label())
        {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<20} {:<40} {}",
            server.label(),
            server.kind().to_string(),
            server.base_directory().display()
        );
    }
}

fn handle_create(
    ctx: &Context,
    server: Option<String>,
    remote_dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if ctx.meta_file.exists() && !force {
        tracing::warn!(path = %ctx.meta_file.display(), "Location file exists, not replacing");
        println!(
            "{} is already bound ({}); use --force to replace",
            ctx.case_dir.display(),
            ctx.meta_file.display()
        );
        return Ok(());
    }

    let server_config = match server {
        Some(label) => ctx.registry.find_server(&label)?,
        None => ctx
            .registry
            .preferred_server()
            .ok_or_else(|| eyre!("No server given and no preferred server configured"))?,
    };

    let mut location = RemoteLocation::new(server_config, remote_dir);
    location.set_temp_dir_template(ctx.config.location.temp_dir_template.clone());
    location.initialize()?;

    let binding = RemoteExecutionConfig::new(location, &ctx.case_dir, Some(ctx.meta_file.clone()))?;
    let location = binding.location();
    println!(
        "{}:{}",
        location.server_label(),
        location
            .remote_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_default()
    );
    Ok(())
}

fn handle_mount(ctx: &Context, binding: &RemoteExecutionConfig, keep: bool) -> Result<()> {
    let location = binding.location();
    location.assert_active()?;
    let (Some(server), Some(remote_dir)) = (location.server(), location.remote_dir()) else {
        bail!("Remote location is not active");
    };

    let mountpoint = ctx.case_dir.join(DEFAULT_MOUNT_DIR);
    let mount = MountPoint::new(&mountpoint, server.as_ref(), remote_dir, keep, false)?;
    println!("{}", mount.mountpoint().display());

    if !keep {
        eprintln!("Press Enter to unmount");
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            return Ok(());
        }
        Commands::ExampleConfig => {
            print!("{}", OffloadConfig::example());
            return Ok(());
        }
        _ => {}
    }

    // Initialize error handling
    color_eyre::install()?;
    let _guard = init_logging(&cli)?;

    tracing::debug!("Starting simoffload v{}", env!("CARGO_PKG_VERSION"));
    let ctx = Context::new(&cli)?;

    match cli.command {
        Commands::Servers => handle_servers(&ctx),
        Commands::Create {
            server,
            remote_dir,
            force,
        } => handle_create(&ctx, server, remote_dir, force)?,
        Commands::Ls => {
            for entry in open_binding(&ctx)?.location().remote_ls()? {
                println!("{}", entry.display());
            }
        }
        Commands::Subdirs => {
            for entry in open_binding(&ctx)?.location().remote_subdirs()? {
                println!("{}", entry.display());
            }
        }
        Commands::Push { exclude } => {
            let mut progress = progress_printer();
            open_binding(&ctx)?.sync_to_remote(&exclude, Some(&mut progress))?;
            eprintln!();
        }
        Commands::Pull {
            skip_timesteps,
            exclude,
        } => {
            let mut progress = progress_printer();
            open_binding(&ctx)?.sync_to_local(skip_timesteps, &exclude, Some(&mut progress))?;
            eprintln!();
        }
        Commands::Queue { immediate, command } => {
            open_binding(&ctx)?
                .location()
                .queue_remote_command(&command.join(" "), !immediate)?;
        }
        Commands::Wait => open_binding(&ctx)?.location().wait_remote_queue_finished()?,
        Commands::WaitLast => open_binding(&ctx)?.location().wait_last_command_finished()?,
        Commands::Cancel => open_binding(&ctx)?.location().cancel_remote_commands()?,
        Commands::Jobs { json } => {
            let jobs = open_binding(&ctx)?.location().with_queue(|q| q.jobs())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("Queue is empty");
            } else {
                println!("{:<6} {:<10} {:<6} {}", "ID", "STATE", "EXIT", "COMMAND");
                for job in jobs.iter() {
                    println!(
                        "{:<6} {:<10} {:<6} {}",
                        job.id,
                        format!("{:?}", job.state).to_lowercase(),
                        job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                        job.command_line
                    );
                }
            }
        }
        Commands::Tail => {
            open_binding(&ctx)?.location().with_queue(|q| {
                q.start_tail(Box::new(|line: &str| println!("{line}")), true)
            })?;
        }
        Commands::Exec { command } => {
            let code = open_binding(&ctx)?
                .location()
                .exec_remote_cmd(&command.join(" "), false)?;
            if code != 0 {
                bail!("Remote command exited with code {code}");
            }
        }
        Commands::Mount { keep } => {
            let binding = open_binding(&ctx)?;
            handle_mount(&ctx, &binding, keep)?;
        }
        Commands::Clean { force } => {
            open_binding(&ctx)?.cleanup(force)?;
            println!("Released remote location of {}", ctx.case_dir.display());
        }
        Commands::Completions { .. } | Commands::ExampleConfig => {}
    }

    Ok(())
}
