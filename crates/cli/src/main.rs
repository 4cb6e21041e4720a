mod manifest_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: inspect and validate dispatch manifests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Manifest to read. Defaults to `manifest.path` from the config file.
    #[arg(long, global = true, env = "SWITCHYARD_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the manifest, then print a summary.
    Check,
    /// Print HTTP routes in resolution order.
    Routes {
        /// Emit JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print scheduled jobs with their timeouts and upcoming firings.
    Schedules {
        /// How many upcoming firings to list per job.
        #[arg(long, default_value_t = 3)]
        next: usize,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let path = cli
        .manifest
        .clone()
        .unwrap_or_else(|| switchyard_config::discover_and_load().manifest.path);
    info!(version = env!("CARGO_PKG_VERSION"), manifest = %path.display(), "switchyard");
    let manifest = manifest_commands::load(&path)?;

    let output = match cli.command {
        Commands::Check => manifest_commands::check(&manifest),
        Commands::Routes { json } => manifest_commands::routes(&manifest, json)?,
        Commands::Schedules { next } => manifest_commands::schedules(&manifest, next),
    };
    print!("{output}");
    Ok(())
}
