use clap::Parser;
use pocketrig::cli::{Cli, Commands};
use pocketrig::commands;
use pocketrig::relaunch::RunMode;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let env_file = cli.global.env_file.as_deref();
    let mode = if cli.global.hidden {
        RunMode::Hidden
    } else {
        RunMode::Visible
    };

    let result = match cli.command {
        None => commands::serve::run(env_file, mode, Default::default()).await,
        Some(Commands::Serve(args)) => commands::serve::run(env_file, mode, args).await,
        Some(Commands::Stop) => commands::stop::run(env_file).await,
        Some(Commands::Ps) => commands::ps::run(env_file).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
