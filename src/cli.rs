use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "pocketrig",
    version,
    about = "Supervise ComfyUI, its Mini companion and Smart Gallery from a phone-friendly control API"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Read settings from this env file instead of `pocketrig.env` next to the binary
    #[arg(short = 'f', long = "env-file", global = true)]
    pub env_file: Option<PathBuf>,

    /// Run without a console window (set by the hidden relaunch)
    #[arg(long, global = true)]
    pub hidden: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Launch the supervised processes and serve the control API (default)
    Serve(ServeArgs),
    /// Terminate whatever listens on the three configured ports
    Stop,
    /// Show which configured ports are in use and by whom
    Ps,
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Serve the control API without launching anything (same as PC_SKIP_LAUNCH=1)
    #[arg(long)]
    pub skip_launch: bool,

    /// Seconds to wait before starting (overrides PC_START_DELAY)
    #[arg(long)]
    pub start_delay: Option<u64>,

    /// Control API port (overrides CONTROL_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,
}
