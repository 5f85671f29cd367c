use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Project a merged, writable mod view over a game's data directory")]
pub struct Args {
    #[arg(long, global = true, help = "Path to the mount profile (TOML)")]
    pub profile: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount the merged view and serve it until interrupted")]
    Mount,

    #[command(about = "Print the merged view with the winning origin per file")]
    Tree,

    #[command(about = "Fold staged writes into the overwrite directory")]
    Flush,

    #[command(about = "Recover a stale mount left behind by a crash")]
    Cleanup {
        #[arg(help = "Mount point to recover (defaults to the profile's data directory)")]
        path: Option<PathBuf>,
    },

    #[command(about = "Show the active mount profile")]
    Profile,
}
