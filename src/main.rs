use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod cli;
mod config;
mod error;
mod mount;
mod vfs;

use cli::{Args, Commands};
use config::{default_profile_path, load_profile, MountProfile};
use mount::MountController;
use vfs::{compose_tree, scan_data_dir, OverwriteManager};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> error::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("STRATA_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let profile_path = args.profile.as_deref();

    match args.command {
        Commands::Mount => serve(profile_path),
        Commands::Tree => print_tree(profile_path),
        Commands::Flush => flush(profile_path),
        Commands::Cleanup { path } => cleanup(profile_path, path.as_deref()),
        Commands::Profile => show_profile(profile_path),
    }
}

/// Mount the projection and serve it until SIGINT/SIGTERM.
fn serve(profile_path: Option<&Path>) -> error::Result<i32> {
    let profile = load_profile(profile_path)?;

    let mut controller = MountController::new();
    controller.mount(
        &profile.game_dir,
        &profile.data_dir_name,
        &profile.overwrite_dir,
        profile.mods(),
    )?;

    println!(
        "Serving merged view over {} ({} mod layer(s)). Press Ctrl-C to unmount.",
        controller.data_dir().display(),
        profile.mods.len()
    );

    // SAFETY: the handler only stores into an atomic flag.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown));
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    controller.unmount();
    println!("Unmounted. Staged writes folded into the overwrite directory.");
    Ok(0)
}

/// Compose the merged view without mounting and print it with origins.
fn print_tree(profile_path: Option<&Path>) -> error::Result<i32> {
    let profile = load_profile(profile_path)?;
    let data_dir = profile.data_dir();

    let base = scan_data_dir(&data_dir)?;
    let tree = compose_tree(&base, &profile.overwrite_dir, &profile.mods());

    println!(
        "{} files, {} directories:",
        tree.file_count, tree.dir_count
    );
    for row in tree.flatten() {
        let indent = "  ".repeat(row.depth as usize);
        if row.is_directory {
            println!("{}{}/", indent, last_component(&row.virtual_path));
        } else {
            println!(
                "{}{}  [{}, {} bytes]",
                indent,
                last_component(&row.virtual_path),
                row.origin,
                row.size
            );
        }
    }
    Ok(0)
}

fn last_component(virtual_path: &str) -> &str {
    virtual_path.rsplit('/').next().unwrap_or(virtual_path)
}

/// Fold leftover staged writes into overwrite. Useful after a crash, when
/// the in-process fold on unmount never ran.
fn flush(profile_path: Option<&Path>) -> error::Result<i32> {
    let profile = load_profile(profile_path)?;
    let staging_dir = profile
        .overwrite_dir
        .parent()
        .unwrap_or(&profile.overwrite_dir)
        .join("VFS_staging");

    let manager = OverwriteManager::new(staging_dir, profile.overwrite_dir.clone());
    let moved = manager.flush_staging();
    println!("Folded {} staged file(s) into the overwrite directory.", moved);
    Ok(0)
}

fn cleanup(profile_path: Option<&Path>, target: Option<&Path>) -> error::Result<i32> {
    let target = match target {
        Some(path) => path.to_path_buf(),
        None => load_profile(profile_path)?.data_dir(),
    };

    if !mount::is_mount_point(&target) {
        println!("No mount at {}.", target.display());
        return Ok(0);
    }
    if mount::try_cleanup_stale_mount(&target) {
        println!("Recovered stale mount at {}.", target.display());
        Ok(0)
    } else {
        eprintln!("Could not recover mount at {}.", target.display());
        Ok(1)
    }
}

fn show_profile(profile_path: Option<&Path>) -> error::Result<i32> {
    let path = profile_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_profile_path);
    let profile: MountProfile = load_profile(profile_path)?;

    println!("Profile: {}", path.display());
    println!("  game_dir:      {}", profile.game_dir.display());
    println!("  data dir:      {}", profile.data_dir().display());
    println!("  overwrite_dir: {}", profile.overwrite_dir.display());
    println!("  mods ({}):", profile.mods.len());
    for m in &profile.mods {
        println!("    {} -> {}", m.name, m.path.display());
    }
    Ok(0)
}
