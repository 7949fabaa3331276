use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use manifest_versions::Result;
use manifest_versions::lkgm::{CandidateOptions, LkgmManager};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a builder config TOML
    #[arg(long, global = true, default_value = "mver.toml")]
    config: PathBuf,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and publish the next candidate spec
    Candidate {
        /// Android version to annotate into the candidate manifest
        #[arg(long)]
        android_version: Option<String>,
        /// Chrome version to annotate into the candidate manifest
        #[arg(long)]
        chrome_version: Option<String>,
        /// CI build id recorded in the publish commit
        #[arg(long)]
        build_id: Option<u64>,
        /// Promote the candidate to LKGM immediately after publishing
        #[arg(long)]
        promote: bool,
    },
    /// Promote a published candidate to LKGM
    Promote {
        /// Candidate version to promote; defaults to the newest published
        /// candidate in the current version family
        #[arg(long)]
        version: Option<String>,
    },
    /// Show what the LKGM pointer currently names
    Latest,
    /// List published candidates in this builder's bucket
    Specs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = manifest_versions::config::load(&args.config)?;
    let mut manager = LkgmManager::from_config(&cfg);

    match args.cmd {
        Command::Candidate {
            android_version,
            chrome_version,
            build_id,
            promote,
        } => cmd_candidate(
            &mut manager,
            CandidateOptions {
                android_version,
                chrome_version,
                build_id,
            },
            promote,
        ),
        Command::Promote { version } => cmd_promote(&mut manager, version),
        Command::Latest => cmd_latest(&mut manager),
        Command::Specs => cmd_specs(&mut manager),
    }
}

fn cmd_candidate(
    manager: &mut LkgmManager,
    opts: CandidateOptions,
    promote: bool,
) -> Result<()> {
    let Some(candidate) = manager.create_new_candidate(opts)? else {
        println!("nothing to build: checkout already published");
        return Ok(());
    };
    let local = candidate.local_path(manager.publisher().store().root());
    println!("{} {}", candidate.version, local.display());
    if promote {
        manager.promote_candidate()?;
        println!("promoted {} to LKGM", candidate.version);
    }
    Ok(())
}

fn cmd_promote(manager: &mut LkgmManager, version: Option<String>) -> Result<()> {
    let candidate = match version {
        Some(v) => manager.bootstrap_from_version(&v)?,
        None => manager.bootstrap_latest()?,
    };
    manager.promote_candidate()?;
    println!("promoted {} to LKGM", candidate.version);
    Ok(())
}

fn cmd_latest(manager: &mut LkgmManager) -> Result<()> {
    manager.publisher_mut().refresh()?;
    match manager.latest_candidate()? {
        Some(pointer) => {
            println!("{} {}", pointer.version, pointer.rel_path);
            if let Some(v) = pointer.android_version {
                println!("android: {v}");
            }
            if let Some(v) = pointer.chrome_version {
                println!("chrome: {v}");
            }
        }
        None => println!("no LKGM pointer published"),
    }
    Ok(())
}

fn cmd_specs(manager: &mut LkgmManager) -> Result<()> {
    let publisher = manager.publisher_mut();
    publisher.refresh()?;
    let version_info = publisher.current_version_info()?;
    let scan = publisher.scan(version_info)?;
    let mut versions = scan.published;
    versions.sort();
    for v in &versions {
        println!("{v}");
    }
    if let Some(latest) = scan.latest {
        println!("latest: {latest}");
    }
    Ok(())
}
