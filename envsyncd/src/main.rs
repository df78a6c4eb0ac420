use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use caps::{CapSet, Capability};
use clap::Parser;
use log::{info, warn};
use serde_json::json;
use tokio::signal::unix::{Signal, SignalKind, signal};

use envsyncd::{Config, ConfMapSync, DetectionResult, HostProbe, PinnedMapOpener};

/// Exit status when the map was left without a fresh record.
const EXIT_DEGRADED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "envsyncd")]
#[command(about = "Publish the host cgroup environment into the BPF conf map")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// bpffs directory holding the pinned conf map
    #[arg(long, value_name = "DIR")]
    map_dir: Option<PathBuf>,
    /// Namespace pid reported with the published record (defaults to our own)
    #[arg(long)]
    nspid: Option<u32>,
    /// Detect and print the environment as JSON without touching the map
    #[arg(long)]
    probe_only: bool,
    /// Stay resident and resync on SIGHUP
    #[arg(long)]
    watch: bool,
}

fn check_capabilities() {
    if std::env::var("ENVSYNC_SKIP_CAP_CHECK").is_ok() {
        warn!("Skipping capability check (ENVSYNC_SKIP_CAP_CHECK set)");
        return;
    }

    let has = |cap| caps::has_cap(None, CapSet::Effective, cap);
    match (has(Capability::CAP_BPF), has(Capability::CAP_SYS_ADMIN)) {
        (Ok(true), _) | (_, Ok(true)) => {}
        (Err(e), _) | (_, Err(e)) => warn!("[envsyncd] failed to query capabilities: {e}"),
        _ => warn!(
            "[envsyncd] neither CAP_BPF nor CAP_SYS_ADMIN is effective; opening pinned maps will likely fail"
        ),
    }
}

fn probe_only(config: &Config) -> anyhow::Result<String> {
    let sync = ConfMapSync::new(
        log::logger(),
        HostProbe::from_config(&config.cgroup),
        PinnedMapOpener,
    )
    .with_map_name(config.map.name.clone());

    let detected = sync.detect()?;
    let out = detection_report(&sync.map_path(&config.map.dir), &detected);
    Ok(serde_json::to_string_pretty(&out)?)
}

fn detection_report(map_path: &Path, detected: &DetectionResult) -> serde_json::Value {
    json!({
        "map_path": map_path,
        "detected": detected,
        "fs_magic": format!("{:#x}", detected.magic.magic()),
        "value": detected.conf_value(),
    })
}

/// SIGHUP and SIGTERM streams for watch mode. Installed before the first sync
/// so a SIGHUP sent while it runs is queued instead of killing the process.
fn resync_signals() -> anyhow::Result<(Signal, Signal)> {
    let sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    Ok((sighup, sigterm))
}

async fn sync_once(config: Arc<Config>, nspid: u32) -> anyhow::Result<ExitCode> {
    let outcome = tokio::task::spawn_blocking(move || {
        ConfMapSync::new(
            log::logger(),
            HostProbe::from_config(&config.cgroup),
            PinnedMapOpener,
        )
        .with_retry(config.map.retry_policy())
        .with_map_name(config.map.name.clone())
        .run(&config.map.dir, nspid)
    })
    .await
    .context("conf map sync task failed")?;

    Ok(match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            warn!("[envsyncd] {err}; continuing without advanced cgroup tracking");
            ExitCode::from(EXIT_DEGRADED)
        }
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = args.map_dir {
        config.map.dir = dir;
    }
    if args.watch {
        config.runtime.resync_on_sighup = true;
    }
    let nspid = args.nspid.unwrap_or_else(std::process::id);

    if args.probe_only {
        return match tokio::task::spawn_blocking(move || probe_only(&config))
            .await
            .context("detection task failed")?
        {
            Ok(json) => {
                println!("{json}");
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                warn!("[envsyncd] {err:#}");
                Ok(ExitCode::from(EXIT_DEGRADED))
            }
        };
    }

    check_capabilities();

    let config = Arc::new(config);
    let signals = if config.runtime.resync_on_sighup {
        Some(resync_signals()?)
    } else {
        None
    };

    info!(
        "[envsyncd] syncing {} (nspid {nspid}, waiting up to {:?} for the map)",
        config.map.dir.join(&config.map.name).display(),
        config.map.retry_policy().max_blocking()
    );
    let mut status = sync_once(Arc::clone(&config), nspid).await?;
    let Some((mut sighup, mut sigterm)) = signals else {
        return Ok(status);
    };

    info!("[envsyncd] watching for SIGHUP");
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("[envsyncd] SIGHUP received, resyncing");
                status = sync_once(Arc::clone(&config), nspid).await?;
            }
            _ = sigterm.recv() => break,
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                break;
            }
        }
    }
    info!("[envsyncd] shutting down");
    Ok(status)
}
