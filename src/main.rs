//! tablo-proxy: HDHomeRun-compatible gateway for a network TV receiver.
//!
//! Presents the receiver's lineup to Plex as a local HDHomeRun tuner,
//! admitting at most as many concurrent streams as the receiver has
//! physical tuners.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

mod device;
mod directory;
mod logging;
mod scheduler;
mod session;
mod tuner;
mod web;

use device::{DeviceClient, DeviceConfig};
use directory::ChannelDirectory;
use scheduler::PersistentScheduler;
use session::{SessionConfig, SessionManager};
use tuner::TunerPool;
use web::state::{DeviceIdentity, GatewayState};

const DEFAULT_LINEUP_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_GUIDE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// tablo-proxy - HDHomeRun-compatible gateway for a network TV receiver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Base URL of the receiver's API
    #[arg(short, long)]
    device_url: Option<String>,

    /// Bearer token for the receiver's account service
    #[arg(short, long)]
    token: Option<String>,

    /// Tuner capacity override (defaults to what the receiver reports)
    #[arg(long)]
    tuners: Option<u32>,

    /// Externally reachable base URL advertised to Plex
    #[arg(long)]
    advertise_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory where schedule files and the guide cache are stored
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Run the lineup and guide refreshes once, then exit
    #[arg(long)]
    refresh: bool,

    /// Disable the recurring guide refresh
    #[arg(long)]
    no_guide: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    gateway: GatewaySection,
    #[serde(default)]
    device: DeviceSection,
    #[serde(default)]
    refresh: RefreshSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct GatewaySection {
    listen: Option<String>,
    advertise_url: Option<String>,
    friendly_name: Option<String>,
    device_id: Option<String>,
    data_dir: Option<String>,
    ffmpeg_path: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DeviceSection {
    url: Option<String>,
    token: Option<String>,
    tuners: Option<u32>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RefreshSection {
    lineup_interval_hours: Option<u64>,
    guide_interval_hours: Option<u64>,
    guide_enabled: Option<bool>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("tablo-proxy.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Merge logging configs (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    let log_level = file_config.logging.level.clone();
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        log_level.as_deref(),
    )?;

    // Merge the rest (command line takes precedence)
    let listen_addr = match file_config.gateway.listen {
        Some(ref addr) if args.listen.to_string() == "0.0.0.0:8080" => addr.parse()?,
        _ => args.listen,
    };
    let device_url = args
        .device_url
        .or(file_config.device.url)
        .ok_or("receiver URL required (--device-url or [device] url)")?;
    let token = args
        .token
        .or(file_config.device.token)
        .ok_or("receiver token required (--token or [device] token)")?;
    let data_dir = if args.data_dir.to_string_lossy() != "data" {
        args.data_dir.clone()
    } else {
        PathBuf::from(file_config.gateway.data_dir.as_deref().unwrap_or("data"))
    };
    std::fs::create_dir_all(&data_dir)?;

    let device = Arc::new(DeviceClient::new(DeviceConfig {
        base_url: device_url,
        token,
        request_timeout: Duration::from_secs(
            file_config.device.request_timeout_secs.unwrap_or(30),
        ),
    })?);

    // Tuner capacity: override > receiver-reported. No capacity is fatal;
    // running unbounded would let Plex oversubscribe the receiver.
    let capacity = match args.tuners.or(file_config.device.tuners) {
        Some(n) => n,
        None => match device.tuner_count().await {
            Ok(n) => {
                info!("Receiver reports {} tuners", n);
                n
            }
            Err(e) => {
                error!("Could not determine tuner count: {}", e);
                return Err("tuner capacity unknown; set --tuners or [device] tuners".into());
            }
        },
    };

    let directory = Arc::new(ChannelDirectory::new());
    let tuner_pool = Arc::new(TunerPool::new(capacity));
    let sessions = Arc::new(SessionManager::new(
        SessionConfig {
            ffmpeg_path: file_config
                .gateway
                .ffmpeg_path
                .unwrap_or_else(|| "ffmpeg".to_string()),
            ffmpeg_log_level: logging::ffmpeg_log_level(args.verbose, log_level.as_deref())
                .to_string(),
        },
        Arc::clone(&device),
    ));

    let advertise_url = args
        .advertise_url
        .or(file_config.gateway.advertise_url)
        .unwrap_or_else(|| format!("http://{}", listen_addr));
    let identity = DeviceIdentity {
        friendly_name: file_config
            .gateway
            .friendly_name
            .unwrap_or_else(|| "Tablo Proxy".to_string()),
        device_id: file_config
            .gateway
            .device_id
            .unwrap_or_else(|| "tablo2plex".to_string()),
        base_url: advertise_url.trim_end_matches('/').to_string(),
    };

    // Lineup refresh: rebuild the whole directory, swap it in atomically.
    let lineup_interval = file_config
        .refresh
        .lineup_interval_hours
        .map(|h| Duration::from_secs(h * 3600))
        .unwrap_or(DEFAULT_LINEUP_INTERVAL);
    let lineup_scheduler = {
        let device = Arc::clone(&device);
        let directory = Arc::clone(&directory);
        PersistentScheduler::new(
            data_dir.join("schedule_lineup.json"),
            "lineup refresh",
            lineup_interval,
            Arc::new(move || {
                let device = Arc::clone(&device);
                let directory = Arc::clone(&directory);
                Box::pin(async move {
                    let channels = device.fetch_lineup().await?;
                    directory.replace(channels).await;
                    Ok(())
                })
            }),
        )
    };

    // Guide refresh: pull the XMLTV payload and cache it for /guide.xml.
    let guide_enabled = !args.no_guide && file_config.refresh.guide_enabled.unwrap_or(true);
    let guide_path = guide_enabled.then(|| data_dir.join("guide.xml"));
    let guide_scheduler = guide_path.clone().map(|path| {
        let interval = file_config
            .refresh
            .guide_interval_hours
            .map(|h| Duration::from_secs(h * 3600))
            .unwrap_or(DEFAULT_GUIDE_INTERVAL);
        let device = Arc::clone(&device);
        PersistentScheduler::new(
            data_dir.join("schedule_guide.json"),
            "guide refresh",
            interval,
            Arc::new(move || {
                let device = Arc::clone(&device);
                let path = path.clone();
                Box::pin(async move {
                    let xml = device.fetch_guide().await?;
                    let tmp = path.with_extension("xml.tmp");
                    tokio::fs::write(&tmp, &xml).await?;
                    tokio::fs::rename(&tmp, &path).await?;
                    info!("Guide cache updated ({} bytes)", xml.len());
                    Ok(())
                })
            }),
        )
    });

    if args.refresh {
        info!("One-shot refresh requested");
        lineup_scheduler.force_run_now().await;
        if let Some(scheduler) = &guide_scheduler {
            scheduler.force_run_now().await;
        }
        if directory.is_empty().await {
            warn!("Refresh finished but the lineup is empty");
        }
        return Ok(());
    }

    lineup_scheduler.schedule_next_run().await;
    if let Some(scheduler) = &guide_scheduler {
        scheduler.schedule_next_run().await;
    }

    // A startup with no channels serves an empty lineup until the first
    // refresh lands; run it now if the schedule was not yet due.
    if directory.is_empty().await {
        info!("Lineup empty at startup; refreshing now");
        lineup_scheduler.force_run_now().await;
    }

    let state = Arc::new(GatewayState {
        directory,
        tuner_pool,
        sessions,
        identity,
        guide_path,
    });

    info!(
        "tablo-proxy starting: {} channels, {} tuners, advertised at {}",
        state.directory.len().await,
        capacity,
        state.identity.base_url
    );

    web::start_web_server(listen_addr, state).await
}
