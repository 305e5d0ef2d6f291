#![forbid(unsafe_code)]

//! HTTP entry point for the download job service.
//!
//! Settings come from `.env` plus the process environment; the flags below
//! only override where the server listens and where videos land.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use shorts_tools::{
    api::{AppState, router},
    config::{Settings, SettingsOverrides, resolve_settings},
    jobs::JobRegistry,
    security::ensure_not_root,
    store::JobStore,
    youtube::{YouTubeService, YtDlp},
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Default, PartialEq)]
struct BackendArgs {
    host: Option<IpAddr>,
    port: Option<u16>,
    upload_dir: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || -> Result<String> {
                match inline.clone() {
                    Some(value) => Ok(value),
                    None => args
                        .next()
                        .ok_or_else(|| anyhow!("{flag} requires a value")),
                }
            };

            match flag.as_str() {
                "--host" => parsed.host = Some(parse_host_arg(&value()?)?),
                "--port" => parsed.port = Some(parse_port_arg(&value()?)?),
                "--upload-dir" => parsed.upload_dir = Some(PathBuf::from(value()?)),
                "--env-file" => parsed.env_file = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            api_host: self.host.map(|host| host.to_string()),
            api_port: self.port,
            upload_dir: self.upload_dir.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/API_HOST")
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn build_registry(settings: &Settings) -> Result<JobRegistry> {
    match settings.job_store_path() {
        Some(path) => {
            let store = JobStore::open(&path).await?;
            info!(path = %path.display(), "persisting jobs");
            JobRegistry::with_store(store).await
        }
        None => {
            info!("DATABASE_URL is not a local database; jobs are kept in memory");
            Ok(JobRegistry::in_memory())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse()?;
    ensure_not_root("backend")?;

    let settings = resolve_settings(args.overrides())?;
    let host = parse_host_arg(&settings.api_host)?;
    let addr = SocketAddr::new(host, settings.api_port);

    let ytdlp = YtDlp::new(&settings.yt_dlp_bin, &settings.upload_dir)
        .with_max_filesize(settings.max_upload_size);
    let youtube = Arc::new(YouTubeService::new(
        ytdlp,
        &settings.upload_dir,
        settings.youtube_test_mode,
    ));
    youtube
        .ensure_download_dir()
        .await
        .with_context(|| format!("creating upload dir {}", settings.upload_dir.display()))?;
    match youtube.probe_ytdlp().await {
        Some(version) => info!(version = %version, "yt-dlp available"),
        None if settings.youtube_test_mode => info!("yt-dlp not found; test mode is enabled"),
        None => warn!(bin = %settings.yt_dlp_bin.display(), "yt-dlp not found; downloads will fail"),
    }

    let registry = build_registry(&settings).await?;
    info!(
        environment = settings.environment.as_str(),
        test_mode = settings.youtube_test_mode,
        "starting {}",
        settings.app_name
    );
    let app = router(AppState::new(settings, youtube, registry));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
    info!("shutting down");
}
