//! Command implementations for the embeddings daemon.
//!
//! Handles:
//! - start: Load config, open storage, build the model manager, serve HTTP
//! - stop: Signal running daemon to stop (via PID file)
//! - status: Check if daemon is running
//! - models: Print the model catalog
//! - embed: Load one model in-process and print a vector

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use embeddings_models::{
    select_device, CandleModelLoader, ModelCatalog, ModelManager, NoopMirror, QueryDefaults,
    QueryEmbedder, StateMirror,
};
use embeddings_service::{
    run_server_with_shutdown, EmbeddingsService, SearchNotifier, ServiceInfo, StorageMirror,
};
use embeddings_storage::Storage;
use embeddings_types::Settings;

/// Get the PID file path
fn pid_file_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| {
            #[cfg(unix)]
            {
                dirs.runtime_dir()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| dirs.cache_dir().to_path_buf())
            }
            #[cfg(not(unix))]
            {
                dirs.cache_dir().to_path_buf()
            }
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("embeddings-service")
        .join("daemon.pid")
}

fn write_pid_file() -> Result<()> {
    let pid_path = pid_file_path();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;
    info!("Wrote PID file: {:?}", pid_path);
    Ok(())
}

fn remove_pid_file() {
    let pid_path = pid_file_path();
    if pid_path.exists() {
        if let Err(e) = fs::remove_file(&pid_path) {
            warn!("Failed to remove PID file: {}", e);
        } else {
            info!("Removed PID file");
        }
    }
}

fn read_pid_file() -> Option<u32> {
    fs::read_to_string(pid_file_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Check if a process is running
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// Load settings and apply the CLI log level override.
fn load_settings(config_path: Option<&str>, log_level_override: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Install the global subscriber; `RUST_LOG` wins over `level`.
fn init_logging(level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Model manager over the builtin catalog and local Candle loader.
fn build_manager(settings: &Settings, mirror: Arc<dyn StateMirror>) -> Result<Arc<ModelManager>> {
    let device = select_device(&settings.models.device).context("Failed to select compute device")?;
    let loader = CandleModelLoader::new(settings.expanded_cache_dir(), device)
        .with_token(settings.models.huggingface_token.clone());

    let manager = ModelManager::new(
        Arc::new(ModelCatalog::builtin()),
        Arc::new(loader),
        settings.models.max_resident,
    )
    .with_mirror(mirror)
    .with_image_timeout(Duration::from_secs(settings.models.image_fetch_timeout_secs));
    Ok(Arc::new(manager))
}

fn query_defaults(settings: &Settings) -> QueryDefaults {
    let mut defaults = QueryDefaults::new(
        settings.models.text_model_name.clone(),
        settings.models.image_model_name.clone(),
    );
    defaults.use_text_model_for_images = settings.models.use_text_model_for_images;
    defaults.strategy = settings.query.default_strategy.clone();
    defaults.normalize = settings.query.normalize;
    defaults
}

/// Wire storage, model manager, query builder and notifier into the
/// service facade.
pub fn build_service(settings: &Settings, storage: Arc<Storage>) -> Result<Arc<EmbeddingsService>> {
    let mirror = Arc::new(StorageMirror::new(storage.clone()));
    let manager = build_manager(settings, mirror)?;
    let query = QueryEmbedder::new(manager, query_defaults(settings));
    let notifier = SearchNotifier::new(
        settings.search.service_url.clone(),
        Duration::from_secs(settings.search.timeout_secs),
    );
    Ok(Arc::new(EmbeddingsService::new(
        query,
        storage,
        notifier,
        ServiceInfo::from_settings(settings),
    )))
}

/// Load the default text model, then re-mirror every known model.
///
/// Failures are logged; the first request retries the load.
async fn preload_default_model(manager: &ModelManager, model: &str) {
    let model_type = manager.get_model_type(model);
    match manager.get_or_load(model, model_type, false).await {
        Ok(info) => info!(model = %model, dim = info.dimensions, "Preloaded default text model"),
        Err(e) => warn!(model = %model, error = %e, "Failed to preload default text model"),
    }
    if let Err(e) = manager.sync_state_to_mirror().await {
        warn!(error = %e, "Failed to sync model state to storage");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Start the embeddings daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open RocksDB storage
/// 3. Build the model manager and preload the default text model
/// 4. Serve HTTP until SIGINT/SIGTERM
pub async fn start_daemon(
    config_path: Option<&str>,
    foreground: bool,
    port_override: Option<u16>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<()> {
    let mut settings = load_settings(config_path, log_level_override)?;
    if let Some(port) = port_override {
        settings.http_port = port;
    }
    if let Some(db_path) = db_path_override {
        settings.db_path = db_path.to_string();
    }

    init_logging(&settings.log_level)?;

    info!("Embeddings daemon starting...");
    info!("Configuration:");
    info!("  Database path: {}", settings.db_path);
    info!("  HTTP address: {}", settings.http_addr());
    info!("  Model cache: {}", settings.models.cache_dir);
    info!("  Device: {}", settings.models.device);
    info!("  Max resident models: {}", settings.models.max_resident);

    if !foreground {
        warn!("Background mode is not supported, running in foreground");
        warn!("Use a process manager (systemd, launchd) for background operation");
    }

    let db_path = settings.expanded_db_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let storage = Arc::new(Storage::open(&db_path).context("Failed to open storage")?);

    let service = build_service(&settings, storage)?;
    preload_default_model(service.manager(), &settings.models.text_model_name).await;

    write_pid_file()?;

    let addr: SocketAddr = settings
        .http_addr()
        .parse()
        .context("Invalid HTTP address")?;

    let result = run_server_with_shutdown(addr, service, shutdown_signal()).await;

    remove_pid_file();

    result.map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

/// Stop the running daemon by sending SIGTERM.
pub fn stop_daemon() -> Result<()> {
    let pid = read_pid_file().context("No PID file found - daemon may not be running")?;

    if !is_process_running(pid) {
        remove_pid_file();
        anyhow::bail!("Daemon not running (stale PID file removed)");
    }

    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGTERM) != 0 {
                anyhow::bail!("Failed to send SIGTERM to daemon");
            }
        }
        println!("Sent SIGTERM to daemon (PID {})", pid);
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Stop command not yet implemented on this platform");
    }

    Ok(())
}

/// Show daemon status.
pub fn show_status() -> Result<()> {
    let pid_path = pid_file_path();

    match read_pid_file() {
        Some(pid) if is_process_running(pid) => {
            println!("Embeddings daemon is running (PID {})", pid);
            println!("PID file: {:?}", pid_path);
        }
        Some(pid) => {
            println!(
                "Embeddings daemon is NOT running (stale PID {} in {:?})",
                pid, pid_path
            );
        }
        None => {
            println!("Embeddings daemon is NOT running (no PID file)");
        }
    }
    Ok(())
}

/// Print the builtin catalog.
pub fn list_models() {
    let catalog = ModelCatalog::builtin();
    println!("{:<62} {:<11} {:>5}  {:<16} DESCRIPTION", "MODEL", "TYPE", "DIM", "STRATEGY");
    for entry in catalog.iter() {
        println!(
            "{:<62} {:<11} {:>5}  {:<16} {}",
            entry.id,
            entry.modality,
            entry.dimensions,
            format!("{:?}", entry.strategy),
            entry.description
        );
    }
}

/// Embed one input without the server or storage and print it as JSON.
pub async fn embed_once(
    config_path: Option<&str>,
    input: &str,
    model: Option<&str>,
    image: bool,
    log_level_override: Option<&str>,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override.or(Some("warn")))?;
    init_logging(&settings.log_level)?;

    let manager = build_manager(&settings, Arc::new(NoopMirror))?;
    let query = QueryEmbedder::new(manager, query_defaults(&settings));

    let embedding = if image {
        query.embed_image_url(input, model).await
    } else {
        query.embed_text(input, model).await
    }
    .context("Embedding failed")?;

    let output = serde_json::json!({
        "dimension": embedding.dimension(),
        "values": embedding.values,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_path() {
        let path = pid_file_path();
        assert!(path.ends_with("daemon.pid"));
        assert!(path
            .parent()
            .unwrap()
            .to_string_lossy()
            .contains("embeddings-service"));
    }

    #[test]
    fn test_status_no_daemon() {
        assert!(show_status().is_ok());
    }

    #[test]
    fn test_query_defaults_follow_settings() {
        let mut settings = Settings::default();
        settings.models.use_text_model_for_images = true;
        settings.query.default_strategy = "MEAN".to_string();
        settings.query.normalize = false;

        let defaults = query_defaults(&settings);
        assert_eq!(defaults.text_model, settings.models.text_model_name);
        assert_eq!(defaults.image_model, settings.models.image_model_name);
        assert!(defaults.use_text_model_for_images);
        assert_eq!(defaults.strategy, "MEAN");
        assert!(!defaults.normalize);
    }

    #[test]
    fn test_build_service_wires_settings() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.models.cache_dir = temp.path().join("models").to_string_lossy().to_string();
        settings.models.max_resident = 3;

        let storage = Arc::new(Storage::open(&temp.path().join("db")).unwrap());
        let service = build_service(&settings, storage).unwrap();

        assert_eq!(service.manager().max_resident(), 3);
        assert_eq!(service.info().text_model, settings.models.text_model_name);
        assert!(service.loaded_models().is_empty());
    }
}
