use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_files::Files;
use actix_web::{cookie::Key, middleware::Logger, web, App, HttpServer};
use clap::Parser;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod api;
mod cli;
mod config;
mod shutdown;
mod store;
mod worker;

use crate::api::{
    auth::{auth_config, session_middleware, GoogleAuth},
    health::health_config,
    job::{handlers::job_config, JobService},
    validation,
};
use crate::cli::Cli;
use crate::config::Config;
use crate::shutdown::ShutdownCoordinator;
use crate::store::JobStore;
use crate::worker::{HttpFetcher, Pipeline, PipelineSettings, Scheduler, YouTubePublisher};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn config_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("Configuration error: {}", message))
}

/// Console output plus daily rotated files per level, e.g. logs/info.2024-12-22.log
fn init_logging(log_dir: &str) -> io::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let info_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "info.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::INFO);

    let warn_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "warn.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::WARN);

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "error.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let debug_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "debug.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(info_layer)
        .with(warn_layer)
        .with(error_layer)
        .with(debug_layer)
        .init();
    Ok(())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().map_err(config_error)?;
    cli.apply(&mut config);
    config.validate().map_err(config_error)?;

    init_logging(&config.log_dir)?;

    info!("Starting bulk-uploader");
    info!("Configuration loaded successfully:");
    info!("  - Max concurrent uploads: {}", config.max_concurrent_uploads);
    info!("  - Max items per submission: {}", config.max_bulk_items);
    info!("  - Staging directory: {}", config.staging_dir.display());
    info!("  - Max payload size: {} bytes", config.max_payload_size);

    let auth = GoogleAuth {
        client_id: config.google_client_id.clone(),
        client_secret: config.google_client_secret.clone(),
        base_url: config.base_url.clone(),
    };
    if !auth.is_configured() {
        warn!("Missing GOOGLE_CLIENT_ID or GOOGLE_CLIENT_SECRET, sign-in will not work");
    }
    if let Some(base_url) = &config.base_url {
        info!("Use this redirect URI in Google Cloud Console: {}/auth/google/callback", base_url);
    }

    if config.max_retained_jobs.is_none() {
        warn!("MAX_RETAINED_JOBS is not set, job history is kept until the process exits");
    }
    let store = Arc::new(JobStore::new(config.max_retained_jobs));

    std::fs::create_dir_all(&config.staging_dir)?;
    let fetcher = HttpFetcher::new(Some(CONNECT_TIMEOUT)).map_err(io::Error::other)?;
    let publisher_client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(io::Error::other)?;
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        Arc::new(fetcher),
        Arc::new(YouTubePublisher::new(publisher_client)),
        PipelineSettings {
            staging_dir: config.staging_dir.clone(),
            fetch_timeout: config.fetch_timeout,
            publish_timeout: config.publish_timeout,
        },
    ));
    match pipeline.sweep_staging_dir().await {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} leftover staging files", removed),
        Err(e) => warn!("Could not clean staging directory: {}", e),
    }

    // Jobs run on this runtime, not on the HTTP worker threads
    let scheduler = Scheduler::new(config.max_concurrent_uploads, pipeline, Handle::current());

    let session_key = match &config.session_secret {
        Some(secret) => Key::derive_from(secret.as_bytes()),
        None => {
            warn!("SESSION_SECRET is not set, sessions will not survive a restart");
            Key::generate()
        }
    };

    let job_service = web::Data::new(JobService::new(
        store.clone(),
        scheduler.clone(),
        config.max_bulk_items,
        config.job_status_limit,
    ));
    let auth = web::Data::new(auth);
    let cookie_secure = config.cookie_secure;
    let max_payload_size = config.max_payload_size;
    let static_dir = config.static_dir.is_dir().then(|| config.static_dir.clone());
    match &static_dir {
        Some(dir) => info!("Serving static files from {}", dir.display()),
        None => warn!("Static directory {} not found, no UI will be served", config.static_dir.display()),
    }

    let server_scheduler = scheduler.clone();
    let server = HttpServer::new(move || {
        let app = App::new()
            .wrap(session_middleware(session_key.clone(), cookie_secure))
            .wrap(Logger::default())
            .app_data(job_service.clone())
            .app_data(auth.clone())
            .app_data(web::Data::from(server_scheduler.clone()))
            .app_data(web::Data::from(store.clone()))
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .app_data(validation::json_config(max_payload_size))
            .configure(health_config)
            .configure(auth_config)
            .configure(job_config);

        match &static_dir {
            Some(dir) => app.service(Files::new("/", dir).index_file("index.html")),
            None => app,
        }
    });

    info!("Server starting on http://{}:{}", config.host, config.port);

    // Bind and start the server. Signals are handled by the shutdown coordinator.
    let server = server
        .disable_signals()
        .shutdown_timeout(config.shutdown_grace.as_secs())
        .bind((config.host.as_str(), config.port))?
        .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let coordinator = ShutdownCoordinator::new(server_handle, server_task, scheduler, config.shutdown_grace);
    coordinator.wait_for_shutdown().await
}
