use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Configuration;
use crate::services::catalog::ActionCatalog;
use crate::services::directory::Directory;
use crate::services::dispatcher::Dispatcher;
use crate::services::files::FileService;
use crate::services::mailer::{Mailer, MailerSettings};
use crate::services::processes::{ProcessService, ProcessSettings};
use crate::services::reports::ReportArchive;

mod listener;
mod rate_limit;
mod tls;

use listener::{ListenerKind, ListenerState};
use rate_limit::RateLimiter;

#[derive(Parser)]
#[command(name = "cirrus-server")]
#[command(about = "Cirrus cloud server", long_about = None)]
struct Args {
    /// Path to the cloud data directory
    #[arg(long, default_value = "./cirrus-data")]
    cloud_dir: PathBuf,

    /// Public listener port (overrides the configuration file)
    #[arg(long)]
    public_port: Option<u16>,

    /// Private (mTLS) listener port (overrides the configuration file)
    #[arg(long)]
    private_port: Option<u16>,

    /// Per-peer request rate limit per second (overrides the configuration file)
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Maximum file store size in bytes (overrides the configuration file)
    #[arg(long)]
    file_store_max_size: Option<i64>,

    /// Maximum single file size in bytes (overrides the configuration file)
    #[arg(long)]
    file_store_max_file_size: Option<i64>,

    /// Write bound listener addresses to this file (dev/test convenience)
    #[arg(long)]
    addr_file: Option<PathBuf>,

    /// Print the effective settings and exit
    #[arg(long)]
    print_settings: bool,

    /// Write the effective settings to the configuration file and exit
    #[arg(long)]
    store_settings: bool,

    /// Log to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,
}

pub async fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = Configuration::load(&args.cloud_dir)?;
    if let Some(port) = args.public_port {
        config.public_port = port;
    }
    if let Some(port) = args.private_port {
        config.private_port = port;
    }
    if let Some(rate) = args.rate_limit {
        config.rate_limit_per_second = rate;
    }
    if let Some(size) = args.file_store_max_size {
        config.file_store_max_size = size;
    }
    if let Some(size) = args.file_store_max_file_size {
        config.file_store_max_file_size = size;
    }

    if args.print_settings {
        println!(
            "{}",
            serde_json::to_string_pretty(&config).context("serialize settings")?
        );
        return Ok(());
    }

    config.create_directories()?;
    config.sync()?;
    if args.store_settings {
        return Ok(());
    }

    init_logging(&config, args.log_stderr)?;
    info!("cirrus-server {} starting", env!("CARGO_PKG_VERSION"));

    // Services, leaves first.
    let directory = Arc::new(Directory::load(config.users_file())?);
    let actions = Arc::new(ActionCatalog::load(config.actions_file())?);

    let (file_tx, file_rx) = mpsc::unbounded_channel();
    let files = Arc::new(FileService::start(
        config.file_store_path.clone(),
        config.file_store_max_size,
        config.file_store_max_file_size,
        directory.clone(),
        file_tx,
    )?);

    let (process_tx, process_rx) = mpsc::unbounded_channel();
    let processes = Arc::new(ProcessService::load(
        config.processes_file(),
        ProcessSettings {
            processes_dir: config.processes_dir(),
            working_dir: config.var_dir(),
            log_dir: config.log_dir(),
            ca_dir: config.ca_dir.clone(),
        },
        process_tx,
    )?);

    let reports = Arc::new(ReportArchive::new(
        config.reports_dir(),
        config.max_report_length,
        config.max_comment_length,
    ));

    let mailer = Arc::new(Mailer::start(MailerSettings {
        from_address: config.sender_email_address.clone(),
        ..Default::default()
    }));

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let dispatcher = Dispatcher::new(
        directory.clone(),
        actions.clone(),
        files.clone(),
        processes.clone(),
        reports,
        mailer.clone(),
        stop_tx,
    );
    let (action_tx, action_rx) = mpsc::unbounded_channel();
    let dispatcher_task = tokio::spawn(dispatcher.run(action_rx, file_rx, process_rx));

    // Listeners.
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_second));
    let tls_available = config.certificate_path.exists() && config.private_key_path.exists();
    if !tls_available {
        warn!(
            "server certificate {} not found, listeners fall back to plain TCP",
            config.certificate_path.display()
        );
    }

    let public_handle = Handle::new();
    let public_task = spawn_listener(
        ListenerKind::Public,
        Arc::new(ListenerState {
            kind: ListenerKind::Public,
            trust_executor: !tls_available,
            actions: action_tx.clone(),
            directory: directory.clone(),
            rate_limiter: rate_limiter.clone(),
        }),
        config.public_port,
        &config,
        tls_available,
        public_handle.clone(),
    )?;

    let private_handle = Handle::new();
    let private_task = spawn_listener(
        ListenerKind::Private,
        Arc::new(ListenerState {
            kind: ListenerKind::Private,
            trust_executor: true,
            actions: action_tx.clone(),
            directory: directory.clone(),
            rate_limiter,
        }),
        config.private_port,
        &config,
        tls_available,
        private_handle.clone(),
    )?;

    let public_addr = public_handle
        .listening()
        .await
        .context("public listener failed to start")?;
    let private_addr = private_handle
        .listening()
        .await
        .context("private listener failed to start")?;
    eprintln!("cirrus-server public listener on {public_addr}");
    eprintln!("cirrus-server private listener on {private_addr}");
    info!("public listener on {public_addr}, private listener on {private_addr}");

    if let Some(addr_file) = &args.addr_file {
        std::fs::write(
            addr_file,
            format!("public={public_addr}\nprivate={private_addr}\n"),
        )
        .with_context(|| format!("write addr file {}", addr_file.display()))?;
    }

    wait_for_shutdown(&mut stop_rx).await;

    // Stop accepting and let in-flight requests resolve.
    info!("shutting down listeners");
    public_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    private_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    let _ = public_task.await;
    let _ = private_task.await;

    // Drain the workers.
    {
        let files = files.clone();
        tokio::task::spawn_blocking(move || files.stop())
            .await
            .context("join file service")?;
    }
    mailer.stop().await;
    dispatcher_task.abort();

    // Flush the persisted catalogs.
    for (name, result) in [
        ("users", directory.write_file()),
        ("actions", actions.write_file()),
        ("processes", processes.write_file()),
    ] {
        if let Err(err) = result {
            error!("failed to flush {name} at shutdown: {err:#}");
        }
    }

    info!("cirrus-server stopped");
    Ok(())
}

fn spawn_listener(
    kind: ListenerKind,
    state: Arc<ListenerState>,
    port: u16,
    config: &Configuration,
    tls_available: bool,
    handle: Handle,
) -> Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let router = listener::build_router(state);
    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    if !tls_available {
        return Ok(tokio::spawn(
            axum_server::bind(addr).handle(handle).serve(service),
        ));
    }

    let server_config = match kind {
        ListenerKind::Public => {
            tls::server_config(&config.certificate_path, &config.private_key_path)?
        }
        ListenerKind::Private => {
            if config.ca_certificate_path.exists() {
                tls::server_config_mtls(
                    &config.certificate_path,
                    &config.private_key_path,
                    &config.ca_certificate_path,
                )?
            } else {
                warn!(
                    "CA certificate {} not found, private listener client authentication disabled",
                    config.ca_certificate_path.display()
                );
                tls::server_config(&config.certificate_path, &config.private_key_path)?
            }
        }
    };
    let rustls_config = RustlsConfig::from_config(Arc::new(server_config));
    Ok(tokio::spawn(
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(service),
    ))
}

async fn wait_for_shutdown(stop_rx: &mut mpsc::Receiver<()>) {
    let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            let _ = stop_rx.recv().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = terminate.recv() => info!("received terminate"),
        _ = stop_rx.recv() => info!("stop action received"),
    }
}

fn init_logging(config: &Configuration, log_stderr: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_file())
        .with_context(|| format!("open log file {}", config.log_file().display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}
