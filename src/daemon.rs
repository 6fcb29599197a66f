use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use crate::config::{Config, ConfigOverrides, DEFAULT_CLIENT_URL};
use crate::control::ControlPlane;
use crate::link_core::{Core, CoreSettings};

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub http_addr: Option<String>,
    pub http_token: Option<String>,
    pub log_path: Option<PathBuf>,
    /// Start the connection listener right away instead of waiting for the UI.
    pub start_listener: bool,
    pub bind_ip: Option<Ipv4Addr>,
}

pub struct ThreadedDaemonHandle {
    shutdown: std::sync::mpsc::Sender<()>,
    join: Option<std::thread::JoinHandle<Result<()>>>,
}

impl ThreadedDaemonHandle {
    pub fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(res) => res,
                Err(_) => anyhow::bail!("espwizard daemon thread panicked"),
            }
        } else {
            Ok(())
        }
    }
}

/// Run the link core and control API on the *current* tokio runtime until `shutdown` is
/// notified.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<tokio::sync::Notify>,
) -> Result<()> {
    let mut cfg = cfg;

    let (http_addr, http_token) = prepare_control_plane(&mut cfg, opts.http_addr, opts.http_token)?;

    let log_path = opts.log_path.unwrap_or_else(|| cfg.log_path());
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    if cfg.config_path.is_some() {
        cfg.save()?;
    }

    let (core, core_task) = Core::spawn(CoreSettings::from_config(&cfg), shutdown.clone());

    let control_result =
        ControlPlane::start(&http_addr, Some(http_token), core.clone(), Some(shutdown.clone()))
            .await?;
    let actual_addr = control_result.bound_addr;

    // Publish the address actually bound so the UI can find us after a fallback.
    let actual_client_url = format!("http://{}", actual_addr);
    let configured_url = cfg.client_url.clone().unwrap_or_default();
    if configured_url != actual_client_url {
        crate::logging::info_kv(
            "control plane bound to different port than configured",
            &[
                ("configured", &configured_url),
                ("actual", &actual_client_url),
            ],
        );
        cfg.client_url = Some(actual_client_url);
        if cfg.config_path.is_some() {
            if let Err(e) = cfg.save() {
                crate::logging::error(format!(
                    "failed to save updated config with actual control plane address: {}",
                    e
                ));
            }
        }
    }

    if opts.start_listener {
        if let Err(err) = core.start_server(opts.bind_ip).await {
            crate::logging::link_error("listener start failed", &err);
        }
    }

    // The core performs the explicit stop when shutdown fires.
    core_task.await.context("join core task")?;
    crate::logging::info("daemon stopped");
    Ok(())
}

/// Start the daemon in a dedicated background thread with its own tokio runtime.
///
/// For hosts that embed the link core without owning an async runtime.
pub fn start_threaded(cfg: Config, opts: DaemonOptions) -> Result<ThreadedDaemonHandle> {
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("espwizard-rs-daemon".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
                .context("build tokio runtime")?;

            rt.block_on(async move {
                let shutdown = Arc::new(tokio::sync::Notify::new());
                let shutdown_task = shutdown.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = shutdown_rx.recv();
                    shutdown_task.notify_waiters();
                });

                run_daemon_with_shutdown(cfg, opts, shutdown).await
            })
        })
        .context("spawn espwizard daemon thread")?;

    Ok(ThreadedDaemonHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

/// Load config with CLI-style overrides, then start a background daemon thread.
pub fn start_threaded_from_config_path(
    config_path: &std::path::Path,
    overrides: ConfigOverrides,
    opts: DaemonOptions,
) -> Result<ThreadedDaemonHandle> {
    let cfg = Config::load_with_overrides(config_path, overrides)?;
    start_threaded(cfg, opts)
}

fn prepare_control_plane(
    cfg: &mut Config,
    http_addr: Option<String>,
    http_token_flag: Option<String>,
) -> Result<(String, String)> {
    let http_addr = http_addr
        .or_else(|| cfg.client_url.as_deref().and_then(client_url_to_addr))
        .or_else(|| client_url_to_addr(DEFAULT_CLIENT_URL))
        .unwrap_or_default();
    let http_addr = http_addr.trim().to_string();
    if http_addr.is_empty() {
        anyhow::bail!("http_addr is empty");
    }

    let token = http_token_flag
        .filter(|t| !t.trim().is_empty())
        .or_else(|| cfg.client_token.clone())
        .unwrap_or_default();
    let token = if token.trim().is_empty() {
        uuid::Uuid::new_v4().as_simple().to_string()
    } else {
        token
    };

    cfg.client_url = Some(format!("http://{http_addr}"));
    cfg.client_token = Some(token.clone());

    Ok((http_addr, token))
}

fn client_url_to_addr(client_url: &str) -> Option<String> {
    let u = client_url.trim();
    if u.is_empty() {
        return None;
    }
    let parsed = url::Url::parse(u).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port().unwrap_or(7938);
    Some(format!("{host}:{port}"))
}
