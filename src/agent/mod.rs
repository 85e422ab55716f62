use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::event::CeEvent;
use crate::export::HealthMetrics;
use crate::offline::KernelSysfs;
use crate::page::PageTracker;
use crate::trigger::ProcessSpawner;

/// One request for the accounting task.
enum Request {
    Event(CeEvent),
    Dump(oneshot::Sender<String>),
}

/// Agent orchestrates the daemon: the accounting task, the control socket
/// and the health metrics server.
///
/// All accounting state lives on a single dedicated task; the socket side
/// only parses lines and forwards them, so event handling is serialised
/// end to end.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    tx: Option<mpsc::Sender<Request>>,
    worker: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            tx: None,
            worker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin accepting events.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let cpu_model = self
            .cfg
            .resolved_cpu_model()
            .context("unknown cpu-model")?;
        let tracker = PageTracker::new(
            &self.cfg.page,
            cpu_model,
            Box::new(KernelSysfs),
            Box::new(ProcessSpawner::new(self.cfg.page.sync_trigger_timeout)),
        )
        .context("setting up page tracker")?;

        info!(
            mode = %tracker.mode(),
            max_counters = tracker.max_corr_err_counters(),
            cpu_model = %cpu_model,
            "page tracker ready",
        );

        let (tx, rx) = mpsc::channel::<Request>(1024);
        self.worker = Some(spawn_accounting_task(tracker, rx, Arc::clone(&self.health)));
        self.tx = Some(tx.clone());

        let listener = bind_socket(&self.cfg.socket_path)
            .with_context(|| format!("binding {}", self.cfg.socket_path.display()))?;
        info!(path = %self.cfg.socket_path.display(), "control socket listening");

        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let tx = tx.clone();
                            let health = Arc::clone(&health);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, tx, health).await {
                                    debug!(error = %e, "control connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accepting control connection");
                            break;
                        }
                    },
                }
            }
        });

        Ok(())
    }

    /// Graceful shutdown: stop accepting, drain the accounting task, stop
    /// the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        // Closing the channel lets the accounting task drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker.await.context("joining accounting task")?;
        }
        self.health.stop();
        let _ = std::fs::remove_file(&self.cfg.socket_path);
        Ok(())
    }
}

/// Bind the control socket, replacing any stale file from a previous run.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).context("binding unix socket")
}

/// Run the accounting loop on a dedicated blocking task. Synchronous
/// pre/post-soft triggers may block here; only event accounting waits on
/// them.
fn spawn_accounting_task(
    mut tracker: PageTracker,
    mut rx: mpsc::Receiver<Request>,
    health: Arc<HealthMetrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(req) = rx.blocking_recv() {
            match req {
                Request::Event(ev) => {
                    let outcome = tracker.account(&ev);
                    if !outcome.accounted {
                        health.events_filtered.inc();
                    }
                    if outcome.threshold_fired {
                        health.thresholds_fired.inc();
                    }
                    match outcome.offline_result {
                        Some(true) => health.offline_attempts.with_label_values(&["ok"]).inc(),
                        Some(false) => {
                            health.offline_attempts.with_label_values(&["failed"]).inc()
                        }
                        None => {}
                    }
                    health.pages_tracked.set(tracker.tracked() as f64);
                    health
                        .counter_replacements
                        .set(tracker.replacement_count() as f64);
                }
                Request::Dump(reply) => {
                    let mut out = Vec::new();
                    if let Err(e) = tracker.dump(&mut out) {
                        warn!(error = %e, "dumping page statistics");
                    }
                    let _ = reply.send(String::from_utf8_lossy(&out).into_owned());
                }
            }
        }
        debug!("accounting task drained");
    })
}

/// Serve one control connection: decoded event JSON lines and the `dump`
/// command.
async fn serve_connection(
    stream: UnixStream,
    tx: mpsc::Sender<Request>,
    health: Arc<HealthMetrics>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "dump" {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Request::Dump(reply_tx)).await.is_err() {
                break;
            }
            match reply_rx.await {
                Ok(report) => write_half.write_all(report.as_bytes()).await?,
                Err(_) => break,
            }
            continue;
        }
        match serde_json::from_str::<CeEvent>(line) {
            Ok(ev) => {
                health.events_received.inc();
                if tx.send(Request::Event(ev)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                health.events_unparsable.inc();
                debug!(error = %e, "unparsable control line");
            }
        }
    }

    Ok(())
}
