use crate::config::WalkConfig;
use crate::error::{CoreError, Result};
use crate::ledger::{RecordSink, RunStatus, VisitCounts};
use codetree_scanner::{
    ArtifactStore, CategoryPath, CompletedCheck, ProgressCallback, ReachabilityProbe,
    RecoveryEvent, SessionManager, TreeWalker, UiAdapter, VisitRecord, VisitStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Options for configuring a walk
pub struct WalkOptions {
    pub config: WalkConfig,
    /// Confine the walk to this subtree.
    pub start: Option<CategoryPath>,
    pub show_progress_bars: bool,
    /// Install a Ctrl-C handler that requests a stop between leaves.
    pub handle_ctrl_c: bool,
}

impl WalkOptions {
    pub fn new(config: WalkConfig) -> Self {
        Self {
            config,
            start: None,
            show_progress_bars: false,
            handle_ctrl_c: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WalkEvent {
    Started { run_id: String, portal_url: String },
    Visit(VisitRecord),
    Recovery(RecoveryEvent),
    Log(String),
    Finished { counts: VisitCounts, cancelled: bool },
}

/// Callback for walk events as they happen
pub type WalkEventCallback = Arc<dyn Fn(WalkEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WalkOutcome {
    pub run_id: String,
    pub counts: VisitCounts,
    /// Distinct leaf keys in discovery order.
    pub discovered_paths: Vec<String>,
    pub recoveries: Vec<RecoveryEvent>,
    pub cancelled: bool,
}

fn emit(callback: &Option<WalkEventCallback>, event: WalkEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}

/// Emit recovery events not reported yet; returns the new high-water mark.
fn emit_recoveries(callback: &Option<WalkEventCallback>, events: &[RecoveryEvent], seen: usize) -> usize {
    for event in events.iter().skip(seen) {
        emit(callback, WalkEvent::Recovery(event.clone()));
    }
    events.len()
}

/// Run one walk against the adapter built by `make_adapter` (which receives
/// the run id), persisting every record into `sink` as it is produced.
///
/// Only startup failures are returned as errors; individual leaf failures end
/// up in the sink.
pub async fn execute_walk<F>(
    options: WalkOptions,
    make_adapter: F,
    sink: &mut dyn RecordSink,
    event_callback: Option<WalkEventCallback>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<WalkOutcome>
where
    F: FnOnce(&str) -> Box<dyn UiAdapter>,
{
    let WalkOptions {
        config,
        start,
        show_progress_bars,
        handle_ctrl_c,
    } = options;

    config.validate()?;

    if config.probe {
        emit(&event_callback, WalkEvent::Log(format!("Probing {}", config.portal_url)));
        let probe = ReachabilityProbe::new()?;
        if let Err(e) = probe.check(&config.portal_url).await {
            error!("Portal unreachable: {}", e);
            return Err(e.into());
        }
    }

    let configuration = serde_json::to_string(&config)?;
    let run_id = sink.begin_run(&config.portal_url, &configuration)?;
    info!("Starting run {}", run_id);
    emit(
        &event_callback,
        WalkEvent::Started {
            run_id: run_id.clone(),
            portal_url: config.portal_url.clone(),
        },
    );

    let done = match sink.succeeded_keys() {
        Ok(keys) => Arc::new(keys),
        Err(e) => {
            sink.finish_run(&run_id, RunStatus::Failed)?;
            return Err(e);
        }
    };
    if !done.is_empty() {
        info!("Resuming: {} leaves already downloaded", done.len());
        emit(
            &event_callback,
            WalkEvent::Log(format!("Resuming: {} leaves already downloaded", done.len())),
        );
    }
    let completed_check: CompletedCheck = Arc::new(move |path: &CategoryPath| done.contains(&path.key()));

    // Set up single spinner for overall walk progress (only if enabled)
    let progress_bar = if show_progress_bars {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("static spinner template"),
        );
        pb.set_message("Opening classification root...");
        Some(Arc::new(pb))
    } else {
        None
    };

    let progress_callback: ProgressCallback = match progress_bar.clone() {
        Some(pb) => Arc::new(move |count: usize, path: &CategoryPath| {
            pb.set_message(format!("Walking... {} leaves | {}", count, path));
            pb.tick();
        }),
        None => Arc::new(|_count: usize, _path: &CategoryPath| {}),
    };

    let cancel = cancel.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    let ctrl_c_task = if handle_ctrl_c {
        let flag = cancel.clone();
        Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current leaf");
                flag.store(true, Ordering::SeqCst);
            }
        }))
    } else {
        None
    };

    let session = SessionManager::new(make_adapter(&run_id)).with_policy(config.recovery_policy());
    let mut walker = TreeWalker::new(session, ArtifactStore::new(&config.output_dir))
        .with_settings(config.walker_settings())
        .with_completed_check(completed_check)
        .with_progress_callback(progress_callback)
        .with_cancel_flag(cancel);

    if let Err(e) = walker.start(start.as_ref()).await {
        error!("Walk could not start: {}", e);
        walker.shutdown().await;
        if let Some(task) = ctrl_c_task {
            task.abort();
        }
        if let Some(pb) = &progress_bar {
            pb.finish_and_clear();
        }
        sink.finish_run(&run_id, RunStatus::Failed)?;
        return Err(CoreError::Scan(e));
    }

    let mut counts = VisitCounts::default();
    let mut seen_recoveries = 0;
    let mut write_error = None;

    while let Some(record) = walker.next_visit().await {
        seen_recoveries = emit_recoveries(&event_callback, walker.recoveries(), seen_recoveries);

        if let Err(e) = sink.record(&run_id, &record) {
            error!("Could not persist record for '{}': {}", record.path, e);
            write_error = Some(e);
            break;
        }
        if record.status == VisitStatus::Failed {
            warn!(
                "Failed '{}': {}",
                record.path,
                record.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
        counts.add(record.status);
        emit(&event_callback, WalkEvent::Visit(record));
    }

    emit_recoveries(&event_callback, walker.recoveries(), seen_recoveries);
    let cancelled = walker.is_cancelled();
    let discovered_paths: Vec<String> = walker.discovered_paths().iter().map(|p| p.key()).collect();
    let recoveries = walker.recoveries().to_vec();
    walker.shutdown().await;
    if let Some(task) = ctrl_c_task {
        task.abort();
    }

    if let Some(e) = write_error {
        if let Some(pb) = &progress_bar {
            pb.abandon_with_message("Ledger write failed");
        }
        // Best effort; the write failure is what gets reported
        let _ = sink.finish_run(&run_id, RunStatus::Failed);
        return Err(e);
    }

    let status = if cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Completed
    };
    sink.finish_run(&run_id, status)?;

    if let Some(pb) = &progress_bar {
        pb.finish_with_message(format!(
            "Walk {}: {} downloaded, {} failed, {} skipped",
            status.as_str(),
            counts.success,
            counts.failed,
            counts.skipped
        ));
    }
    info!(
        "Run {} {}: {} success, {} failed, {} skipped, {} recoveries",
        run_id,
        status.as_str(),
        counts.success,
        counts.failed,
        counts.skipped,
        recoveries.len()
    );
    emit(&event_callback, WalkEvent::Finished { counts, cancelled });

    Ok(WalkOutcome {
        run_id,
        counts,
        discovered_paths,
        recoveries,
        cancelled,
    })
}
