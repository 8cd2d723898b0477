//! mantad - MANTA edge daemon
//!
//! 1. Loads configuration (`MANTA_CONFIG` JSON plus `MANTA_*` overrides)
//! 2. Supervises the camera stream, reconnecting on drops and staleness
//! 3. Detects people and matches them against recently seen identities
//! 4. Logs new identities locally and queues records and snapshots for upload
//! 5. On Ctrl-C, flushes the queues once and stops every worker

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use manta_edge::delivery::DeliveryQueue;
use manta_edge::pipeline::{file_sink, or_unavailable, record_sink};
use manta_edge::reid::select_extractor;
use manta_edge::supervisor::{open_source, NmcliJoiner};
use manta_edge::{
    ActivityLog, CapturePipeline, ConnectionSupervisor, EdgeConfig, IdentityMatcher,
    LinkJoiner, LogObserver, MotionDetector, NoLink, PipelineParts, StatusObserver,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "MANTA edge person detection daemon")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "MANTA_CONFIG")]
    config: Option<PathBuf>,

    /// Keep everything local: records are queued but never sent, snapshots
    /// are not uploaded.
    #[arg(long, env = "MANTA_NO_UPLOAD")]
    no_upload: bool,

    /// Do not write person snapshots to disk.
    #[arg(long)]
    no_snapshots: bool,

    /// Stop after this many processed frames (0 = run until interrupted).
    #[arg(long, default_value_t = 0)]
    max_frames: u64,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let cfg = EdgeConfig::load_from(args.config.as_deref())?;
    log::info!(
        "mantad {} camera_id={} source={}",
        env!("CARGO_PKG_VERSION"),
        cfg.camera_id,
        cfg.camera.source.url
    );

    let observer: Arc<dyn StatusObserver> = Arc::new(LogObserver);

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })?;

    let link: Arc<dyn LinkJoiner> = match &cfg.wifi {
        Some(wifi) => Arc::new(NmcliJoiner::new(wifi.ssid.clone(), wifi.password.clone())),
        None => Arc::new(NoLink),
    };
    let source = open_source(&cfg.camera.source)?;
    let supervisor = Arc::new(ConnectionSupervisor::new(
        cfg.camera.supervisor.clone(),
        source,
        link,
        observer.clone(),
    )?);
    supervisor.start()?;

    let extractor = select_extractor(cfg.reid.model_path.as_deref());
    let matcher = Arc::new(IdentityMatcher::new(cfg.reid.matcher.clone(), extractor)?);

    let activity = match ActivityLog::open(
        &cfg.activity.path,
        &cfg.camera_id,
        cfg.activity.retention_days,
    ) {
        Ok(log) => Some(Arc::new(log)),
        Err(err) => {
            log::warn!("activity log disabled: {:#}", err);
            None
        }
    };

    let records_sink = if args.no_upload {
        or_unavailable(
            "RecordQueue",
            Err(manta_edge::EdgeError::configuration("uploads disabled by --no-upload")),
        )
    } else {
        or_unavailable("RecordQueue", record_sink(&cfg.delivery, &cfg.camera_id))
    };
    let records = Arc::new(DeliveryQueue::start(
        cfg.delivery.queue.clone(),
        records_sink,
        observer.clone(),
    )?);

    let uploads = if args.no_upload || args.no_snapshots {
        None
    } else {
        match file_sink(&cfg.storage) {
            Ok(sink) => Some(Arc::new(DeliveryQueue::start(
                cfg.storage.queue.clone(),
                sink,
                observer.clone(),
            )?)),
            Err(err) => {
                log::warn!("FileUploader: disabled ({:#})", err);
                None
            }
        }
    };

    let snapshot_dir = if args.no_snapshots {
        None
    } else {
        Some(cfg.storage.snapshot_dir.clone())
    };

    let mut pipeline = CapturePipeline::new(PipelineParts {
        camera_id: cfg.camera_id.clone(),
        supervisor: supervisor.clone(),
        detector: Box::new(MotionDetector::new()),
        matcher: matcher.clone(),
        records: records.clone(),
        uploads: uploads.clone(),
        activity,
        snapshot_dir,
    });

    let frame_interval = if cfg.camera.source.target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(1000 / cfg.camera.source.target_fps as u64)
    };
    let mut last_health_log = Instant::now();

    log::info!("mantad running; press Ctrl-C to stop");
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        if let Err(err) = pipeline.step() {
            log::error!("capture step failed: {:#}", err);
        }

        if args.max_frames > 0 && pipeline.stats().frames >= args.max_frames {
            log::info!("reached --max-frames {}", args.max_frames);
            break;
        }

        if last_health_log.elapsed() >= Duration::from_secs(30) {
            let stream = supervisor.stats();
            let queue = records.stats();
            let stats = pipeline.stats();
            log::info!(
                "health: connected={} reconnects={} frames={} persons={} new={} known={} records_pending={} mode={}",
                stream.connected,
                stream.reconnects,
                stats.frames,
                stats.persons,
                stats.new_persons,
                matcher.known_count(),
                queue.pending,
                queue.mode.as_str()
            );
            last_health_log = Instant::now();
        }

        let elapsed = started.elapsed();
        if elapsed < frame_interval {
            std::thread::sleep(frame_interval - elapsed);
        }
    }

    pipeline.shutdown();
    Ok(())
}
