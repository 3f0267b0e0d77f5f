use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use flate2::read::GzDecoder;
use lateral_planner::bus::{publish_bootstrap, spawn_plan_writer};
use lateral_planner::calibration::{FileParamStore, MemoryParamStore, ParamStore};
use lateral_planner::inference::{InferenceEngine, PassthroughEngine};
use lateral_planner::tuning::TuningSource;
use lateral_planner::{CarState, Planner, PlannerConfig, PlannerResult};
use log::{info, warn};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

#[derive(Parser, Debug)]
#[command(name = "lateral_planner")]
#[command(about = "Replay recorded vehicle telemetry through the lateral planner", long_about = None)]
struct Args {
    /// Telemetry recording (.json or .json.gz)
    #[arg(long)]
    log: PathBuf,

    /// Directory backing the calibration param store (in memory when omitted)
    #[arg(long)]
    params_dir: Option<PathBuf>,

    /// Live tuning file, re-read when modified
    #[arg(long)]
    tuning: Option<PathBuf>,

    /// Planner config JSON (defaults used for missing keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Vehicle fingerprint index (overrides the config file)
    #[arg(long)]
    fingerprint: Option<usize>,

    /// Angle projections produced per model run
    #[arg(long, default_value = "16")]
    angle_columns: usize,

    /// Output directory for plans and status
    #[arg(long, default_value = "planner_sessions")]
    output_dir: PathBuf,

    /// Replay rate in messages per second (0 = as fast as possible)
    #[arg(long, default_value = "100")]
    rate_hz: f64,

    /// Only plan on the newest message of each wake
    #[arg(long)]
    conflate: bool,
}

#[derive(Deserialize)]
struct Recording {
    messages: Vec<CarState>,
}

fn load_recording(path: &Path) -> Result<Recording> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn load_config(path: &Path) -> Result<PlannerConfig> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Feed recorded messages into the planner at a fixed rate.
async fn replay_loop(messages: Vec<CarState>, tx: mpsc::Sender<CarState>, rate_hz: f64) {
    let period = (rate_hz > 0.0).then(|| Duration::from_secs_f64(1.0 / rate_hz));
    for cs in messages {
        if tx.send(cs).await.is_err() {
            break;
        }
        match period {
            Some(period) => sleep(period).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    fs::create_dir_all(&args.output_dir)?;
    let recording = load_recording(&args.log)
        .with_context(|| format!("Failed to load recording {}", args.log.display()))?;

    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PlannerConfig::default(),
    };
    if let Some(index) = args.fingerprint {
        config.fingerprint = index;
    }

    info!("Lateral planner replay starting");
    info!("  Recording: {} ({} messages)", args.log.display(), recording.messages.len());
    info!("  Model slots: {:?}", config.history_rows);
    match &args.params_dir {
        Some(dir) => info!("  Params dir: {}", dir.display()),
        None => info!("  Params: in memory"),
    }
    info!("  Output dir: {}", args.output_dir.display());

    let store: Arc<dyn ParamStore> = match &args.params_dir {
        Some(dir) => Arc::new(FileParamStore::new(dir)?),
        None => Arc::new(MemoryParamStore::new()),
    };
    let engines = (0..config.history_rows.len())
        .map(|_| {
            PassthroughEngine::new(args.angle_columns)
                .map(|engine| Box::new(engine) as Box<dyn InferenceEngine>)
        })
        .collect::<PlannerResult<Vec<_>>>()?;
    let tuning = args.tuning.clone().map(TuningSource::new);
    let mut planner = Planner::new(config, engines, store, tuning)?;

    let plan_path = args.output_dir.join(format!("plans_{}.jsonl", ts_now_clean()));
    let (mut sink, plan_rx) = crossbeam::channel::unbounded();
    let writer = spawn_plan_writer(plan_rx, plan_path)?;
    publish_bootstrap(&mut sink)?;

    let (tx, mut rx) = mpsc::channel::<CarState>(1000);
    let replay = tokio::spawn(replay_loop(recording.messages, tx, args.rate_hz));

    let status_path = args.output_dir.join("live_status.json");
    let status_period = planner.config().status_period;
    let mut last_status_frame = 0;

    // Block for the next message, then drain whatever else has arrived
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(cs) = rx.try_recv() {
            batch.push(cs);
        }
        if args.conflate {
            batch = batch.split_off(batch.len() - 1);
        }

        planner.step(&batch, &mut sink);

        let frame = planner.state().frame;
        if status_period > 0 && frame != last_status_frame && frame % status_period == 0 {
            if let Err(e) = planner.status().save(&status_path) {
                warn!("Could not write {}: {}", status_path.display(), e);
            }
            last_status_frame = frame;
        }
    }
    replay.await?;

    if let Err(e) = planner.save_calibration() {
        warn!("Final calibration save failed: {}", e);
    }
    let final_status = planner.status();
    final_status.save(&args.output_dir.join("live_status_final.json"))?;

    drop(sink);
    let written = writer
        .join()
        .map_err(|_| anyhow!("plan writer thread panicked"))??;

    info!("=== Final Stats ===");
    info!("Plans written: {}", written);
    info!("Cycles: {}", final_status.frames);
    info!("Distance driven: {:.0}", final_status.distance_driven);
    info!("Lane width: {:.1}", final_status.lane_width);
    info!("Angle bias: {:.3}", final_status.angle_bias);
    info!("Average cycle time: {:.3} ms", final_status.avg_cycle_ms);

    Ok(())
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
