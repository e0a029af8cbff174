use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use xc_score::{
    expand_track, parse_track, resolve_league, sampled_track, track_length_km, FlightLog, League,
    OptimizationOptions, OptimizationRequest, OptimizationResult, ReplayEngine, ScoreRequest,
    ScoreWorker, ScoringTrack, Solution, WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cross-country track scoring adapter CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported league identifiers
    Leagues,
    /// Convert a GPX/FIT track into the flight log handed to the scoring engine
    Prepare(PrepareArgs),
    /// Score a track by replaying recorded engine solutions through a session
    Replay(ReplayArgs),
}

#[derive(Parser, Debug)]
struct PrepareArgs {
    /// GPX/FIT track to ingest
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// League whose rules will be applied
    #[arg(long, default_value = "xc")]
    league: String,

    /// Keep one point per interval (seconds)
    #[arg(long)]
    sample_interval: Option<f64>,

    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// GPX/FIT track to score
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// JSON array of recorded engine solutions
    #[arg(long, value_hint = ValueHint::FilePath)]
    solutions: PathBuf,

    /// League whose rules will be applied
    #[arg(long, default_value = "xc")]
    league: String,

    /// Keep one point per interval (seconds)
    #[arg(long)]
    sample_interval: Option<f64>,

    /// Wall-clock budget per engine step (milliseconds)
    #[arg(long)]
    max_cycle_ms: Option<u64>,

    /// Iteration budget for the engine
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Leagues => handle_leagues(),
        Command::Prepare(args) => handle_prepare(args),
        Command::Replay(args) => handle_replay(args),
    }
}

fn handle_leagues() -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for league in League::ALL {
        writeln!(out, "{:<6} {}", league.code(), league.rules().rule_set)?;
    }
    Ok(())
}

fn load_track(path: &Path, sample_interval: Option<f64>) -> Result<ScoringTrack> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let hint = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("gpx");
    let mut track =
        parse_track(&data, hint).with_context(|| format!("failed to parse {}", path.display()))?;
    info!(
        "Loaded {}: {} points, {:.2} km",
        path.display(),
        track.len(),
        track_length_km(&track.points)
    );
    if let Some(interval) = sample_interval {
        if interval <= 0.0 {
            return Err(anyhow!("--sample-interval must be > 0"));
        }
        track.points = sampled_track(&track.points, interval);
        info!("Sampled every {interval}s: {} points", track.len());
    }
    if track.len() < 2 {
        warn!("{} has fewer than 2 points; it will score zero", path.display());
    }
    Ok(track)
}

fn handle_prepare(args: PrepareArgs) -> Result<()> {
    let rules = resolve_league(&args.league)?;
    let track = load_track(&args.input, args.sample_interval)?;
    let expanded = expand_track(&track);
    if !expanded.mapping.is_identity() {
        info!(
            "Expanded {} points to {} for the engine",
            track.len(),
            expanded.track.len()
        );
    }
    let flight = FlightLog::from(expanded.track.as_ref());
    let payload = serde_json::json!({
        "ruleSet": rules.rule_set,
        "flight": flight,
    });
    let text = serde_json::to_string_pretty(&payload)?;
    if args.output.as_os_str() == "-" {
        println!("{text}");
    } else {
        fs::write(&args.output, text)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Wrote flight log: {}", args.output.display());
    }
    Ok(())
}

fn handle_replay(args: ReplayArgs) -> Result<()> {
    let track = load_track(&args.input, args.sample_interval)?;
    let text = fs::read_to_string(&args.solutions)
        .with_context(|| format!("failed to read {}", args.solutions.display()))?;
    let solutions: Vec<Solution> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of solutions", args.solutions.display()))?;

    let options = OptimizationOptions {
        max_cycle_duration_ms: args.max_cycle_ms,
        max_num_cycles: args.max_cycles,
    };
    let request = ScoreRequest {
        request: OptimizationRequest {
            track,
            options: Some(options),
        },
        league_id: args.league.clone(),
    };

    let worker = ScoreWorker::new(ReplayEngine::new(solutions), &WorkerConfig::default())?;
    let t_score = Instant::now();
    let task = worker.submit(request);
    let request_id = task.id();

    let mut rows = Vec::new();
    for result in task {
        let result = result.with_context(|| format!("score request {request_id} failed"))?;
        info!(
            "Result {}: {:.2} points over {:.2} km{}",
            rows.len() + 1,
            result.score,
            result.length_km,
            if result.optimal { " (optimal)" } else { "" }
        );
        rows.push(result);
    }
    info!(
        "Scoring finished: {} results in {:.1} ms",
        rows.len(),
        t_score.elapsed().as_secs_f64() * 1000.0
    );

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_result_rows(request_id, &rows, &mut writer)
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_result_rows(request_id, &rows, &mut writer)?;
        info!("Wrote results CSV: {}", args.output.display());
        Ok(())
    }
}

fn write_result_rows<W: Write>(
    request_id: u64,
    rows: &[OptimizationResult],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "request_id",
        "score",
        "length_km",
        "multiplier",
        "circuit",
        "closing_radius_m",
        "solution_indices",
        "optimal",
    ])?;
    for row in rows {
        let indices = row
            .solution_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        writer.write_record([
            request_id.to_string(),
            format!("{:.3}", row.score),
            format!("{:.3}", row.length_km),
            format!("{:.2}", row.multiplier),
            row.circuit.map(|c| c.to_string()).unwrap_or_default(),
            row.closing_radius_m
                .map(|r| format!("{r:.0}"))
                .unwrap_or_default(),
            indices,
            row.optimal.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
