use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use taskart_contracts::errors::GenerationError;
use taskart_contracts::records::JsonRecordStore;
use taskart_contracts::request::{GenerationRequest, ImageStyle, QualityTier};
use taskart_engine::{EngineConfig, ImageOrchestrator, ImageOutcome, ProgressStage, WarmUpReport};
use tracing::{debug, info, Level};

#[derive(Debug, Parser)]
#[command(name = "taskart", version, about = "Task illustration generator and cache")]
struct Cli {
    /// JSON record store holding targets, the requester profile and settings.
    #[arg(long, global = true, default_value = "taskart-records.json")]
    store: PathBuf,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Provider name: auto, openai, gemini or dryrun.
    #[arg(long, global = true)]
    provider: Option<String>,
    /// Append activity events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate (or fetch from cache) an illustration for a title.
    Generate(GenerateArgs),
    /// Regenerate the illustration of a stored target, bypassing the cache.
    Regenerate(TargetArgs),
    /// Print the image currently bound to a stored target.
    Show(TargetArgs),
    /// Print the cache state rebuilt at startup from the cache directory and
    /// the record store.
    Warm,
    /// Generate images for every stored target that has none.
    Fill,
    /// Report provider readiness and cache statistics.
    Status,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    profile: Option<String>,
    /// anime, cartoon, minimalist, watercolor, realistic, pixel or sketch.
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    reference: Option<PathBuf>,
    /// high, medium or low.
    #[arg(long)]
    quality: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    target: Option<i64>,
    #[arg(long)]
    force: bool,
    /// Include the full data URI in the output.
    #[arg(long)]
    payload: bool,
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long)]
    target: i64,
    #[arg(long)]
    payload: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("taskart error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (orchestrator, warmed) = build_orchestrator(&cli)?;
    match cli.command {
        Command::Generate(args) => run_generate(&orchestrator, args),
        Command::Regenerate(args) => {
            let result = orchestrator.regenerate_image_for(args.target, Some(&log_progress));
            emit_generation(result, args.payload)
        }
        Command::Show(args) => match orchestrator.get_image_for(args.target) {
            Ok(image_url) => {
                let image = image_url.map(|url| payload_field(url, args.payload));
                emit(json!({ "success": true, "targetId": args.target, "image": image }))?;
                Ok(0)
            }
            Err(err) => emit_failure(&err),
        },
        Command::Warm => {
            emit(json!({ "success": true, "warmUp": warmed }))?;
            Ok(0)
        }
        Command::Fill => run_fill(&orchestrator),
        Command::Status => {
            emit(json!({
                "success": true,
                "provider": orchestrator.provider_name(),
                "ready": orchestrator.is_ready(),
                "cache": orchestrator.cache_stats(),
                "sessionId": orchestrator.activity().session_id(),
            }))?;
            Ok(0)
        }
    }
}

/// Builds the orchestrator and warms its cache from disk and the record
/// store, so images from earlier runs are served without a provider call.
fn build_orchestrator(cli: &Cli) -> Result<(ImageOrchestrator, WarmUpReport)> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(cache_dir) = cli.cache_dir.clone() {
        config.cache_dir = cache_dir;
    }
    if let Some(provider) = cli.provider.clone() {
        config.provider = provider;
    }
    if let Some(events) = cli.events.clone() {
        config.activity_log = Some(events);
    }
    debug!(
        "store={} cache_dir={} provider={}",
        cli.store.display(),
        config.cache_dir.display(),
        config.resolved_provider()
    );
    let store = Arc::new(JsonRecordStore::new(cli.store.clone()));
    let orchestrator = ImageOrchestrator::from_config(&config, store)?;
    let warmed = orchestrator.warm_up();
    debug!(
        "warm-up indexed {} files, seeded {} entries",
        warmed.indexed_files, warmed.seeded
    );
    Ok((orchestrator, warmed))
}

fn run_generate(orchestrator: &ImageOrchestrator, args: GenerateArgs) -> Result<i32> {
    let quality = match args.quality.as_deref() {
        Some(raw) => match QualityTier::parse(raw) {
            Some(tier) => Some(tier),
            None => bail!("unknown quality tier: {raw}"),
        },
        None => None,
    };
    let style = match args.style.as_deref() {
        Some(raw) => raw.parse::<ImageStyle>().map_err(anyhow::Error::msg)?,
        None => ImageStyle::default(),
    };
    let request = GenerationRequest::builder(args.title)
        .description(args.description)
        .profile_text(args.profile)
        .style(style)
        .reference_image(args.reference)
        .quality(quality)
        .size_hint(args.size)
        .target_id(args.target)
        .force_refresh(args.force)
        .build();
    let result = orchestrator.generate_image_for(&request, Some(&log_progress));
    emit_generation(result, args.payload)
}

fn run_fill(orchestrator: &ImageOrchestrator) -> Result<i32> {
    let outcomes = match orchestrator.generate_missing_images(Some(&log_progress)) {
        Ok(outcomes) => outcomes,
        Err(err) => return emit_failure(&err),
    };
    let failed = outcomes.iter().filter(|(_, result)| result.is_err()).count();
    let rows: Vec<Value> = outcomes
        .into_iter()
        .map(|(target_id, result)| match result {
            Ok(outcome) => json!({
                "targetId": target_id,
                "success": true,
                "outcome": outcome_json(outcome, false),
            }),
            Err(err) => json!({ "targetId": target_id, "success": false, "error": err }),
        })
        .collect();
    info!("filled {} targets, {failed} failed", rows.len() - failed);
    emit(json!({ "success": failed == 0, "results": rows }))?;
    Ok(if failed == 0 { 0 } else { 1 })
}

fn emit_generation(result: Result<ImageOutcome, GenerationError>, payload: bool) -> Result<i32> {
    match result {
        Ok(outcome) => {
            emit(json!({ "success": true, "outcome": outcome_json(outcome, payload) }))?;
            Ok(0)
        }
        Err(err) => emit_failure(&err),
    }
}

fn emit_failure(err: &GenerationError) -> Result<i32> {
    emit(json!({ "success": false, "error": err }))?;
    Ok(1)
}

fn emit(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

/// Data URIs are large; unless asked for, only their size is printed.
fn outcome_json(outcome: ImageOutcome, payload: bool) -> Value {
    let mut value = serde_json::to_value(&outcome).unwrap_or(Value::Null);
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "imageUrl".to_string(),
            payload_field(outcome.image_url, payload),
        );
    }
    value
}

fn payload_field(image_url: String, payload: bool) -> Value {
    if payload || !image_url.starts_with("data:") {
        Value::String(image_url)
    } else {
        json!({ "dataUriChars": image_url.len() })
    }
}

fn log_progress(stage: ProgressStage, percent: u8) {
    debug!("progress {} {percent}%", stage.as_str());
}
