use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use rekindle_contracts::costs::cost_estimate;
use rekindle_contracts::errors::error_code;
use rekindle_contracts::images::GeneratedImage;
use rekindle_contracts::photos::{Orientation, StyleSettings};
use rekindle_contracts::scenarios::scenario_catalog;
use rekindle_engine::{classify_photo, BatchOutcome, SceneEngine};

#[derive(Debug, Parser)]
#[command(name = "rekindle", version, about = "Composite family-scene builder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the scenario catalog.
    Scenarios,
    /// Classify photos into historical, current or background roles.
    Classify(ClassifyArgs),
    /// Generate one composite scene, optionally followed by edits.
    Generate(GenerateArgs),
    /// Generate several scenarios sequentially over one photo set.
    Batch(BatchArgs),
    /// Restore and enhance a single photo.
    Enhance(EnhanceArgs),
    /// Estimate the cost of a number of operations.
    Cost(CostArgs),
}

#[derive(Debug, Parser)]
struct ClassifyArgs {
    #[arg(long = "photo", required = true)]
    photos: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long = "photo", required = true)]
    photos: Vec<PathBuf>,
    #[arg(long)]
    scenario: String,
    #[arg(long, default_value = "landscape")]
    orientation: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Force the simulated backend even when a credential is configured.
    #[arg(long)]
    demo: bool,
    /// Free-text refinement applied after generation; repeatable, in order.
    #[arg(long = "edit")]
    edits: Vec<String>,
    #[arg(long, default_value = "western")]
    cultural_style: String,
    #[arg(long, default_value = "modern")]
    time_period: String,
    #[arg(long, default_value = "formal")]
    clothing_style: String,
    #[arg(long, default_value = "indoor")]
    location_style: String,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "photo", required = true)]
    photos: Vec<PathBuf>,
    /// Scenario ids to run, in order; defaults to the full catalog.
    #[arg(long = "scenario")]
    scenarios: Vec<String>,
    #[arg(long, default_value = "landscape")]
    orientation: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    demo: bool,
}

#[derive(Debug, Parser)]
struct EnhanceArgs {
    #[arg(long)]
    photo: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    demo: bool,
}

#[derive(Debug, Parser)]
struct CostArgs {
    #[arg(long, default_value_t = 1)]
    operations: u64,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("rekindle error [{}]: {err:#}", error_code(&err));
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Scenarios => {
            run_scenarios();
            Ok(0)
        }
        Command::Classify(args) => {
            run_classify(args)?;
            Ok(0)
        }
        Command::Generate(args) => {
            run_generate(args)?;
            Ok(0)
        }
        Command::Batch(args) => run_batch(args),
        Command::Enhance(args) => {
            run_enhance(args)?;
            Ok(0)
        }
        Command::Cost(args) => {
            run_cost(args);
            Ok(0)
        }
    }
}

fn run_scenarios() {
    for (id, scenario) in scenario_catalog() {
        println!("{id:<12} {} ({})", scenario.title, scenario.emotional_tone);
        println!("{:<12} {}", "", scenario.description);
    }
}

fn run_classify(args: ClassifyArgs) -> Result<()> {
    for path in &args.photos {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let role = classify_photo(&bytes)?;
        println!("{}\t{role}", path.display());
    }
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let orientation = parse_orientation(&args.orientation)?;
    let style = StyleSettings {
        cultural_style: args.cultural_style.clone(),
        time_period: args.time_period.clone(),
        clothing_style: args.clothing_style.clone(),
        location_style: args.location_style.clone(),
    };

    let mut engine = engine_for(&args.out, args.events.as_deref(), args.demo)?;
    add_photos(&mut engine, &args.photos)?;

    let image = engine.generate(&args.scenario, orientation, &style)?;
    let path = write_image(&args.out, &image, "scene")?;
    println!(
        "generated {} ({}, {} people expected) -> {}",
        image.scenario_title,
        image.quality,
        image.expected_people.unwrap_or_default(),
        path.display()
    );

    let mut latest = image;
    for (idx, edit_text) in args.edits.iter().enumerate() {
        latest = engine.edit(Some(&latest.id), edit_text, orientation)?;
        let path = write_image(&args.out, &latest, &format!("edit-{}", idx + 1))?;
        println!("edited ({edit_text}) -> {}", path.display());
    }
    Ok(())
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let orientation = parse_orientation(&args.orientation)?;
    let scenario_ids = if args.scenarios.is_empty() {
        scenario_catalog().keys().cloned().collect()
    } else {
        args.scenarios.clone()
    };

    let mut engine = engine_for(&args.out, args.events.as_deref(), args.demo)?;
    add_photos(&mut engine, &args.photos)?;

    let outcomes = engine.run_batch(&scenario_ids, orientation, &StyleSettings::default())?;
    let mut failures = 0;
    for outcome in &outcomes {
        match outcome {
            BatchOutcome::Success { scenario_id, image } => {
                let path = write_image(&args.out, image, scenario_id)?;
                println!("{scenario_id}: ok -> {}", path.display());
            }
            BatchOutcome::Failure {
                scenario_id,
                code,
                message,
            } => {
                failures += 1;
                println!("{scenario_id}: failed [{code}] {message}");
            }
        }
    }
    println!("{} succeeded, {failures} failed", outcomes.len() - failures);
    Ok(if failures == outcomes.len() && !outcomes.is_empty() {
        1
    } else {
        0
    })
}

fn run_enhance(args: EnhanceArgs) -> Result<()> {
    let mut engine = engine_for(&args.out, args.events.as_deref(), args.demo)?;
    let bytes = fs::read(&args.photo)
        .with_context(|| format!("failed reading {}", args.photo.display()))?;
    let name = args
        .photo
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "photo".to_string());
    let id = engine.add_photo(&name, bytes, &mime_for_path(&args.photo))?;

    engine.enhance_photo(&id, args.prompt.as_deref())?;

    let photo = engine
        .session()
        .photo(&id)
        .context("enhanced photo missing from session")?;
    fs::create_dir_all(&args.out)?;
    let path = args
        .out
        .join(format!("enhanced{}", extension_for_mime(&photo.mime_type)));
    fs::write(&path, &photo.bytes)?;
    println!("enhanced {} -> {}", args.photo.display(), path.display());
    Ok(())
}

fn run_cost(args: CostArgs) {
    let breakdown = cost_estimate(args.operations);
    println!(
        "{} operation(s) x {} {} = {:.4} {}",
        breakdown.operations,
        breakdown.per_operation_usd,
        breakdown.currency,
        breakdown.total_usd,
        breakdown.currency
    );
}

fn engine_for(out: &Path, events: Option<&Path>, demo: bool) -> Result<SceneEngine> {
    let events_path = events
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out.join("events.jsonl"));
    let api_key = if demo {
        None
    } else {
        env::var("REKINDLE_API_KEY")
            .or_else(|_| env::var("GEMINI_API_KEY"))
            .ok()
    };
    let engine = SceneEngine::new(events_path, api_key)?;
    if engine.is_simulated() && !demo {
        eprintln!("no API key configured; running against the simulated backend");
    }
    Ok(engine)
}

fn add_photos(engine: &mut SceneEngine, paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "photo".to_string());
        let id = engine.add_photo(&name, bytes, &mime_for_path(path))?;
        let photo = engine.session().photo(&id).context("photo just added")?;
        println!("{name}: classified as {}", photo.role);
    }
    Ok(())
}

fn write_image(out: &Path, image: &GeneratedImage, stem: &str) -> Result<PathBuf> {
    fs::create_dir_all(out)
        .with_context(|| format!("failed creating {}", out.display()))?;
    let path = out.join(format!(
        "{stem}{}",
        extension_for_mime(&image.payload.mime_type)
    ));
    let bytes = image
        .payload
        .decode()
        .context("generated image payload is not decodable")?;
    fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(path)
}

fn parse_orientation(value: &str) -> Result<Orientation> {
    match value.to_lowercase().as_str() {
        "landscape" => Ok(Orientation::Landscape),
        "portrait" => Ok(Orientation::Portrait),
        "square" => Ok(Orientation::Square),
        other => bail!("unknown orientation {other} (expected landscape, portrait or square)"),
    }
}

fn mime_for_path(path: &Path) -> String {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "image/png",
    }
    .to_string()
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        _ => ".png",
    }
}
