use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use banana_contracts::events::EventLog;
use banana_contracts::history::GeneratedImage;
use banana_contracts::GenerateError;
use banana_engine::codec::extension_for;
use banana_engine::session::format_byte_count;
use banana_engine::{EngineConfig, Generator, ImageCache, Session};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "banana-rs", version, about = "Gemini image generation with a local cache")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Overrides BANANA_CACHE_DIR.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Append generation events as JSON lines to this file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    /// Overrides GEMINI_IMAGE_MODEL.
    #[arg(long, global = true)]
    model: Option<String>,
    /// Overrides BANANA_MIN_REQUEST_INTERVAL_MS.
    #[arg(long, global = true)]
    min_interval_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Batch(BatchArgs),
    Edit(EditArgs),
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "prompt")]
    prompts: Vec<String>,
    /// One prompt per line; blank lines are ignored.
    #[arg(long)]
    prompts_file: Option<PathBuf>,
    /// Paired with prompts by position.
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long = "step")]
    steps: Vec<String>,
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    Size,
    Clear,
}

#[tokio::main]
async fn main() {
    init_tracing();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("banana-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("banana_engine=info,warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = resolve_config(&cli.global)?;
    match cli.command {
        Command::Cache(action) => run_cache(&config, action),
        Command::Generate(args) => {
            let mut session = open_session(&config, cli.global.events.as_deref())?;
            run_generate(&mut session, args).await
        }
        Command::Batch(args) => {
            let mut session = open_session(&config, cli.global.events.as_deref())?;
            run_batch(&mut session, args).await
        }
        Command::Edit(args) => {
            let mut session = open_session(&config, cli.global.events.as_deref())?;
            run_edit(&mut session, args).await
        }
    }
}

fn resolve_config(global: &GlobalArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("invalid environment configuration")?;
    if let Some(dir) = &global.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(model) = &global.model {
        config.model = model.clone();
    }
    if let Some(ms) = global.min_interval_ms {
        config.min_request_interval = Duration::from_millis(ms);
    }
    Ok(config)
}

fn open_session(config: &EngineConfig, events: Option<&Path>) -> Result<Session> {
    let mut generator =
        Generator::from_config(config).context("cannot start the Gemini client")?;
    if let Some(path) = events {
        let log = EventLog::new(path, Uuid::new_v4().to_string());
        info!(path = %log.path().display(), session_id = log.session_id(), "recording events");
        generator = generator.with_events(log);
    }
    Ok(Session::new(generator))
}

fn run_cache(config: &EngineConfig, action: CacheCommand) -> Result<i32> {
    let cache = ImageCache::open(&config.cache_dir, config.cache_limits);
    match action {
        CacheCommand::Size => {
            let bytes = cache.size();
            println!("{} ({bytes} bytes) in {}", format_byte_count(bytes), cache.dir().display());
        }
        CacheCommand::Clear => {
            cache.clear();
            println!("Cleared {}", cache.dir().display());
        }
    }
    Ok(0)
}

async fn run_generate(session: &mut Session, args: GenerateArgs) -> Result<i32> {
    let input = read_optional(args.input.as_deref())?;
    let image = session
        .generate(&args.prompt, input.as_deref())
        .await
        .map_err(explain)?;
    let path = write_image(&args.out, image)?;
    println!("{}", path.display());
    Ok(0)
}

async fn run_batch(session: &mut Session, args: BatchArgs) -> Result<i32> {
    let mut prompts = args.prompts;
    if let Some(file) = &args.prompts_file {
        let text = fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        prompts.extend(prompt_lines(&text));
    }
    if prompts.is_empty() {
        bail!("batch needs at least one --prompt or a non-empty --prompts-file");
    }
    let inputs = args
        .inputs
        .iter()
        .map(|path| read_optional(Some(path)))
        .collect::<Result<Vec<_>>>()?;

    let cancel = cancel_on_ctrl_c();
    let mut progress = session.progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow();
            if current.completed > 0 {
                eprintln!("[{}/{}]", current.completed, current.total);
            }
        }
    });
    let result = session.batch_generate(&prompts, &inputs, &cancel).await;
    reporter.abort();
    let ids = result.map_err(explain)?;

    for id in &ids {
        if let Some(image) = session.history().get(*id) {
            let path = write_image(&args.out, image)?;
            println!("{}\t{}", path.display(), image.prompt);
        }
    }
    if cancel.is_cancelled() {
        warn!(produced = ids.len(), total = prompts.len(), "batch interrupted");
    }
    eprintln!("{} of {} images generated", ids.len(), prompts.len());
    Ok(if ids.is_empty() { 1 } else { 0 })
}

async fn run_edit(session: &mut Session, args: EditArgs) -> Result<i32> {
    let input = read_optional(args.input.as_deref())?;
    let cancel = cancel_on_ctrl_c();
    let ids = session
        .iterative_edit(&args.prompt, &args.steps, input.as_deref(), &cancel)
        .await
        .map_err(explain)?;
    for (step, id) in ids.iter().enumerate() {
        if let Some(image) = session.history().get(*id) {
            let path = write_image(&args.out, image)?;
            println!("step {}\t{}", step + 1, path.display());
        }
    }
    Ok(0)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; stopping after the current request");
            child.cancel();
        }
    });
    token
}

fn explain(err: GenerateError) -> anyhow::Error {
    if err.is_retryable() {
        anyhow::Error::new(err).context("generation failed (retrying later may help)")
    } else {
        anyhow::Error::new(err).context("generation failed")
    }
}

fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>> {
    path.map(|path| fs::read(path).with_context(|| format!("failed to read {}", path.display())))
        .transpose()
}

fn prompt_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn image_file_name(image: &GeneratedImage) -> String {
    let id = image.id.simple().to_string();
    format!(
        "{}-{}.{}",
        image.created_at.format("%Y%m%dT%H%M%S"),
        &id[..8],
        extension_for(&image.image_bytes)
    )
}

fn write_image(out_dir: &Path, image: &GeneratedImage) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let path = out_dir.join(image_file_name(image));
    fs::write(&path, &image.image_bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
