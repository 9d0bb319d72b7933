use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info};
use simplelog::{Config, WriteLogger};

use pagepool::panic_handler;
use pagepool::pdf::{
    Command, CurrentValue, Decoder, Effect, RenderPipeline, RenderRequest, SourceFetcher,
    ViewState, asset_hash, local_path,
};
use pagepool::settings;

#[derive(Parser)]
#[command(name = "pagepool")]
#[command(version)]
#[command(about = "Render document pages to images through a layered cache")]
struct Cli {
    /// Log file path
    #[arg(long, default_value = "pagepool.log", global = true)]
    log_file: PathBuf,

    /// Log level (overrides config file)
    #[arg(short = 'v', long, global = true)]
    log_level: Option<LevelFilter>,

    /// Render worker threads (overrides config file)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one page to a PNG file
    Render(RenderArgs),
    /// Print the page count of a document
    Info {
        /// Path or URL of the document
        source: String,
        /// Freshness token; computed from the file when omitted
        #[arg(long)]
        asset_hash: Option<String>,
    },
}

#[derive(Args)]
struct RenderArgs {
    /// Path or URL of the document
    source: String,

    /// Page number, 1-based; fractions are floored
    #[arg(short, long, default_value_t = 1.0)]
    page: f64,

    /// Scale factor
    #[arg(short, long, default_value_t = 1.0)]
    zoom: f64,

    /// Background color (hex, rgb()/rgba() or a color name)
    #[arg(short, long)]
    background: Option<String>,

    /// Output PNG path
    #[arg(short, long, default_value = "page.png")]
    output: PathBuf,

    /// Freshness token; computed from the file when omitted
    #[arg(long)]
    asset_hash: Option<String>,

    /// Re-render whenever the source file changes
    #[arg(long)]
    watch: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    panic_handler::initialize_panic_handler();

    // The logger passes everything; the global max level does the filtering
    // so it can be narrowed once the settings are known.
    WriteLogger::init(
        LevelFilter::Trace,
        Config::default(),
        File::create(&cli.log_file)
            .with_context(|| format!("creating log file {}", cli.log_file.display()))?,
    )?;
    log::set_max_level(log_level(cli.log_level, None));

    settings::load_settings();
    log::set_max_level(log_level(
        cli.log_level,
        Some(settings::get_log_level().filter()),
    ));

    info!("Starting pagepool {}", env!("CARGO_PKG_VERSION"));

    let mut config = settings::pipeline_config();
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    let fetcher = Arc::new(SourceFetcher::new(settings::get_http_timeout()));
    let pipeline = RenderPipeline::with_config(fetcher, decoder()?, config);

    let result = match cli.command {
        Commands::Render(args) => run_render(&pipeline, &args),
        Commands::Info { source, asset_hash } => run_info(&pipeline, &source, asset_hash),
    };

    if let Err(e) = &result {
        log::error!("{e:#}");
    }
    info!("Shutting down pagepool");
    result
}

/// Effective level: the flag wins, then the settings file, then `info`
/// (used while the settings are still loading)
fn log_level(flag: Option<LevelFilter>, configured: Option<LevelFilter>) -> LevelFilter {
    flag.or(configured).unwrap_or(LevelFilter::Info)
}

#[cfg(feature = "pdf")]
fn decoder() -> Result<Arc<dyn Decoder>> {
    Ok(Arc::new(pagepool::pdf::MupdfDecoder))
}

#[cfg(not(feature = "pdf"))]
fn decoder() -> Result<Arc<dyn Decoder>> {
    anyhow::bail!("pagepool was built without the `pdf` feature")
}

/// Asset hash of a local source, if it is a readable file
fn local_freshness(source: &str) -> Option<String> {
    let path = local_path(source)?;
    match asset_hash(&path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            log::debug!("No asset hash for {}: {e}", path.display());
            None
        }
    }
}

fn run_info(pipeline: &RenderPipeline, source: &str, asset_hash: Option<String>) -> Result<()> {
    let freshness = asset_hash.or_else(|| local_freshness(source));
    let pages = pipeline
        .load_page_count(source, freshness.as_deref())
        .with_context(|| format!("opening {source}"))?;
    println!("{source}: {pages} pages");
    Ok(())
}

fn run_render(pipeline: &RenderPipeline, args: &RenderArgs) -> Result<()> {
    let background = args
        .background
        .clone()
        .unwrap_or_else(settings::get_default_background);
    let freshness = args
        .asset_hash
        .clone()
        .or_else(|| local_freshness(&args.source));

    // Binding the source last yields a single round of effects.
    let mut view = ViewState::new();
    let mut effects = Vec::new();
    for command in [
        Command::SetPageNumber(args.page),
        Command::SetScale {
            x: args.zoom,
            y: args.zoom,
        },
        Command::SetBackground(background),
        Command::SetFreshness(freshness),
        Command::SetSource(args.source.clone()),
    ] {
        effects.extend(view.apply(command));
    }
    perform(pipeline, &view, effects, &args.output)?;

    if args.watch {
        watch_and_render(pipeline, &mut view, args)?;
    }
    Ok(())
}

/// Carry out what a view state change asked for
fn perform(pipeline: &RenderPipeline, view: &ViewState, effects: Vec<Effect>, output: &Path) -> Result<()> {
    for effect in effects {
        match effect {
            Effect::Invalidate(source) => {
                let evicted = pipeline.invalidate(&source);
                info!("Evicted {} entries for {source}", evicted.total());
            }
            Effect::RefreshPageCount => {
                if let Some(source) = &view.source {
                    let pages = pipeline
                        .load_page_count(source, view.freshness.as_deref())
                        .with_context(|| format!("opening {source}"))?;
                    info!("{source} has {pages} pages");
                }
            }
            Effect::RequestImage(request) => render_request(pipeline, &request, output)?,
            Effect::Clear => info!("No source bound, nothing to render"),
        }
    }
    Ok(())
}

fn render_request(pipeline: &RenderPipeline, request: &RenderRequest, output: &Path) -> Result<()> {
    let image = match pipeline.request_image(request) {
        CurrentValue::Ready(image) => image,
        placeholder @ CurrentValue::Placeholder { .. } => {
            info!("Waiting for {}", pipeline.image_key(request));
            placeholder
                .wait()
                .with_context(|| format!("rendering {}", request.source))?
        }
    };

    save(&image, output)?;
    println!(
        "Wrote {} ({}x{})",
        output.display(),
        image.width(),
        image.height()
    );
    Ok(())
}

fn save(image: &pagepool::RenderedImage, output: &Path) -> Result<()> {
    image
        .save(output)
        .with_context(|| format!("writing {}", output.display()))
}

#[cfg(feature = "watch")]
fn watch_and_render(pipeline: &RenderPipeline, view: &mut ViewState, args: &RenderArgs) -> Result<()> {
    use pagepool::pdf::FileWatcher;

    let path = local_path(&args.source)
        .with_context(|| format!("{} is not a local file", args.source))?;

    let (tx, rx) = flume::unbounded();
    let mut watcher = FileWatcher::new(tx).context("starting file watcher")?;
    watcher
        .watch(&path, &args.source)
        .with_context(|| format!("watching {}", path.display()))?;
    println!("Watching {} (Ctrl+C to stop)", path.display());

    for change in rx.iter() {
        info!("Changed: {}", change.sources.join(", "));
        // An explicit --asset-hash would pin the old key; recompute instead.
        view.freshness = local_freshness(&args.source);
        let effects = view.apply(Command::Reload);
        if let Err(e) = perform(pipeline, view, effects, &args.output) {
            eprintln!("Render failed: {e:#}");
        }
    }
    Ok(())
}

#[cfg(not(feature = "watch"))]
fn watch_and_render(_pipeline: &RenderPipeline, _view: &mut ViewState, _args: &RenderArgs) -> Result<()> {
    anyhow::bail!("pagepool was built without the `watch` feature")
}
