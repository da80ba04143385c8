use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use codecs::CodecGateway;
use fs_model::{DirectoryModel, SortDirection, SortKey};
use std::path::PathBuf;
use thumbnail_cache::{
    invalidate, produce, Environment, ProductionScheduler, SourceEntry, ThumbnailEvent,
    ThumbnailSize,
};

#[derive(Parser)]
#[command(name = "glance")]
#[command(about = "Image browser with a persistent freedesktop-style thumbnail cache")]
struct Cli {
    /// Produce one thumbnail at the given size tag and exit
    /// (producer child mode; pass the source URI after `--`)
    #[arg(long, value_name = "TAG")]
    thumbnail: Option<ThumbnailSize>,

    /// Sweep stale entries out of the thumbnail cache and print counts
    #[arg(long)]
    cleanup: bool,

    /// Directory to browse, or the source URI in child mode
    target: Option<String>,

    /// Thumbnail size tag for browsing (normal, large, x-large, xx-large)
    #[arg(long, default_value = "large")]
    size: ThumbnailSize,

    /// Sort order of the listing
    #[arg(long, value_enum, default_value = "name")]
    sort: SortArg,

    /// Sort descending instead of ascending
    #[arg(long)]
    descending: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Name,
    Mtime,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Some(size) = cli.thumbnail {
        let uri = cli.target.context("--thumbnail requires a source URI after --")?;
        return run_child(size, &uri);
    }
    if cli.cleanup {
        return run_cleanup();
    }
    let dir = cli.target.context("expected a directory to browse")?;
    run_browse(PathBuf::from(dir), cli.size, cli.sort, cli.descending)
}

/// Producer child: render one source into the cache. The exit code is the
/// whole contract; the scheduler only distinguishes success from failure.
fn run_child(size: ThumbnailSize, uri: &str) -> Result<()> {
    let env = Environment::new()?;
    let gateway = CodecGateway::with_builtin();
    produce(&env, &gateway, uri, size).with_context(|| format!("thumbnailing {uri}"))?;
    Ok(())
}

fn run_cleanup() -> Result<()> {
    let env = Environment::new()?;
    let stats = invalidate(&env);
    println!(
        "examined {} thumbnails: {} deleted, {} kept, {} skipped",
        stats.examined, stats.deleted, stats.kept, stats.skipped
    );
    Ok(())
}

/// Headless browse: enumerate the directory, drive the scheduler to
/// completion, and print one status line per entry.
fn run_browse(dir: PathBuf, size: ThumbnailSize, sort: SortArg, descending: bool) -> Result<()> {
    let env = Environment::new()?;
    env.prepare()?;
    let gateway = CodecGateway::with_builtin();

    let model = DirectoryModel::new(&dir, gateway.supported_extensions())
        .with_context(|| format!("opening {}", dir.display()))?;
    let key = match sort {
        SortArg::Name => SortKey::Name,
        SortArg::Mtime => SortKey::ModificationTime,
    };
    let direction = if descending {
        SortDirection::Descending
    } else {
        SortDirection::Ascending
    };
    model.set_sort(key, direction);
    model.refresh().with_context(|| format!("listing {}", dir.display()))?;

    let files = model.files();
    println!(
        "{}: {} images, {} subdirectories",
        dir.display(),
        files.len(),
        model.subdirectories().len()
    );

    let sources: Vec<SourceEntry> = files
        .iter()
        .map(|f| SourceEntry { uri: f.uri.clone(), mtime: f.mtime, size: f.size })
        .collect();

    let (tx, rx) = std::sync::mpsc::channel();
    let child_exe = std::env::current_exe().context("resolving the producer binary")?;
    let scheduler = ProductionScheduler::new(env, child_exe, tx);
    scheduler.restart(sources, size);

    let (mut ready, mut failed) = (0usize, 0usize);
    for event in rx {
        match event {
            ThumbnailEvent::Ready { uri, low_quality } => {
                ready += 1;
                if low_quality {
                    println!("ready (low quality)  {uri}");
                } else {
                    println!("ready                {uri}");
                }
            }
            ThumbnailEvent::Failed { uri } => {
                failed += 1;
                println!("failed               {uri}");
            }
            ThumbnailEvent::Finished => break,
        }
    }
    scheduler.wait();

    println!("{ready} thumbnails ready, {failed} failed");
    Ok(())
}
