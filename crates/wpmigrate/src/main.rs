use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use wpmigrate_core::batch::{BatchResult, BatchRunner, CancelToken, Progress, RecordOutcome};
use wpmigrate_core::categories::CategoryMigration;
use wpmigrate_core::cleaner::{CleanMigration, clean_filter};
use wpmigrate_core::dedupe::{ResourceDeduper, UrlNormalizer};
use wpmigrate_core::images::ImageMigration;
use wpmigrate_core::record::{QueryFilter, Record};
use wpmigrate_core::runtime::{MigrateRuntime, ResolutionContext, select_site};

const CANCELLED_EXIT_CODE: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "wpmigrate",
    version,
    about = "Idempotent bulk content migrations for WordPress sites"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Migrate(MigrateArgs),
    Cleaner(CleanerArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[command(subcommand)]
    command: MigrateSubcommand,
}

#[derive(Debug, Subcommand)]
enum MigrateSubcommand {
    #[command(about = "Import external images into the media library and rewrite their URLs")]
    Images {
        #[arg(long, value_name = "ID")]
        site: Option<u64>,
    },
    #[command(about = "Assign categories from title patterns")]
    Categories {
        #[arg(long, value_name = "ID")]
        site: Option<u64>,
    },
}

#[derive(Debug, Args)]
struct CleanerArgs {
    #[command(subcommand)]
    command: CleanerSubcommand,
}

#[derive(Debug, Subcommand)]
enum CleanerSubcommand {
    #[command(name = "clean-posts", about = "Run the markup cleaning chain over posts")]
    CleanPosts {
        #[arg(value_name = "SITE_ID")]
        site_id: Option<u64>,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    let runtime = load_runtime(cli.config)?;
    if cli.diagnostics {
        println!("[diagnostics]\n{}\n", runtime.diagnostics());
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupt received; stopping after the current record");
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let result = match command {
        Commands::Migrate(MigrateArgs { command }) => match command {
            MigrateSubcommand::Images { site } => run_migrate_images(&runtime, site, &cancel)?,
            MigrateSubcommand::Categories { site } => {
                run_migrate_categories(&runtime, site, &cancel)?
            }
        },
        Commands::Cleaner(CleanerArgs { command }) => match command {
            CleanerSubcommand::CleanPosts { site_id } => {
                run_clean_posts(&runtime, site_id, &cancel)?
            }
        },
    };

    if result.cancelled {
        println!("status: cancelled");
        return Ok(ExitCode::from(CANCELLED_EXIT_CODE));
    }
    Ok(ExitCode::SUCCESS)
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_runtime(config: Option<PathBuf>) -> Result<MigrateRuntime> {
    dotenvy::dotenv().ok();
    let context = ResolutionContext::from_process()?;
    MigrateRuntime::load(&context, config.as_deref())
}

fn query_filter(runtime: &MigrateRuntime) -> QueryFilter {
    QueryFilter::for_kinds(
        &runtime.config.query.post_types,
        runtime.config.query.status,
    )
}

fn run_migrate_images(
    runtime: &MigrateRuntime,
    site: Option<u64>,
    cancel: &CancelToken,
) -> Result<BatchResult> {
    let site_id = select_site(&runtime.config.site, site, false)?;
    let mut store = runtime.open_site(site_id)?;
    info!("migrate images on {}", store.describe());

    let normalizer = UrlNormalizer::from_config(&runtime.config.images)?;
    let deduper = ResourceDeduper::new(normalizer, runtime.http_fetcher()?);
    let mut migration = ImageMigration::new(deduper)?;
    let mut progress = BarProgress::default();
    let result = BatchRunner::new(&mut progress, cancel.clone()).run(
        store.as_mut(),
        &query_filter(runtime),
        &mut migration,
    )?;

    print_summary("migrate images", site_id, &result);
    let stats = migration.stats();
    println!("images.imported: {}", migration.imported());
    println!("images.cache_hits: {}", stats.cache_hits);
    println!("images.failed: {}", stats.failures);
    Ok(result)
}

fn run_migrate_categories(
    runtime: &MigrateRuntime,
    site: Option<u64>,
    cancel: &CancelToken,
) -> Result<BatchResult> {
    let site_id = select_site(&runtime.config.site, site, false)?;
    let mut store = runtime.open_site(site_id)?;
    info!("migrate categories on {}", store.describe());

    let mut migration = CategoryMigration::from_config(&runtime.config.categories)?;
    let mut progress = BarProgress::default();
    let result = BatchRunner::new(&mut progress, cancel.clone()).run(
        store.as_mut(),
        &query_filter(runtime),
        &mut migration,
    )?;

    print_summary("migrate categories", site_id, &result);
    for (name, id) in migration.term_ids() {
        println!("categories.term: {name}={id}");
    }
    Ok(result)
}

fn run_clean_posts(
    runtime: &MigrateRuntime,
    site_id: Option<u64>,
    cancel: &CancelToken,
) -> Result<BatchResult> {
    let site_id = select_site(&runtime.config.site, site_id, true)?;
    let mut store = runtime.open_site(site_id)?;
    info!("cleaner clean-posts on {}", store.describe());

    let mut migration = CleanMigration::from_config(&runtime.config.cleaner);
    let mut progress = BarProgress::default();
    let result = BatchRunner::new(&mut progress, cancel.clone()).run(
        store.as_mut(),
        &clean_filter(&runtime.config.cleaner),
        &mut migration,
    )?;

    print_summary("cleaner clean-posts", site_id, &result);
    println!("rules: {}", migration.chain().rule_names().join(","));
    Ok(result)
}

fn print_summary(command: &str, site_id: u64, result: &BatchResult) {
    println!("{command}");
    println!("site: {site_id}");
    println!("processed: {}", result.processed);
    println!("updated: {}", result.updated);
    println!("skipped: {}", result.skipped);
    println!("failed: {}", result.failed);
    for failure in &result.failures {
        println!(
            "failed.record: {} \"{}\" {}",
            failure.record_id, failure.title, failure.reason
        );
    }
}

#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl Progress for BarProgress {
    fn start(&mut self, label: &str, total: usize) {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.green/dim}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("█▓░"));
        }
        bar.set_message(label.to_string());
        self.bar = Some(bar);
    }

    fn record(&mut self, record: &Record, outcome: RecordOutcome) {
        if let Some(bar) = &self.bar {
            if outcome == RecordOutcome::Failed {
                bar.println(format!("record {} failed", record.id));
            }
            bar.inc(1);
        }
    }

    fn finish(&mut self, _result: &BatchResult) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
