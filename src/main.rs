use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use legacy_migrator::config::{CacheBackendKind, MigrationConfig};
use legacy_migrator::invision::{self, InvisionOptions};
use legacy_migrator::migration::cache::{CacheBackend, MemoryCacheBackend, PgCacheBackend};
use legacy_migrator::migration::orchestrator::MigrationOrchestrator;
use legacy_migrator::migration::report::{LogReporter, render_summary};
use legacy_migrator::migration::source::PgSourceStore;
use legacy_migrator::migration::target::PgTargetStore;
use legacy_migrator::migration::{ImportContext, MappingCache, RunOptions, state};
use legacy_migrator::{db, init_logger};

/// Exit code for a `--strict` run that recorded failed records.
const EXIT_FAILED_RECORDS: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "legacy-migrator",
    about = "Import an Invision Community database in dependency order"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the selected importers (all when none are named).
    Run(RunArgs),
    /// Print the resolved import order without touching anything.
    Plan(PlanArgs),
    /// Forget tagged mappings and completion markers.
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Entities to import, e.g. `users topics`.
    entities: Vec<String>,

    /// Named source connection (`MIGRATION_CONNECTION_<NAME>_URL`).
    #[arg(long)]
    connection: Option<String>,

    /// Rows fetched per page.
    #[arg(long)]
    batch_size: Option<u64>,

    /// Pages processed between mapping cache saves.
    #[arg(long)]
    checkpoint_every: Option<u64>,

    /// Stop each importer after this many records.
    #[arg(long)]
    limit: Option<u64>,

    /// Skip this many eligible records in each importer.
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Report what would happen without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Also run optional follow-up importers.
    #[arg(long)]
    with_follow_ups: bool,

    /// Skip importers that already finished a full pass.
    #[arg(long)]
    skip_completed: bool,

    /// Forget the selected importers' mappings before running.
    #[arg(long)]
    fresh: bool,

    /// Exit with status 2 when any record failed.
    #[arg(long)]
    strict: bool,

    /// Write the full JSON report to this file.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    entities: Vec<String>,

    #[arg(long)]
    with_follow_ups: bool,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    entities: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let config = MigrationConfig::from_env()?;
    let orchestrator = MigrationOrchestrator::with_importers(invision::importers(&InvisionOptions {
        placeholder_order_items: config.order_placeholder_items,
    }))?;

    match cli.command {
        Command::Plan(args) => {
            print_plan(&orchestrator, &args)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup(args) => {
            let cache = open_cache(&config).await?;
            for (entity, removed) in orchestrator.cleanup(&args.entities, &cache).await? {
                println!("{entity}: {removed} mappings removed");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run(&orchestrator, &config, args).await,
    }
}

fn print_plan(orchestrator: &MigrationOrchestrator, args: &PlanArgs) -> Result<(), Box<dyn Error>> {
    let plan = orchestrator.plan(&args.entities, args.with_follow_ups)?;

    for (position, step) in plan.steps.iter().enumerate() {
        let suffix = if step.follow_up { " (follow-up)" } else { "" };
        println!("{}. {}{}", position + 1, step.entity, suffix);
        for dep in &step.dependencies {
            println!("     {:?} {}: {}", dep.kind, dep.entity, dep.reason);
        }
    }
    for requirement in &plan.external {
        println!(
            "requires completed {} (for {}): {}",
            requirement.dependency.entity, requirement.entity, requirement.dependency.reason
        );
    }
    Ok(())
}

async fn open_cache(config: &MigrationConfig) -> Result<MappingCache, Box<dyn Error>> {
    let backend: Arc<dyn CacheBackend> = match config.cache_backend {
        CacheBackendKind::File => {
            if let Some(parent) = config.cache_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(MemoryCacheBackend::open(&config.cache_path)?)
        }
        CacheBackendKind::Postgres => {
            let pool = db::connect(&config.target_url()?, config.max_connections).await?;
            state::run_migrations(&pool).await?;
            Arc::new(PgCacheBackend::new(pool))
        }
    };
    Ok(MappingCache::new(config.source_name.clone(), backend))
}

async fn run(
    orchestrator: &MigrationOrchestrator,
    config: &MigrationConfig,
    args: RunArgs,
) -> Result<ExitCode, Box<dyn Error>> {
    let plan = orchestrator.plan(&args.entities, args.with_follow_ups)?;
    if plan.is_empty() {
        println!("nothing to import");
        return Ok(ExitCode::SUCCESS);
    }

    let source_url = config.source_url_for(args.connection.as_deref())?;
    let source_pool = db::connect(&source_url, config.max_connections).await?;
    let target_pool = db::connect(&config.target_url()?, config.max_connections).await?;
    let cache = open_cache(config).await?;

    if args.fresh {
        if args.dry_run {
            log::warn!("--fresh ignored for a dry run");
        } else {
            let names: Vec<String> = plan.entities().iter().map(|e| e.to_string()).collect();
            orchestrator.cleanup(&names, &cache).await?;
        }
    }

    let source = PgSourceStore::new(source_pool);
    let target = invision::target_tables()
        .into_iter()
        .fold(PgTargetStore::new(target_pool), |store, (entity, table)| {
            store.with_table(entity, table)
        });
    let reporter = LogReporter::new(config.progress_every);
    let options = RunOptions {
        batch_size: args.batch_size.unwrap_or(config.batch_size).max(1),
        limit: args.limit,
        offset: args.offset,
        dry_run: args.dry_run,
        checkpoint_every: args.checkpoint_every.unwrap_or(config.checkpoint_pages).max(1),
    };
    let ctx = ImportContext::new(&source, &target, &cache, &reporter, options);

    let report = orchestrator.run(&plan, &ctx, args.skip_completed).await?;

    print!("{}", render_summary(&report.result));
    if let Some(path) = &args.report {
        std::fs::write(path, report.to_json()?)?;
        println!("report written to {}", path.display());
    }

    if let Some(reason) = &report.aborted {
        eprintln!("error: run aborted: {reason}");
        return Ok(ExitCode::FAILURE);
    }
    if args.strict && report.has_failures() {
        eprintln!(
            "error: {} records failed",
            report.result.total_failed()
        );
        return Ok(ExitCode::from(EXIT_FAILED_RECORDS));
    }
    Ok(ExitCode::SUCCESS)
}
