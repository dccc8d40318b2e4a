use clap::{Parser, Subcommand};

use companysync::{CompanySync, EngineConfig, RunStatus, SyncOptions, SyncRun};

#[derive(Parser)]
#[command(name = "companysync", about = "Company record sync engine CLI")]
struct Cli {
    /// Database path (default: ~/.companysync/companysync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Base URL of the company API (overrides config and COMPANYSYNC_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Records per page (default: 50)
    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl companysync::SyncProgress for StderrProgress {
    fn on_run_start(&self, run: &SyncRun) {
        eprintln!("Sync run {} started ({})", run.run_id, run.mode.as_str());
    }

    fn on_page_committed(&self, run: &SyncRun, page_num: u32) {
        let done = run.records_added + run.records_updated + run.records_unchanged;
        match run.total_records {
            Some(total) => eprint!("\r  Page {page_num}: {done}/{total} records   "),
            None => eprint!("\r  Page {page_num}: {done} records   "),
        }
    }

    fn on_page_failed(&self, _run: &SyncRun, page_num: u32, error: &companysync::Error) {
        eprintln!("\n  Page {page_num} failed: {error}");
    }

    fn on_run_complete(&self, run: &SyncRun) {
        eprintln!();
        eprintln!("  Done: {}", run.status.as_str());
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync companies from the source into the local cache
    Sync {
        /// Refetch every page and compare against the whole cache
        #[arg(long, conflicts_with = "incremental")]
        full: bool,
        /// Only pick up changes since the last successful run (default)
        #[arg(long)]
        incremental: bool,
    },
    /// List recent sync runs
    Runs {
        /// Maximum runs to show
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one sync run
    Run {
        /// Run id
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search cached companies by name, owner or address
    Search {
        /// Search query (empty lists all)
        query: String,
        /// Maximum results
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Skip this many results
        #[arg(long, default_value = "0")]
        offset: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one cached company
    Show {
        /// Source id of the company
        natural_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show cache status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => companysync::Database::open_at(path).await?,
        None => companysync::Database::open().await?,
    };

    match cli.command {
        // Works even when the stored settings are unusable.
        Commands::Config { action } => handle_config(&db, action).await,
        command => {
            let config = load_config(&db, cli.base_url.as_deref(), cli.page_size).await?;
            let engine = CompanySync::connect(db, config)?;
            run_command(&engine, command).await
        }
    }
}

async fn run_command(
    engine: &CompanySync<companysync::HttpSource>,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Sync { full, incremental } => {
            let options = if full && !incremental {
                SyncOptions::full()
            } else {
                SyncOptions::incremental()
            };
            handle_sync(engine, options).await?;
        }
        Commands::Runs { limit, json } => {
            let runs = engine.list_runs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No sync runs yet.");
            } else {
                for run in &runs {
                    print_run_line(run);
                }
            }
        }
        Commands::Run { id, json } => {
            let run = engine.get_run_status(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
        }
        Commands::Search {
            query,
            limit,
            offset,
            json,
        } => {
            let options = companysync::SearchOptions {
                limit: Some(limit),
                offset: Some(offset),
            };
            let results = engine.search_companies(&query, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Search: \"{}\" ({} results)", results.query, results.total);
                for hit in &results.hits {
                    println!(
                        "  [{}] {}  {}",
                        hit.natural_id,
                        hit.name,
                        hit.owner.as_deref().unwrap_or("")
                    );
                    if let Some(address) = &hit.address {
                        println!("        {address}");
                    }
                }
            }
        }
        Commands::Show { natural_id, json } => {
            let company = engine
                .get_company(&natural_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Company {natural_id} not found"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&company)?);
            } else {
                println!("{} ({})", company.name, company.natural_id);
                println!("  Updated at source: {}", company.source_updated_at.to_rfc3339());
                println!("  Fetched:           {}", company.fetched_at.to_rfc3339());
                for (key, value) in &company.attributes {
                    match value {
                        serde_json::Value::String(s) => println!("  {key}: {s}"),
                        serde_json::Value::Null => {}
                        other => println!("  {key}: {other}"),
                    }
                }
            }
        }
        Commands::Status => print_status(engine).await?,
        Commands::Config { action } => handle_config(engine.db(), action).await?,
    }

    Ok(())
}

/// Environment, then stored settings, then command-line flags.
async fn load_config(
    db: &companysync::Database,
    base_url: Option<&str>,
    page_size: Option<u32>,
) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::from_env()?;
    if let Some(url) = companysync::config_get(db, "base_url").await? {
        config.base_url = url;
    }
    if let Some(size) = companysync::config_get(db, "page_size").await? {
        config.page_size = size
            .parse()
            .map_err(|_| anyhow::anyhow!("Stored page_size is not a number: {size}"))?;
    }
    if let Some(url) = base_url {
        config.base_url = url.to_string();
    }
    if let Some(size) = page_size {
        config.page_size = size;
    }
    config.validate()?;
    Ok(config)
}

async fn handle_sync(
    engine: &CompanySync<companysync::HttpSource>,
    options: SyncOptions,
) -> anyhow::Result<()> {
    let progress = StderrProgress;
    let sync = engine.run_sync(&options, &progress);
    tokio::pin!(sync);

    let run = tokio::select! {
        run = &mut sync => run?,
        _ = tokio::signal::ctrl_c() => {
            if let Some(run_id) = engine.cancel_active().await {
                eprintln!("\nCancelling run {run_id} after the current page...");
            }
            sync.await?
        }
    };

    print_run(&run);
    if run.status == RunStatus::Failed {
        anyhow::bail!(
            "Sync run {} failed: {}",
            run.run_id,
            run.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_run_line(run: &SyncRun) {
    println!(
        "#{:<5} {:<11} {:<9} {}  +{} ~{} ={} !{}",
        run.run_id,
        run.mode.as_str(),
        run.status.as_str(),
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.records_added,
        run.records_updated,
        run.records_unchanged,
        run.records_failed,
    );
}

fn print_run(run: &SyncRun) {
    println!("Sync run {} ({})", run.run_id, run.mode.as_str());
    println!("  Status:    {}", run.status.as_str());
    println!("  Started:   {}", run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        println!("  Finished:  {}", finished.to_rfc3339());
    }
    if let Some(ms) = run.duration_ms {
        println!("  Duration:  {:.1}s", ms as f64 / 1000.0);
    }
    println!(
        "  Pages:     {} processed, {} failed",
        run.pages_processed, run.pages_failed
    );
    println!(
        "  Records:   {} added, {} updated, {} unchanged, {} failed",
        run.records_added, run.records_updated, run.records_unchanged, run.records_failed
    );
    if let Some(total) = run.total_records {
        println!("  Source:    {total} records");
    }
    if run.status == RunStatus::Running {
        let progress = run.progress(chrono::Utc::now());
        let pages = match progress.total_pages {
            Some(total) => format!("{}/{total} pages", progress.pages_done),
            None => format!("{} pages", progress.pages_done),
        };
        match progress.eta_seconds {
            Some(eta) => println!("  Progress:  {:.1}% ({pages}), about {eta}s left", progress.percent),
            None => println!("  Progress:  {:.1}% ({pages})", progress.percent),
        }
    }
    if let Some(watermark) = run.watermark {
        println!("  Watermark: {}", watermark.to_rfc3339());
    }
    if let Some(err) = &run.last_error {
        println!("  Error:     {err}");
    }
}

async fn print_status(engine: &CompanySync<companysync::HttpSource>) -> anyhow::Result<()> {
    let (live, deleted) = engine.company_counts().await?;
    let last = engine.list_runs(1).await?;

    println!("Cache Status");
    println!("  Companies: {live}");
    println!("  Deleted:   {deleted}");
    println!("  Source:    {}", engine.config().list_url()?);
    match last.first() {
        Some(run) => println!(
            "  Last run:  #{} {} ({})",
            run.run_id,
            run.status.as_str(),
            run.started_at.to_rfc3339()
        ),
        None => println!("  Last run:  never"),
    }
    Ok(())
}

async fn handle_config(db: &companysync::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match companysync::config_get(db, &key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            companysync::config_set(db, &key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = companysync::config_list(db).await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
