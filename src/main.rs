use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dream_pipeline::aggregates::{DEFAULT_MAX_AGE, DEFAULT_MIN_AGE};
use dream_pipeline::config::{
    PipelineConfig, DEFAULT_CHAT_BASE_URL, DEFAULT_CHAT_MODEL, DEFAULT_EMBEDDING_BASE_URL,
    DEFAULT_EMBEDDING_MODEL,
};
use dream_pipeline::{
    build_index, category_breakdown, database_stats, merge, open_database, progress, readiness,
    suggest_merges, title_version, unique_titles, BatchRunner, CategoryLevel, ChatClient, Metric,
    OpenAiEmbedder, Readiness, RetryPolicy, RunState, SortOrder, TitleFilter, TitleIndex,
    TitleSort,
};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

#[derive(Parser)]
#[command(name = "dream-pipeline")]
#[command(about = "Normalize dream entries, index their titles, merge near-duplicates")]
#[command(version)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "DREAMS_DB", default_value = "dreams.db")]
    db: PathBuf,

    /// Directory for the title index files
    #[arg(long, global = true, env = "DREAMS_INDEX_DIR", default_value = "index")]
    index_dir: PathBuf,

    #[arg(long, global = true, env = "GROQ_API_KEY", hide_env_values = true)]
    groq_api_key: Option<String>,

    #[arg(long, global = true, env = "CHAT_BASE_URL", default_value = DEFAULT_CHAT_BASE_URL)]
    chat_base_url: String,

    #[arg(long, global = true, env = "CHAT_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, global = true, env = "EMBEDDING_BASE_URL", default_value = DEFAULT_EMBEDDING_BASE_URL)]
    embedding_base_url: String,

    #[arg(long, global = true, env = "EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Attempts per API call (rate limits and transient failures only)
    #[arg(long, global = true, env = "DREAMS_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Pause between model calls, in milliseconds
    #[arg(long, global = true, env = "DREAMS_PACE_MS", default_value_t = 50)]
    pace_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize pending entries
    Normalize {
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Keep going until every pending entry has been attempted
        #[arg(long)]
        all: bool,
    },

    /// Show normalization progress
    Progress,

    /// Build or inspect the title index
    #[command(subcommand)]
    Index(IndexCommand),

    /// Find titles similar to an existing title
    Similar {
        title: String,

        #[arg(short, long, default_value_t = 10)]
        k: usize,

        #[arg(short, long, default_value_t = 0.8)]
        threshold: f32,

        /// Offer to merge the matches into TITLE
        #[arg(long)]
        merge: bool,
    },

    /// Merge source titles into a target title
    Merge {
        target: String,

        #[arg(required = true)]
        sources: Vec<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Title and category statistics
    Stats {
        #[arg(long)]
        min_age: Option<i64>,

        #[arg(long)]
        max_age: Option<i64>,

        /// Only titles containing this text
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value = "count")]
        sort: TitleSort,

        #[arg(long, default_value = "desc")]
        order: SortOrder,
    },
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Embed every distinct title and write the index files
    Build {
        #[arg(long, value_enum, default_value_t = MetricArg::Cosine)]
        metric: MetricArg,

        /// Embedding requests in flight
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Requested vector size (model default when omitted)
        #[arg(long)]
        dimensions: Option<usize>,
    },

    /// Report whether the index can serve queries
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum MetricArg {
    Cosine,
    L2,
}

impl From<MetricArg> for Metric {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Cosine => Metric::Cosine,
            MetricArg::L2 => Metric::L2,
        }
    }
}

fn main() -> ExitCode {
    // Load environment variables
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = run() {
        eprintln!("❌ Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = cli.pipeline_config();

    match &cli.command {
        Commands::Normalize { batch_size, all } => {
            config.batch_size = *batch_size;
            cmd_normalize(&cli, &config, *all)
        }
        Commands::Progress => cmd_progress(&config),
        Commands::Index(IndexCommand::Build {
            metric,
            concurrency,
            batch_size,
            dimensions,
        }) => {
            config.embedding.metric = (*metric).into();
            config.embedding.concurrency = *concurrency;
            config.embedding.batch_size = *batch_size;
            config.embedding.dimensions = *dimensions;
            cmd_index_build(&cli, &config)
        }
        Commands::Index(IndexCommand::Status) => cmd_index_status(&config),
        Commands::Similar {
            title,
            k,
            threshold,
            merge,
        } => cmd_similar(&config, title, *k, *threshold, *merge),
        Commands::Merge {
            target,
            sources,
            yes,
        } => cmd_merge(&config, target, sources, *yes),
        Commands::Stats {
            min_age,
            max_age,
            search,
            limit,
            sort,
            order,
        } => {
            let filter = TitleFilter {
                search: search.clone(),
                min_age: *min_age,
                max_age: *max_age,
                sort: *sort,
                order: *order,
                limit: *limit,
                offset: 0,
            };
            cmd_stats(&config, &filter)
        }
    }
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig {
            db_path: self.db.clone(),
            index_dir: self.index_dir.clone(),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                ..RetryPolicy::default()
            },
            pace_ms: self.pace_ms,
            ..PipelineConfig::default()
        };
        config.chat.base_url = self.chat_base_url.clone();
        config.chat.model = self.chat_model.clone();
        config.embedding.base_url = self.embedding_base_url.clone();
        config.embedding.model = self.embedding_model.clone();
        config
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn cmd_normalize(cli: &Cli, config: &PipelineConfig, all: bool) -> Result<()> {
    let api_key = cli
        .groq_api_key
        .as_deref()
        .context("GROQ_API_KEY is not set (flag --groq-api-key or .env)")?;

    println!("✍️  Normalizing dream entries");
    println!("{RULE}");

    let conn = open_database(&config.db_path)?;
    let client = ChatClient::new(
        api_key,
        &config.chat.base_url,
        config.chat.model.clone(),
        Duration::from_secs(config.chat.timeout_secs),
        config.chat.temperature,
        config.chat.max_tokens,
    )?;

    println!("🤖 Model: {}", config.chat.model);
    println!("📦 Batch size: {}", config.batch_size);

    let runner = BatchRunner::new(&conn, client, config.runner_config());
    let mut state = RunState::new();
    let outcome = if all {
        runner.run_until_complete(config.batch_size, &mut state)
    } else {
        runner.run(config.batch_size, &mut state)
    };

    println!("\n{RULE}");
    println!("✓ Written: {}", state.processed);
    println!("⚠️  Skipped (still pending): {}", state.skipped);
    outcome?;

    print_progress(&conn)
}

fn cmd_progress(config: &PipelineConfig) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    print_progress(&conn)
}

fn print_progress(conn: &Connection) -> Result<()> {
    let p = progress(conn)?;

    println!("\n📊 Progress");
    println!("   Entries:    {}", p.total_entries);
    println!("   Normalized: {} ({:.1}%)", p.normalized, p.percent_complete);
    println!("   Fallback:   {}", p.fallback);
    println!("   Pending:    {}", p.pending);
    Ok(())
}

fn cmd_index_build(cli: &Cli, config: &PipelineConfig) -> Result<()> {
    let api_key = cli
        .openai_api_key
        .as_deref()
        .context("OPENAI_API_KEY is not set (flag --openai-api-key or .env)")?;

    println!("🧭 Building title index");
    println!("{RULE}");

    let conn = open_database(&config.db_path)?;
    let embedder = OpenAiEmbedder::new(
        api_key,
        &config.embedding.base_url,
        config.embedding.model.clone(),
        config.embedding.dimensions,
        Duration::from_secs(config.embedding.timeout_secs),
        config.embedding.batch_size,
    )?;

    let index = build_index(&conn, &embedder, &config.index_config())?;
    index
        .save(&config.index_dir)
        .with_context(|| format!("Failed to write index to {:?}", config.index_dir))?;

    println!("✓ Indexed {} titles ({} dimensions)", index.len(), index.dim());
    println!("✓ Title version: {}", index.title_version());
    println!("💾 Saved to {:?}", config.index_dir);
    Ok(())
}

fn cmd_index_status(config: &PipelineConfig) -> Result<()> {
    match readiness(&config.index_dir) {
        Readiness::Ready {
            titles,
            title_version: built_at_version,
        } => {
            let conn = open_database(&config.db_path)?;
            let current = title_version(&conn)?;
            println!("✅ Index ready: {} titles", titles);
            if built_at_version != current {
                println!(
                    "⚠️  Stale: built at title version {}, store is at {} (run `index build`)",
                    built_at_version, current
                );
            }
        }
        Readiness::Missing => {
            println!("❌ No index in {:?}", config.index_dir);
            println!("   Run: dream-pipeline index build");
        }
        Readiness::Inconsistent { reason } => {
            println!("❌ Index files disagree: {}", reason);
            println!("   Run: dream-pipeline index build");
        }
    }
    Ok(())
}

fn cmd_similar(
    config: &PipelineConfig,
    title: &str,
    k: usize,
    threshold: f32,
    offer_merge: bool,
) -> Result<()> {
    let mut conn = open_database(&config.db_path)?;
    let index = TitleIndex::load(&config.index_dir)?;

    let candidates = suggest_merges(&conn, &index, title, k, threshold)?;
    if candidates.is_empty() {
        println!("🔍 No titles within {:.2} of {:?}", threshold, title);
        return Ok(());
    }

    println!("🔍 Similar to {:?}:", title);
    for candidate in &candidates {
        println!(
            "   {:.3}  {}  ({} entries)",
            candidate.score, candidate.title, candidate.entry_count
        );
    }

    if !offer_merge {
        return Ok(());
    }

    let sources: Vec<String> = candidates.into_iter().map(|c| c.title).collect();
    if !confirm(&format!("\nMerge {} titles into {:?}?", sources.len(), title))? {
        println!("Cancelled");
        return Ok(());
    }

    let result = merge(&mut conn, title, &sources, "cli")?;
    print_merge(title, result.merged_count, result.new_total_count);
    Ok(())
}

fn cmd_merge(config: &PipelineConfig, target: &str, sources: &[String], yes: bool) -> Result<()> {
    let mut conn = open_database(&config.db_path)?;

    if !yes && !confirm(&format!("Merge {} into {:?}?", sources.join(", "), target))? {
        println!("Cancelled");
        return Ok(());
    }

    let result = merge(&mut conn, target, sources, "cli")?;
    print_merge(target, result.merged_count, result.new_total_count);
    Ok(())
}

fn print_merge(target: &str, merged_count: usize, new_total_count: i64) {
    println!("✅ Merged {} entries into {:?}", merged_count, target);
    println!("✓ {:?} now has {} entries", target, new_total_count);
    println!("⚠️  The title index is now stale; run `index build` before the next query");
}

fn cmd_stats(config: &PipelineConfig, filter: &TitleFilter) -> Result<()> {
    let conn = open_database(&config.db_path)?;
    let stats = database_stats(&conn)?;

    println!("📊 Database");
    println!("{RULE}");
    println!("   Entries:        {}", stats.total_entries);
    println!("   Normalized:     {}", stats.normalized);
    println!("   Fallback:       {}", stats.fallback);
    println!("   Unique titles:  {}", stats.unique_titles);
    println!("   Categories:     {}", stats.unique_categories);
    println!("   Subcategories:  {}", stats.unique_subcategories);

    let page = unique_titles(&conn, filter)?;
    println!("\n🏷️  Titles ({} matching)", page.total_count);
    for t in &page.titles {
        let age = match (t.avg_age, t.min_age, t.max_age) {
            (Some(avg), Some(min), Some(max)) => format!("avg {avg:.1}, {min}-{max}"),
            _ => "no ages".to_string(),
        };
        println!("   {:>6}  {}  ({})", t.count, t.title, age);
    }

    let min_age = filter.min_age.unwrap_or(DEFAULT_MIN_AGE);
    let max_age = filter.max_age.unwrap_or(DEFAULT_MAX_AGE);
    let categories = category_breakdown(&conn, CategoryLevel::Category, min_age, max_age)?;
    println!("\n🗂️  Categories (ages {}-{})", min_age, max_age);
    for c in &categories {
        println!(
            "   {:>6}  {}  [{}]",
            c.count,
            c.name,
            c.age_group.unwrap_or("-")
        );
    }

    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
