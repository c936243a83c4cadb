//! pgstage - load JSON records into PostgreSQL through a write pipeline

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pgstage::db::{create_pool, DbConfig};
use pgstage::{
    compile_insert, normalize, BatchingPolicy, Database, KillSwitch, MemoryDatabase,
    PassthroughConfig, PassthroughStage, Payload, PgDatabase, Pipeline, PipelineConfig,
    WriteRequest, WriteStage, WriteStageConfig,
};
use pgstage_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pgstage")]
#[command(author, version, about = "Conflict-aware bulk loads into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load newline-delimited JSON units into a table
    Load {
        /// Input file, one unit per line; `-` reads stdin
        #[arg(short, long)]
        input: String,

        /// Pipeline configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        /// Statement run once, before the first unit is written
        #[arg(long)]
        delete_sql: Option<String>,

        /// Units written concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Maintenance statement run ahead of the writer
        #[arg(long)]
        prep_sql: Option<String>,

        /// How many units trigger the prep statement
        #[arg(long, default_value_t = 1)]
        prep_times: u64,

        /// Print the statements instead of touching the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the statements a single unit compiles to
    Compile {
        /// JSON file holding one unit; `-` reads stdin
        #[arg(short, long)]
        input: String,

        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Destination table
    #[arg(short, long)]
    table: Option<String>,

    /// Plain INSERT without an ON CONFLICT clause
    #[arg(long)]
    no_upsert: bool,

    /// Conflict target for upserts
    #[arg(long)]
    conflict_index: Option<String>,

    /// Columns updated on conflict (default: all)
    #[arg(long, value_delimiter = ',')]
    update_columns: Vec<String>,

    /// Maximum rows per INSERT statement
    #[arg(long)]
    batch_size: Option<i64>,
}

impl TargetArgs {
    /// Overlay command line flags on `config`
    fn apply(&self, config: &mut WriteStageConfig) {
        if let Some(table) = &self.table {
            config.table_name = table.clone();
        }
        if self.no_upsert {
            config.upsert_enabled = false;
        }
        if let Some(index) = &self.conflict_index {
            config.conflict_index = Some(index.clone());
        }
        if !self.update_columns.is_empty() {
            config.conflict_update_columns = self.update_columns.clone();
        }
        if let Some(size) = self.batch_size {
            config.max_rows_per_statement = size;
        }
    }

    fn write_config(&self) -> Result<WriteStageConfig> {
        let Some(table) = &self.table else {
            bail!("--table is required when no --config file is given");
        };
        let mut config = WriteStageConfig::new(table.clone());
        self.apply(&mut config);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("pgstage")
        .build()
        .merge_env()
        .context("Invalid logging environment")?;
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Load {
            input,
            config,
            target,
            delete_sql,
            concurrency,
            prep_sql,
            prep_times,
            dry_run,
        } => {
            let mut pipeline_config = match config {
                Some(path) => PipelineConfig::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => {
                    let mut config = PipelineConfig::new(target.write_config()?);
                    if !dry_run {
                        config.database = DbConfig::from_env().context("Database not configured")?;
                    }
                    config
                },
            };
            target.apply(&mut pipeline_config.write);
            if delete_sql.is_some() {
                pipeline_config.write.delete_statement = delete_sql;
            }
            if let Some(n) = concurrency {
                pipeline_config.write.concurrency_level = n;
            }
            if let Some(sql) = prep_sql {
                pipeline_config.prep.push(PassthroughConfig {
                    fixed_statement: Some(sql),
                    max_executions: prep_times,
                });
            }
            pipeline_config.validate()?;

            load(pipeline_config, &input, dry_run).await
        },
        Command::Compile { input, target } => {
            let config = target.write_config()?;
            compile(&config, &input).await
        },
    }
}

async fn load(config: PipelineConfig, input: &str, dry_run: bool) -> Result<()> {
    let recorder = MemoryDatabase::new();
    let db: Arc<dyn Database> = if dry_run {
        info!("Dry run: statements are printed, not executed");
        Arc::new(recorder.clone())
    } else {
        let pool = create_pool(&config.database)
            .await
            .context("Failed to connect to database")?;
        Arc::new(PgDatabase::new(pool))
    };

    let mut pipeline = Pipeline::new();
    for (idx, prep) in config.prep.iter().enumerate() {
        pipeline = pipeline.stage(
            PassthroughStage::from_config(db.clone(), prep).with_name(format!("SqlPassthrough[{}]", idx)),
        );
    }
    pipeline = pipeline.stage(WriteStage::from_config(db.clone(), &config.write));

    let text = read_input(input).await?;
    let units: Vec<Payload> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Payload::from)
        .collect();

    let kill = KillSwitch::new();
    let mut running = pgstage::pipeline::spawn(pipeline, kill.clone(), futures::stream::iter(units));

    let outcome = tokio::select! {
        joined = &mut running => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping pipeline");
            kill.cancel();
            running.await
        },
    };
    let report = outcome.context("Pipeline task panicked")??;

    if dry_run {
        for (sql, args) in recorder.statements() {
            println!("{};", sql);
            if !args.is_empty() {
                println!("-- args: {}", serde_json::Value::Array(args));
            }
        }
    }

    if report.cancelled {
        bail!("Load interrupted after {} units", report.units_in);
    }
    info!(units = report.units_in, table = %config.write.table_name, "Load complete");
    Ok(())
}

async fn compile(config: &WriteStageConfig, input: &str) -> Result<()> {
    let text = read_input(input).await?;
    let request = WriteRequest::decode(&Payload::from(text.as_str()))?;

    let target = match request.override_table() {
        Some(table) => config.write_target().retarget(table),
        None => config.write_target(),
    };
    let policy = BatchingPolicy::max_rows(config.max_rows_per_statement);

    for chunk in policy.chunks(request.batch().records()) {
        let statement = compile_insert(normalize(chunk), &target)?;
        println!("{};", statement.sql);
        println!("-- args: {}", serde_json::Value::Array(statement.args));
    }
    Ok(())
}

async fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read {}", input))
    }
}
