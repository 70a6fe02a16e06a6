use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use metasync_core::{CatalogRun, Config, ConnectionConfig, EngineKind, NodeType, RunStatus, StoreKind};
use metasync_engine::{RunCoordinator, RunReport, RunRequest};
use metasync_source::{MockSource, PostgresSource, SnowflakeSource, SourceEnumerator, SourceFixture};
use metasync_store::{MemoryNodeStore, NodeStore, PostgresNodeStore};

const DEFAULT_CONFIG: &str = "metasync.toml";
const DEFAULT_STORE_PATH: &str = ".metasync/store.json";

/// Metasync - Temporal catalog synchronization for database servers
#[derive(Parser)]
#[command(name = "metasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: metasync.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl configured connections into the catalog
    Sync {
        /// Only sync this connection
        #[arg(long)]
        connection: Option<String>,

        /// Also write a plain-text log here; recorded on each run
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Check credentials and reachability of configured connections
    TestConnection {
        /// Only test this connection
        #[arg(long)]
        connection: Option<String>,
    },

    /// List recent catalog runs
    Runs {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show every version of one node
    History {
        /// Node type (database, schema, table, view, column)
        node_type: String,

        /// Qualified name, e.g. pg.internal:5432/shop.public.users
        qualified_name: String,

        /// Print versions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a starter config file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Sync { log_file, .. } => log_file.clone(),
        _ => None,
    };
    init_tracing(cli.verbose, log_file.as_deref())?;

    if let Commands::InitConfig { output, force } = &cli.command {
        return init_config_command(output, *force);
    }

    let config = load_config(cli.config.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Sync { connection, log_file } => {
            sync_command(&config, connection.as_deref(), log_file.as_deref(), cli.verbose).await
        }
        Commands::TestConnection { connection } => test_connection_command(&config, connection.as_deref()).await,
        Commands::Runs { limit } => runs_command(&config, limit).await,
        Commands::History { node_type, qualified_name, json } => {
            history_command(&config, &node_type, &qualified_name, json).await
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Stderr logging filtered by RUST_LOG, plus an optional plain-text file
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "metasync=debug" } else { "metasync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    let config = if let Some(config_path) = path {
        Config::from_file(config_path)?
    } else if Path::new(DEFAULT_CONFIG).exists() {
        Config::from_file(Path::new(DEFAULT_CONFIG))?
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };
    Ok(config)
}

/// Node store selected by `[store]`
enum CatalogStore {
    Memory { store: Arc<MemoryNodeStore>, path: PathBuf },
    Postgres(Arc<PostgresNodeStore>),
}

impl CatalogStore {
    async fn open(config: &Config) -> Result<Self> {
        match config.store.kind {
            StoreKind::Memory => {
                let path = config.resolve_path(
                    config.store.path.as_deref().unwrap_or_else(|| Path::new(DEFAULT_STORE_PATH)),
                );
                let store = MemoryNodeStore::open(&path)
                    .with_context(|| format!("Cannot load catalog snapshot {}", path.display()))?;
                Ok(Self::Memory { store: Arc::new(store), path })
            }
            StoreKind::Postgres => {
                let var = config
                    .store
                    .url_env
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("store.url_env is required for the postgres store"))?;
                let url = std::env::var(var).with_context(|| format!("${} is not set", var))?;
                Ok(Self::Postgres(Arc::new(PostgresNodeStore::connect(&url).await?)))
            }
        }
    }

    fn handle(&self) -> Arc<dyn NodeStore> {
        match self {
            Self::Memory { store, .. } => store.clone(),
            Self::Postgres(store) => store.clone(),
        }
    }

    /// Write a final memory store snapshot
    ///
    /// The memory store already checkpoints at every run transition and
    /// progress flush; the postgres store commits as it goes.
    async fn save(&self) -> Result<()> {
        if let Self::Memory { store, path } = self {
            store
                .persist(path)
                .await
                .with_context(|| format!("Cannot write catalog snapshot {}", path.display()))?;
        }
        Ok(())
    }
}

/// Build the source enumerator for one connection
fn build_source(config: &Config, connection: &ConnectionConfig) -> Result<Arc<dyn SourceEnumerator>> {
    let source: Arc<dyn SourceEnumerator> = match connection.engine {
        EngineKind::Fixture => {
            let path = connection
                .fixture
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("connection '{}' has no fixture path", connection.name))?;
            let fixture = SourceFixture::from_file(&config.resolve_path(path))?;
            Arc::new(MockSource::from_fixture(fixture))
        }
        EngineKind::Postgres => {
            let user = connection.user.clone().unwrap_or_else(|| "postgres".to_string());
            let mut source = PostgresSource::new(&connection.host, connection.port.unwrap_or(5432), user)
                .with_tls(connection.tls);
            if let Some(password) = connection.resolve_credential()? {
                source = source.with_password(password);
            }
            Arc::new(source)
        }
        EngineKind::Snowflake => {
            let account = connection
                .account
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection '{}' needs an account", connection.name))?;
            let user = connection
                .user
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection '{}' needs a user", connection.name))?;
            let secret = connection
                .resolve_credential()?
                .ok_or_else(|| anyhow::anyhow!("connection '{}' needs credential_env", connection.name))?;

            let mut source = if secret.trim_start().starts_with("-----BEGIN") {
                SnowflakeSource::with_key_pair(account, user, secret)
            } else {
                SnowflakeSource::with_password(account, user, secret)
            };
            if let Some(warehouse) = &connection.warehouse {
                source = source.with_warehouse(warehouse);
            }
            if let Some(role) = &connection.role {
                source = source.with_role(role);
            }
            Arc::new(source)
        }
    };
    Ok(source)
}

fn select_connections<'a>(config: &'a Config, name: Option<&str>) -> Result<Vec<&'a ConnectionConfig>> {
    match name {
        Some(name) => {
            let connection = config
                .connection(name)
                .ok_or_else(|| anyhow::anyhow!("No connection named '{}' in config", name))?;
            Ok(vec![connection])
        }
        None if config.connections.is_empty() => Err(anyhow::anyhow!(
            "No connections configured. Run 'metasync init-config' to create a starter config."
        )),
        None => Ok(config.connections.iter().collect()),
    }
}

/// Sync command - one concurrent run per connection
async fn sync_command(config: &Config, connection: Option<&str>, log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let connections = select_connections(config, connection)?;
    let store = CatalogStore::open(config).await?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling runs");
            trigger.cancel();
        }
    });

    let mut tasks = Vec::new();
    let mut errors = 0;
    for connection in connections {
        let source = match build_source(config, connection) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("{} {}: {:#}", "✗".red(), connection.name, e);
                errors += 1;
                continue;
            }
        };

        let mut request = RunRequest::from_connection(connection);
        if let Some(path) = log_file {
            request = request.with_log_reference(path.display().to_string());
        }
        if verbose {
            eprintln!("{} {} ({})", "Syncing".cyan(), connection.name, request.server_qualified_name);
        }

        let coordinator = RunCoordinator::new(store.handle(), source, config.policy.clone());
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .run_with_cancel(request, cancel)
                .await
                .map_err(anyhow::Error::from)
        }));
    }

    let mut reports = Vec::new();
    for task in tasks {
        match task.await {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Run could not start");
                errors += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "Run task did not finish");
                errors += 1;
            }
        }
    }

    store.save().await?;
    print_sync_summary(&reports);

    if errors > 0 || reports.iter().any(RunReport::is_failed) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_sync_summary(reports: &[RunReport]) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Catalog Sync Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());

    for report in reports {
        println!();
        println!(
            "{} run #{} {}",
            report.connection.bold(),
            report.run_id,
            colored_status(report.status)
        );
        let counters = &report.counters;
        println!("  Databases:        {}", counters.databases);
        println!("  Schemas:          {}", counters.schemas);
        println!("  Tables:           {}", counters.tables);
        println!("  Views:            {}", counters.views);
        println!("  Columns:          {}", counters.columns);
        println!("  View definitions: {}", counters.view_definitions);
        if counters.skipped > 0 {
            println!("  Skipped:          {}", counters.skipped.to_string().yellow());
        }
        if !report.skipped_databases.is_empty() {
            println!("  Unreachable:      {}", report.skipped_databases.join(", ").yellow());
        }
        if let Some(message) = &report.error_message {
            println!("  Reason:           {}", message);
        }
    }
    println!();
}

fn colored_status(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Aborted => status.as_str().yellow(),
        RunStatus::Failed => status.as_str().red().bold(),
        RunStatus::Running => status.as_str().cyan(),
    }
}

/// Test-connection command
async fn test_connection_command(config: &Config, connection: Option<&str>) -> Result<()> {
    let mut failures = 0;
    for connection in select_connections(config, connection)? {
        let result = match build_source(config, connection) {
            Ok(source) => source.test_connection().await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => println!("{} {} ({})", "✓".green(), connection.name, connection.engine),
            Err(e) => {
                failures += 1;
                println!("{} {} ({}): {:#}", "✗".red(), connection.name, connection.engine, e);
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Runs command
async fn runs_command(config: &Config, limit: usize) -> Result<()> {
    let store = CatalogStore::open(config).await?;
    let runs = store.handle().list_runs(limit).await?;
    if runs.is_empty() {
        println!("No catalog runs recorded yet");
        return Ok(());
    }
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

fn print_run(run: &CatalogRun) {
    let totals = run.counters.totals();
    println!(
        "#{:<5} {:<10} {:<20} {}  {}",
        run.id,
        colored_status(run.status),
        run.connection,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        totals
    );
    if let Some(message) = &run.error_message {
        println!("       {}", message.dimmed());
    }
}

/// History command
async fn history_command(config: &Config, node_type: &str, qualified_name: &str, json: bool) -> Result<()> {
    let node_type: NodeType = node_type.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let store = CatalogStore::open(config).await?;
    let versions = store.handle().node_history(node_type, qualified_name).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&versions)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!("No {} named {}", node_type, qualified_name);
        return Ok(());
    }

    println!("{} {}", node_type.to_string().bold(), qualified_name);
    for node in &versions {
        let state = if node.is_current {
            "current".green()
        } else if let Some(run) = node.deleted_in_run {
            format!("deleted in run {}", run).red()
        } else {
            "superseded".dimmed()
        };
        println!(
            "  v{:<6} runs {}..{}  {:?}  {}",
            node.id, node.created_in_run, node.last_seen_run, node.detail.attributes, state
        );
    }
    Ok(())
}

/// Init-config command
fn init_config_command(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists. Use --force to overwrite.",
            output.display()
        ));
    }
    std::fs::write(output, STARTER_CONFIG)?;
    println!("{} {}", "Wrote".green(), output.display());
    Ok(())
}

const STARTER_CONFIG: &str = r#"# Metasync configuration

[policy]
# Refuse runs with neither a schema nor a table filter
allow_unfiltered = false
max_concurrent_schemas = 4
collect_row_counts = false
store_retry_attempts = 3

[store]
kind = "memory"
path = ".metasync/store.json"
# kind = "postgres"
# url_env = "METASYNC_STORE_URL"

[[connections]]
name = "warehouse"
engine = "postgres"
host = "localhost"
port = 5432
user = "crawler"
credential_env = "WAREHOUSE_PASSWORD"

[connections.scope]
databases = "analytics"
schemas = "public, sales_*"
include_views = true
include_system_objects = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn starter_config_is_valid() {
        let config = Config::from_toml(STARTER_CONFIG).unwrap();
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert!(!config.connections[0].scope.is_unfiltered());
    }

    #[test]
    fn init_config_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metasync.toml");
        init_config_command(&path, false).unwrap();
        assert!(init_config_command(&path, false).is_err());
        assert!(init_config_command(&path, true).is_ok());
    }

    #[test]
    fn unknown_connection_is_an_error() {
        let config = Config::from_toml(STARTER_CONFIG).unwrap();
        assert!(select_connections(&config, Some("nope")).is_err());
        assert_eq!(select_connections(&config, None).unwrap().len(), 1);
        assert!(select_connections(&Config::default(), None).is_err());
    }

    #[tokio::test]
    async fn fixture_connection_syncs_into_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("source.json"),
            r#"{"databases": [{"name": "D1", "schemas": [{"name": "S1", "tables": [
                {"name": "T1", "table_type": "BASE TABLE",
                 "columns": [{"name": "id", "data_type": "integer", "is_nullable": false, "ordinal_position": 1}]}
            ]}]}]}"#,
        )
        .unwrap();
        let config_path = dir.path().join("metasync.toml");
        std::fs::write(
            &config_path,
            r#"
[store]
kind = "memory"
path = "store.json"

[[connections]]
name = "demo"
engine = "fixture"
fixture = "source.json"

[connections.scope]
schemas = "S1"
"#,
        )
        .unwrap();

        let config = Config::from_file(&config_path).unwrap();
        let connection = config.connection("demo").unwrap();
        let source = build_source(&config, connection).unwrap();
        let store = CatalogStore::open(&config).await.unwrap();

        let report = RunCoordinator::new(store.handle(), source, config.policy.clone())
            .run(RunRequest::from_connection(connection))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.counters.totals().added, 4);

        // Durable before any explicit save
        let reloaded = CatalogStore::open(&config).await.unwrap();
        let run = reloaded.handle().get_run(report.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let column = reloaded
            .handle()
            .current_node(NodeType::Column, "demo/D1.S1.T1.id")
            .await
            .unwrap();
        assert!(column.is_some());

        store.save().await.unwrap();
    }
}
