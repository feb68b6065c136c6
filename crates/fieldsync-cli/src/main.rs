use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fieldsync_api::FieldSync;
use fieldsync_core::{
    field_catalog, localize_catalog, DataSource, Direction, Expr, Row, Select, SortOrder,
    SqlValue, SyncConfig,
};
use serde_json::Value;
use tracing::debug;

mod logging;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "fsync")]
#[command(about = "Offline-first field data CLI")]
struct Cli {
    #[arg(long, default_value = "./fieldsync.sqlite3")]
    db: PathBuf,

    /// YAML file with naming and retry settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Row {
        #[command(subcommand)]
        command: RowCommand,
    },
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
    Version {
        #[command(subcommand)]
        command: VersionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    Ddl(SchemaDdlArgs),
    Tables,
}

#[derive(Debug, Args)]
struct SchemaDdlArgs {
    #[arg(long, value_enum, default_value_t = SourceArg::Synced)]
    family: SourceArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Synced,
    Local,
}

impl SourceArg {
    fn into_source(self) -> DataSource {
        match self {
            Self::Synced => DataSource::Synced,
            Self::Local => DataSource::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DirectionArg {
    Previous,
    Next,
}

impl DirectionArg {
    fn into_direction(self) -> Direction {
        match self {
            Self::Previous => Direction::Previous,
            Self::Next => Direction::Next,
        }
    }
}

#[derive(Debug, Args)]
struct TableArgs {
    #[arg(long)]
    table: String,
    #[arg(long, value_enum, default_value_t = SourceArg::Local)]
    source: SourceArg,
}

#[derive(Debug, Subcommand)]
enum RowCommand {
    Insert {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        json: String,
    },
    Get {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        id: String,
    },
    Publish {
        #[arg(long)]
        table: String,
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Merge(QueryMergeArgs),
    Sql(QuerySqlArgs),
}

#[derive(Debug, Args)]
struct QueryMergeArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long, default_value_t = false)]
    desc: bool,
    /// `column=value`; the value is read as JSON when it parses, as text otherwise.
    #[arg(long = "filter")]
    filters: Vec<String>,
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Debug, Args)]
struct QuerySqlArgs {
    #[arg(long)]
    sql: String,
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum VersionCommand {
    Create {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        json: String,
    },
    Add {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        base_id: String,
        #[arg(long, default_value = "{}")]
        json: String,
    },
    Append {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        chain: String,
        #[arg(long, default_value = "{}")]
        json: String,
    },
    List {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        chain: String,
    },
    Latest {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        chain: String,
    },
    LatestOfAll {
        #[command(flatten)]
        target: TableArgs,
    },
    Adjacent {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        id: String,
        #[arg(long, value_enum)]
        direction: DirectionArg,
    },
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_rows(rows: Vec<Row>) -> Result<()> {
    emit_json(serde_json::json!({ "count": rows.len(), "rows": rows }))
}

fn emit_row(row: Option<Row>) -> Result<()> {
    emit_json(serde_json::json!({ "found": row.is_some(), "row": row }))
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: SyncConfig = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn parse_object(json: &str) -> Result<Row> {
    match serde_json::from_str::<Value>(json).context("--json is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("--json must be an object, got {other}")),
    }
}

/// JSON when it parses, plain text otherwise.
fn parse_loose(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_filter(raw: &str) -> Result<Expr> {
    let (column, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("filter `{raw}` must look like column=value"))?;
    let column = column.trim();
    if column.is_empty() {
        return Err(anyhow!("filter `{raw}` names no column"));
    }
    Ok(Expr::col(column).equals(parse_loose(value)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    if let Command::Schema { command } = &cli.command {
        return run_schema(command, &config);
    }

    let api = FieldSync::open(&cli.db, field_catalog(), config)?;
    debug!(db = %cli.db.display(), "dispatching command");
    let outcome = match cli.command {
        Command::Db { command } => run_db(command, &api).await,
        Command::Row { command } => run_row(command, &api).await,
        Command::Query { command } => run_query(command, &api).await,
        Command::Version { command } => run_version(command, &api).await,
        Command::Schema { .. } => Ok(()),
    };
    api.shutdown()?;
    outcome
}

fn run_schema(command: &SchemaCommand, config: &SyncConfig) -> Result<()> {
    let catalog = field_catalog();
    match command {
        SchemaCommand::Ddl(args) => {
            let family = args.family.into_source();
            let ddl = match family {
                DataSource::Synced => catalog.create_sql(),
                DataSource::Local => localize_catalog(&catalog, &config.local_suffix).create_sql(),
            };
            emit_json(serde_json::json!({ "family": family.as_str(), "ddl": ddl }))
        }
        SchemaCommand::Tables => {
            let tables = catalog
                .tables
                .iter()
                .map(|table| {
                    serde_json::json!({
                        "name": table.name,
                        "local_name": format!("{}{}", table.name, config.local_suffix),
                        "versioned": table.versioned,
                        "columns": table.column_names(),
                        "json_columns": table.json_columns().collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "tables": tables }))
        }
    }
}

async fn run_db(command: DbCommand, api: &FieldSync) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status().await?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run).await?;
            emit_json(serde_json::to_value(result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check().await?;
            emit_json(
                serde_json::to_value(report).context("failed to serialize integrity report")?,
            )
        }
        DbCommand::Backup(args) => {
            api.backup(args.out.clone()).await?;
            emit_json(serde_json::json!({ "backup_file": args.out }))
        }
    }
}

async fn run_row(command: RowCommand, api: &FieldSync) -> Result<()> {
    api.migrate(false).await?;
    match command {
        RowCommand::Insert { target, json } => {
            let row = api.insert(&target.table, target.source.into_source(), parse_object(&json)?).await?;
            emit_json(Value::Object(row))
        }
        RowCommand::Get { target, id } => {
            emit_row(api.find_by_id(&target.table, target.source.into_source(), &id).await?)
        }
        RowCommand::Publish { table, ids } => {
            let summary = api.publish(&table, ids).await?;
            emit_json(serde_json::to_value(summary).context("failed to serialize publish summary")?)
        }
    }
}

async fn run_query(command: QueryCommand, api: &FieldSync) -> Result<()> {
    api.migrate(false).await?;
    match command {
        QueryCommand::Merge(args) => {
            let mut select = Select::from(&args.table);
            for raw in &args.filters {
                select = select.filter(parse_filter(raw)?);
            }
            if let Some(column) = &args.order_by {
                let order = if args.desc { SortOrder::Desc } else { SortOrder::Asc };
                select = select.order_by(column, order);
            }
            if let Some(limit) = args.limit {
                select = select.limit(limit);
            }
            emit_rows(api.merge_select(select).await?)
        }
        QueryCommand::Sql(args) => {
            let params = args.params.iter().map(|raw| SqlValue::from(parse_loose(raw))).collect();
            emit_rows(api.merge_sql(args.sql, params).await?)
        }
    }
}

async fn run_version(command: VersionCommand, api: &FieldSync) -> Result<()> {
    api.migrate(false).await?;
    match command {
        VersionCommand::Create { target, json } => {
            let row =
                api.create_new(&target.table, target.source.into_source(), parse_object(&json)?).await?;
            emit_json(Value::Object(row))
        }
        VersionCommand::Add { target, base_id, json } => {
            let source = target.source.into_source();
            let base = api
                .find_by_id(&target.table, source, &base_id)
                .await?
                .ok_or_else(|| anyhow!("no {} row with id {base_id}", target.table))?;
            let row = api.add_version(&target.table, source, base, parse_object(&json)?).await?;
            emit_json(Value::Object(row))
        }
        VersionCommand::Append { target, chain, json } => {
            let row = api
                .append_version(&target.table, target.source.into_source(), &chain, parse_object(&json)?)
                .await?;
            emit_json(Value::Object(row))
        }
        VersionCommand::List { target, chain } => {
            emit_rows(api.versions(&target.table, target.source.into_source(), &chain).await?)
        }
        VersionCommand::Latest { target, chain } => {
            emit_row(api.latest_version(&target.table, target.source.into_source(), &chain).await?)
        }
        VersionCommand::LatestOfAll { target } => {
            emit_rows(api.latest_of_all(&target.table, target.source.into_source()).await?)
        }
        VersionCommand::Adjacent { target, id, direction } => {
            let source = target.source.into_source();
            let record = api
                .find_by_id(&target.table, source, &id)
                .await?
                .ok_or_else(|| anyhow!("no {} row with id {id}", target.table))?;
            let row = api
                .adjacent_version(&target.table, source, record, direction.into_direction())
                .await?;
            emit_row(row)
        }
    }
}
