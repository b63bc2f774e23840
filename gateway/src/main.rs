mod config;
mod db;
mod pql;
#[cfg(test)]
mod test_utils;

use clap::{Parser, Subcommand};
use sea_query::SqliteQueryBuilder;
use sea_query_sqlx::SqlxBinder;
use std::{env, path::PathBuf};
use tracing_subscriber::EnvFilter;

use crate::pql::model::PqlQuery;

#[derive(Parser, Debug)]
#[command(name = "panoptikon-pql", about = "Panoptikon query language compiler")]
struct Args {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a PQL query read from a file (or stdin with `-`) and print the SQL and parameters.
    Build {
        #[arg(value_name = "QUERY_JSON")]
        query_path: PathBuf,
    },
    /// Compile and run a PQL query against the configured databases, printing decoded rows.
    Run {
        #[arg(value_name = "QUERY_JSON")]
        query_path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Build a custom tokio runtime with a larger worker thread stack size.
    // The default 2MB stack can be insufficient for deeply nested async code,
    // especially in debug builds where stack frames are larger due to unoptimized
    // code and extra debug info.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(8 * 1024 * 1024)
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| env::var(config::CONFIG_PATH_ENV).ok().map(PathBuf::from));
    let settings = config::Settings::load(config_path)?;

    match args.command {
        Command::Build { query_path } => run_build(&settings, &query_path).await,
        Command::Run { query_path } => run_query(&settings, &query_path).await,
    }
}

async fn load_query(query_path: &PathBuf, settings: &config::Settings) -> anyhow::Result<PqlQuery> {
    let raw = if query_path.as_os_str() == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        tokio::fs::read_to_string(query_path).await?
    };
    let mut value: serde_json::Value = serde_json::from_str(&raw)?;
    settings.search.apply_defaults(&mut value);
    let query: PqlQuery = serde_json::from_value(value)?;
    Ok(query)
}

async fn run_build(settings: &config::Settings, query_path: &PathBuf) -> anyhow::Result<()> {
    let query = load_query(query_path, settings).await?;
    let count_query = query.count;
    let built = pql::build_query(query, count_query).map_err(|err| anyhow::anyhow!(err))?;
    let (sql, values) = match built.with_clause {
        Some(with_clause) => built.query.with(with_clause).build_sqlx(SqliteQueryBuilder),
        None => built.query.build_sqlx(SqliteQueryBuilder),
    };
    println!("{sql}");
    println!("{values:?}");
    Ok(())
}

async fn run_query(settings: &config::Settings, query_path: &PathBuf) -> anyhow::Result<()> {
    let query = load_query(query_path, settings).await?;
    let count_query = query.count;

    let paths = db::migrations::migrate_databases_on_disk(
        Some(&settings.db.index_db),
        Some(&settings.db.user_data_db),
    )
    .await?;
    let mut conn = db::connect_db(&paths, false).await?;

    let built = pql::build_query(query, count_query).map_err(|err| anyhow::anyhow!(err))?;
    let extra_columns = built.extra_columns.clone();
    let (sql, values) = match built.with_clause {
        Some(with_clause) => built.query.with(with_clause).build_sqlx(SqliteQueryBuilder),
        None => built.query.build_sqlx(SqliteQueryBuilder),
    };

    let rows = sqlx::query_with(&sql, values).fetch_all(&mut conn).await?;
    let decoded = pql::decode_rows(&rows, &extra_columns);
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}
