//! fastpg: run named-parameter SQL from the shell
//!
//! # Usage
//!
//! ```bash
//! # Execute a query
//! fastpg "SELECT * FROM users WHERE id = :id" -p id=42
//!
//! # Dry run (show compiled SQL only)
//! fastpg "UPDATE users SET name = :name WHERE id = :id" -p id=7 -p name=alice --dry-run
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use colored::*;
use fastpg::prelude::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fastpg")]
#[command(version)]
#[command(about = "Named-parameter PostgreSQL queries", long_about = None)]
#[command(after_help = "EXAMPLES:
    fastpg 'SELECT * FROM users WHERE active = :active' -p active=true
    fastpg 'SELECT :doc::jsonb AS doc' -p 'doc={\"a\": 1}'
    fastpg 'DELETE FROM sessions WHERE user_id = :id' -p id=7 --dry-run")]
struct Cli {
    /// The SQL to execute, with :name placeholders
    query: String,

    /// Named parameter as key=value (repeatable)
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Don't execute, just show the compiled SQL
    #[arg(short, long)]
    dry_run: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Database connection URL
    #[arg(long, env = "FASTPG_DATABASE_URL")]
    database_url: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run inside a transaction that is always rolled back
    #[arg(long)]
    force_rollback: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "fastpg=debug" } else { "fastpg=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let params = parse_params(&cli.params)?;

    if cli.verbose {
        println!("{} {}", "Input:".dimmed(), cli.query.yellow());
    }

    let config = load_config(cli)?;

    let Some(config) = config.filter(|_| !cli.dry_run) else {
        show_compiled(&cli.query, &params);
        if !cli.dry_run {
            println!();
            println!(
                "{}",
                "⚠ No database URL. Use --database-url, --config or set FASTPG_DATABASE_URL"
                    .yellow()
            );
        }
        return Ok(());
    };

    let db = Database::new(config)?;
    db.connect().await.context("failed to connect")?;

    let result = execute(&db, &cli.query, &params, &cli.format).await;
    db.disconnect_default().await?;
    result
}

fn load_config(cli: &Cli) -> Result<Option<DatabaseConfig>> {
    let mut config = if let Some(url) = &cli.database_url {
        DatabaseConfig::from_dsn(url.clone())
    } else if let Some(path) = &cli.config {
        DatabaseConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?
    } else {
        match DatabaseConfig::default_path().filter(|p| p.exists()) {
            Some(path) => DatabaseConfig::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => return Ok(None),
        }
    };

    if cli.force_rollback {
        config.force_rollback = true;
    }
    Ok(Some(config))
}

async fn execute(db: &Database, query: &str, params: &Params, format: &OutputFormat) -> Result<()> {
    let values = (!params.is_empty()).then_some(params);

    if returns_rows(query) {
        let records = db.fetch_many(query, values).await?;
        format_output(&records, format)?;
    } else {
        let affected = db.execute(query, values).await?;
        println!("{} {} rows affected", "✓".green(), affected);
    }
    Ok(())
}

fn show_compiled(query: &str, params: &Params) {
    let compiled = compile_query(query, Some(params));

    println!("{}", "Compiled SQL:".green().bold());
    println!("{}", compiled.sql.white());

    if !compiled.args.is_empty() {
        println!();
        println!("{}", "Bindings:".cyan());
        // Arguments follow the parameters' insertion order.
        for (i, (name, value)) in params.iter().enumerate() {
            println!("  ${} = {} {}", i + 1, value.to_string().yellow(), format!(":{}", name).dimmed());
        }
    }
}

/// Statements whose results are rows rather than a row count.
fn returns_rows(query: &str) -> bool {
    let upper = query.trim_start().to_ascii_uppercase();
    ["SELECT", "WITH", "VALUES", "SHOW"]
        .iter()
        .any(|kw| upper.starts_with(kw))
        || upper.contains("RETURNING")
}

fn parse_params(raw: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("parameter '{}' is not KEY=VALUE", pair);
        };
        let key = key.trim().trim_start_matches(':');
        if key.is_empty() {
            bail!("parameter '{}' has an empty name", pair);
        }
        params.insert(key, parse_value(value));
    }
    Ok(params)
}

fn parse_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        Value::Int(n)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else if raw == "true" || raw == "false" {
        Value::Bool(raw == "true")
    } else if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(id) = uuid::Uuid::parse_str(raw) {
        Value::Uuid(id)
    } else if raw.starts_with('{') || raw.starts_with('[') {
        serde_json::from_str(raw)
            .map(Value::Json)
            .unwrap_or_else(|_| Value::Text(raw.to_string()))
    } else {
        Value::Text(raw.to_string())
    }
}

fn format_output(records: &[Record], format: &OutputFormat) -> Result<()> {
    if records.is_empty() {
        println!("{}", "(no results)".dimmed());
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        OutputFormat::Table => {
            let columns: Vec<&str> = records[0].keys().collect();

            let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
            for record in records {
                for (w, value) in widths.iter_mut().zip(record.values()) {
                    *w = (*w).max(value.to_string().len());
                }
            }

            let header: Vec<String> = columns
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:width$}", c, width = w))
                .collect();
            println!("{}", header.join(" │ ").white().bold());

            let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
            println!("{}", sep.join("─┼─").dimmed());

            for record in records {
                let cells: Vec<String> = record
                    .values()
                    .zip(&widths)
                    .map(|(v, w)| format!("{:width$}", v.to_string(), width = w))
                    .collect();
                println!("{}", cells.join(" │ "));
            }

            println!();
            println!("{} row(s) returned", records.len().to_string().cyan());
        }
    }
    Ok(())
}
