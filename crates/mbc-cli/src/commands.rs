use std::time::Instant;

use anyhow::Context;
use colored::Colorize;
use serde_json::json;
use tracing::debug;

use mbc_sdk::{Cqrs, CsvImportRequest, ImportMode, InvokeContext, JobFailure, JobStatus};
use mbc_server::{AppConfig, MbcServer};
use mbc_types::{EntityKey, VersionRef, KEY_SEPARATOR};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Import(args) => cmd_import(args, cli.format).await,
        Command::Keys(args) => cmd_keys(args, cli.format),
        Command::Config => cmd_config(),
    }
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;
    }

    let server = MbcServer::new(config)?;
    println!(
        "{} MBC server on {} ({} import table(s), WAL {})",
        "✓".green().bold(),
        server.config().server.bind_addr.to_string().bold(),
        server.config().tables.len(),
        match &server.config().core.feed.wal_path {
            Some(path) => path.display().to_string().cyan(),
            None => "off".dimmed(),
        }
    );
    server.serve().await?;
    Ok(())
}

async fn cmd_import(args: ImportArgs, format: OutputFormat) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.csv)
        .with_context(|| format!("reading {}", args.csv.display()))?;
    let kind = args.kind.unwrap_or_else(|| args.table.to_uppercase());

    let cqrs = Cqrs::in_memory()?;
    let required: Vec<&str> = args.required.iter().map(String::as_str).collect();
    cqrs.register_attribute_table(&args.table, &kind, &required)?;

    let started = Instant::now();
    let ctx = InvokeContext::new(&args.user, "127.0.0.1").with_source("cli");
    let job = cqrs
        .import_csv(
            CsvImportRequest {
                table_name: args.table.clone(),
                tenant_code: args.tenant.clone(),
                content,
                mode: ImportMode::Direct,
                task_token: None,
            },
            &ctx,
        )
        .await?;
    cqrs.shutdown().await?;
    debug!(job = %job.id, status = ?job.status, "import finished");
    let failed_rows: Vec<_> = cqrs
        .job_children(&job.id)?
        .into_iter()
        .filter(|c| c.status == JobStatus::Failed)
        .collect();

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "job": job, "failedRows": failed_rows }))?
        );
        return Ok(());
    }

    let headline = if job.status == JobStatus::Completed {
        format!("{} Import completed", "✓".green().bold())
    } else {
        format!("{} Import failed", "✗".red().bold())
    };
    println!("{headline} in {:.2?}", started.elapsed());
    println!("  Job:       {}", job.id.yellow());
    println!("  Partition: {}", format!("{kind}{KEY_SEPARATOR}{}", args.tenant).cyan());
    println!(
        "  Rows:      {} processed, {} failed",
        job.processed_rows.to_string().bold(),
        if job.failed_rows > 0 {
            job.failed_rows.to_string().red().bold()
        } else {
            job.failed_rows.to_string().green()
        }
    );
    for row in &failed_rows {
        let reason = match &row.error {
            Some(JobFailure::Validation { failures }) => failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            Some(other) => other.to_string(),
            None => "unknown".into(),
        };
        println!("    row {:>5}: {}", row.row.unwrap_or_default(), reason.red());
    }
    Ok(())
}

fn cmd_keys(args: KeysArgs, format: OutputFormat) -> anyhow::Result<()> {
    let key = EntityKey::new(args.pk, args.sk);
    let kind = key.pk.split(KEY_SEPARATOR).next().unwrap_or_default().to_string();
    let version = match key.version() {
        VersionRef::Latest => None,
        VersionRef::At(v) => Some(v),
    };

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "pk": key.pk,
                "sk": key.sk,
                "type": kind,
                "tenantCode": key.tenant_code(),
                "id": key.id(),
                "version": version,
            }))?
        );
        return Ok(());
    }

    println!("Key {} / {}", key.pk.bold(), key.sk.bold());
    println!("  Type:    {}", kind.cyan());
    match key.tenant_code() {
        Some(tenant) => println!("  Tenant:  {}", tenant.yellow()),
        None => println!("  Tenant:  {}", "missing".red()),
    }
    println!("  Id:      {}", key.id());
    match version {
        Some(v) => println!("  Version: {}", v.to_string().green()),
        None => println!("  Version: {}", "latest".dimmed()),
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(&AppConfig::default())?);
    Ok(())
}
