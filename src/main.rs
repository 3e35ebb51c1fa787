// ABOUTME: CLI entry point for standby-sync
// ABOUTME: Resolves settings, then runs FDW provisioning, schema sync, and data sync in order

use anyhow::Context;
use clap::Parser;
use standby_sync::config::{RunSettings, SyncArgs, SyncMode};
use standby_sync::sync::SyncSummary;
use standby_sync::{postgres, setup, sync};

#[derive(Parser)]
#[command(name = "standby-sync")]
#[command(
    about = "Bring a standby PostgreSQL database in line with its main database",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", default_value_t = false)]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    sync: SyncArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    postgres::init_tls_policy(cli.allow_self_signed_certs);

    let settings = RunSettings::from_args(cli.sync)?;
    check_connectivity(&settings).await?;

    if settings.sync.mode == SyncMode::ForeignDataWrapper {
        let target = postgres::connect_with_retry(&settings.target_url)
            .await
            .context("Failed to connect to target database")?;
        setup::setup_fdw(&target, &settings.sync.schema, &settings.source_url)
            .await
            .context("FDW setup failed")?;
    }

    if settings.sync_schema {
        setup::sync_schema(
            &settings.source_url,
            &settings.target_url,
            &settings.sync.schema,
            &settings.tools,
        )
        .await
        .context("Schema sync failed")?;
    } else {
        tracing::info!("Skipping schema sync");
    }

    if settings.sync_data {
        let backend = postgres::PgBackend::new(&settings.source_url, &settings.target_url);
        let summary = sync::run_data_sync(&backend, &settings.sync)
            .await
            .context("Data sync failed")?;
        print_summary(&summary, cli.json)?;
    } else {
        tracing::info!("Skipping data sync");
    }

    tracing::info!("Sync complete");
    Ok(())
}

/// Connect to both databases once and ping them before doing any work.
async fn check_connectivity(settings: &RunSettings) -> anyhow::Result<()> {
    let (source, target) = tokio::try_join!(
        postgres::connect_with_retry(&settings.source_url),
        postgres::connect_with_retry(&settings.target_url)
    )?;
    postgres::ping(&source)
        .await
        .context("Source database did not answer")?;
    postgres::ping(&target)
        .await
        .context("Target database did not answer")?;
    tracing::info!("Connected to source and target databases");
    Ok(())
}

fn print_summary(summary: &SyncSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "{:<40} {:<12} {:>8} {:>10} {:>10} {:>10}",
        "table", "strategy", "chunks", "inserted", "updated", "deleted"
    );
    for table in &summary.tables {
        println!(
            "{:<40} {:<12} {:>8} {:>10} {:>10} {:>10}",
            table.table,
            table.strategy.as_str(),
            table.chunks,
            table.inserted,
            table.updated,
            table.deleted
        );
    }
    for dropped in &summary.dropped_tables {
        println!("dropped extra table {}", dropped);
    }
    println!(
        "{} tables, +{} / ~{} / -{} rows in {}ms",
        summary.tables.len(),
        summary.inserted(),
        summary.updated(),
        summary.deleted(),
        summary.duration_ms
    );
    Ok(())
}
