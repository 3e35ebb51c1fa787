// ABOUTME: postgres_fdw provisioning on the target - extension, server, user mapping, schema import
// ABOUTME: Used by FDW mode, where the standby reads the main database's tables remotely

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::utils::{parse_postgres_url, quote_ident, quote_literal};

/// Foreign server name created on the target.
pub const FDW_SERVER_NAME: &str = "main_server";

/// DDL that wires the target to the source through postgres_fdw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdwStatements {
    pub create_extension: String,
    pub create_server: String,
    pub create_user_mapping: String,
    pub import_schema: String,
}

/// Build the provisioning statements from the source URL.
pub fn fdw_statements(schema: &str, source_url: &str) -> Result<FdwStatements> {
    let parts = parse_postgres_url(source_url).context("Failed to parse source URL")?;

    let mut server_options = vec![
        format!("host {}", quote_literal(&parts.host)),
        format!("dbname {}", quote_literal(&parts.database)),
        format!("port {}", quote_literal(&parts.port.to_string())),
    ];
    if let Some(sslmode) = parts.query_params.get("sslmode") {
        server_options.push(format!("sslmode {}", quote_literal(sslmode)));
    }

    let mut mapping_options = Vec::new();
    if let Some(user) = &parts.user {
        mapping_options.push(format!("user {}", quote_literal(user)));
    }
    if let Some(password) = &parts.password {
        mapping_options.push(format!("password {}", quote_literal(password)));
    }
    let mapping_options = if mapping_options.is_empty() {
        String::new()
    } else {
        format!(" OPTIONS ({})", mapping_options.join(", "))
    };

    let server = quote_ident(FDW_SERVER_NAME);
    let schema = quote_ident(schema);

    Ok(FdwStatements {
        create_extension: "CREATE EXTENSION IF NOT EXISTS postgres_fdw".to_string(),
        create_server: format!(
            "CREATE SERVER IF NOT EXISTS {} FOREIGN DATA WRAPPER postgres_fdw OPTIONS ({})",
            server,
            server_options.join(", ")
        ),
        create_user_mapping: format!(
            "CREATE USER MAPPING IF NOT EXISTS FOR CURRENT_USER SERVER {}{}",
            server, mapping_options
        ),
        import_schema: format!(
            "IMPORT FOREIGN SCHEMA {schema} FROM SERVER {} INTO {schema}",
            server,
            schema = schema
        ),
    })
}

/// Provision postgres_fdw on the target. A failed schema import is logged
/// and tolerated: the tables may already exist locally.
pub async fn setup_fdw(target: &Client, schema: &str, source_url: &str) -> Result<()> {
    let statements = fdw_statements(schema, source_url)?;
    let parts = parse_postgres_url(source_url)?;

    target
        .batch_execute(&statements.create_extension)
        .await
        .context("Failed to create extension postgres_fdw")?;
    tracing::info!("postgres_fdw extension available on target");

    tracing::info!(
        "Creating foreign server {} for {}:{}/{}",
        FDW_SERVER_NAME,
        parts.host,
        parts.port,
        parts.database
    );
    target
        .batch_execute(&statements.create_server)
        .await
        .context("Failed to create foreign server")?;

    tracing::info!(
        "Creating user mapping for {}",
        parts.user.as_deref().unwrap_or("(current user)")
    );
    target
        .batch_execute(&statements.create_user_mapping)
        .await
        .context("Failed to create user mapping")?;

    match target.batch_execute(&statements.import_schema).await {
        Ok(()) => tracing::info!("Imported foreign schema {}", schema),
        Err(e) => tracing::warn!("Failed to import foreign schema {}: {}", schema, e),
    }

    Ok(())
}
