// ABOUTME: Schema (DDL) synchronization - pipes pg_dump --schema-only from the source into psql
// ABOUTME: Statement errors for objects that already exist on the target are logged, not fatal

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::utils::{
    find_client_tool, get_keepalive_env_vars, parse_postgres_url, quote_ident,
    strip_password_from_url,
};

/// Where to find the client tools. `None` means "look in PATH".
#[derive(Debug, Clone, Default)]
pub struct ClientTools {
    pub pg_dump: Option<String>,
    pub psql: Option<String>,
}

/// Copy the DDL of `schema` from the source to the target.
///
/// Passwords are handed to the tools through `PGPASSWORD`, never on the
/// command line.
pub async fn sync_schema(
    source_url: &str,
    target_url: &str,
    schema: &str,
    tools: &ClientTools,
) -> Result<()> {
    let pg_dump = find_client_tool("pg_dump", tools.pg_dump.as_deref())?;
    let psql = find_client_tool("psql", tools.psql.as_deref())?;

    tracing::info!("Synchronizing schema {} (DDL)...", schema);
    let ddl = dump_schema(&pg_dump, source_url, schema).await?;
    if ddl.trim().is_empty() {
        tracing::info!("pg_dump returned no DDL; schema {} may be empty", schema);
        return Ok(());
    }
    tracing::info!("Received ~{} bytes of DDL", ddl.len());

    apply_ddl(&psql, target_url, &ddl).await?;
    tracing::info!("Schema {} synchronized", schema);
    Ok(())
}

/// Arguments for `pg_dump`; `url` must already be stripped of its password.
pub fn pg_dump_args(schema: &str, url: &str) -> Vec<String> {
    vec![
        "--schema-only".to_string(),
        "--schema".to_string(),
        quote_ident(schema),
        "--no-owner".to_string(),
        "--no-privileges".to_string(),
        "--dbname".to_string(),
        url.to_string(),
    ]
}

/// Arguments for `psql`; DDL is read from stdin.
pub fn psql_args(url: &str) -> Vec<String> {
    vec![
        "--no-psqlrc".to_string(),
        "--quiet".to_string(),
        "--dbname".to_string(),
        url.to_string(),
    ]
}

/// `ERROR:` lines from psql's stderr.
pub fn psql_errors(stderr: &str) -> Vec<&str> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("ERROR:"))
        .collect()
}

fn tool_command(tool: &Path, url: &str) -> Result<(Command, String)> {
    let parts = parse_postgres_url(url)?;
    let stripped = strip_password_from_url(url)?;

    let mut cmd = Command::new(tool);
    if let Some(password) = &parts.password {
        cmd.env("PGPASSWORD", password);
    }
    for (key, value) in parts.to_pg_env_vars() {
        cmd.env(key, value);
    }
    for (key, value) in get_keepalive_env_vars() {
        cmd.env(key, value);
    }
    Ok((cmd, stripped))
}

async fn dump_schema(pg_dump: &Path, source_url: &str, schema: &str) -> Result<String> {
    let (mut cmd, url) = tool_command(pg_dump, source_url)?;
    let args = pg_dump_args(schema, &url);
    tracing::debug!("Running {} {}", pg_dump.display(), args.join(" "));

    let output = cmd
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {}", pg_dump.display()))?;

    if !output.status.success() {
        bail!(
            "pg_dump failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    String::from_utf8(output.stdout).context("pg_dump produced non-UTF-8 output")
}

async fn apply_ddl(psql: &Path, target_url: &str, ddl: &str) -> Result<()> {
    let (mut cmd, url) = tool_command(psql, target_url)?;
    let mut child = cmd
        .args(psql_args(&url))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {}", psql.display()))?;

    let mut stdin = child
        .stdin
        .take()
        .context("psql stdin was not captured")?;
    // Feed stdin from its own task so psql never blocks on a full stderr pipe
    let ddl = ddl.as_bytes().to_vec();
    let writer = tokio::spawn(async move {
        let result = stdin.write_all(&ddl).await;
        drop(stdin);
        result
    });

    let output = child
        .wait_with_output()
        .await
        .context("Failed to wait for psql")?;
    writer
        .await
        .context("DDL writer task failed")?
        .context("Failed to write DDL to psql")?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        bail!("psql failed with {}: {}", output.status, stderr.trim());
    }

    let errors = psql_errors(&stderr);
    if !errors.is_empty() {
        tracing::warn!(
            "{} DDL statements failed on the target (usually objects that already exist)",
            errors.len()
        );
        for error in errors {
            tracing::debug!("psql: {}", error);
        }
    }

    Ok(())
}
