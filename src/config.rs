// ABOUTME: Run configuration for the data sync engine
// ABOUTME: Immutable SyncConfig, command-line flags, and the TOML config file layer beneath them

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::setup::ClientTools;
use crate::utils::{
    validate_connection_string, validate_postgres_identifier, validate_source_target_different,
};

/// Format accepted for the incremental watermark.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_UPDATED_AT_COLUMN: &str = "updated_at";

/// What to do when the delete half of a chunk fails after its upserts succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Roll back only the delete; keep the chunk's upserts and log the failure.
    /// Stale target rows survive until a later run removes them.
    #[default]
    BestEffort,
    /// Fail the whole chunk; nothing from it is committed.
    Atomic,
}

/// How every table of the run is synchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Pick chunked or full-diff per table from its primary key shape.
    Diff,
    /// Only rows whose `column` is later than `since`.
    Incremental { column: String, since: NaiveDateTime },
    /// Tables are served through postgres_fdw; data sync does nothing.
    ForeignDataWrapper,
}

/// Configuration consumed by the sync engine. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub schema: String,
    pub chunk_size: u64,
    pub workers: usize,
    pub clean_extra: bool,
    pub mode: SyncMode,
    pub delete_policy: DeletePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
            clean_extra: false,
            mode: SyncMode::Diff,
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Worker pool size, never below one.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        validate_postgres_identifier(&self.schema).context("Invalid schema name")?;
        if self.chunk_size == 0 {
            bail!("Chunk size must be at least 1");
        }
        if let SyncMode::Incremental { column, .. } = &self.mode {
            if column.trim().is_empty() {
                bail!("Incremental mode needs a timestamp column name");
            }
        }
        Ok(())
    }
}

/// Parse a watermark given as `YYYY-MM-DD HH:MM:SS`.
pub fn parse_watermark(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), WATERMARK_FORMAT).with_context(|| {
        format!(
            "Invalid last sync time '{}', expected YYYY-MM-DD HH:MM:SS",
            value
        )
    })
}

/// Resolve the mode flags into a single [`SyncMode`]. FDW mode wins over
/// incremental mode, incremental mode needs a watermark.
pub fn resolve_mode(
    fdw_mode: bool,
    use_updated_at: bool,
    updated_at_column: Option<String>,
    last_sync_time: Option<&str>,
) -> Result<SyncMode> {
    if fdw_mode {
        if use_updated_at {
            tracing::warn!("FDW mode is enabled, ignoring incremental (updated_at) mode");
        }
        return Ok(SyncMode::ForeignDataWrapper);
    }
    if use_updated_at {
        let Some(raw) = last_sync_time else {
            bail!("Incremental mode requires --last-sync-time");
        };
        return Ok(SyncMode::Incremental {
            column: updated_at_column.unwrap_or_else(|| DEFAULT_UPDATED_AT_COLUMN.to_string()),
            since: parse_watermark(raw)?,
        });
    }
    Ok(SyncMode::Diff)
}

/// Settings read from a `--config` TOML file. Every field is optional;
/// command-line flags take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub source: Option<String>,
    pub target: Option<String>,
    pub schema: Option<String>,
    pub chunk_size: Option<u64>,
    pub workers: Option<i64>,
    pub clean_extra: Option<bool>,
    pub fdw_mode: Option<bool>,
    pub use_updated_at: Option<bool>,
    pub updated_at_column: Option<String>,
    pub last_sync_time: Option<String>,
    pub delete_policy: Option<DeletePolicy>,
    pub sync_schema: Option<bool>,
    pub sync_data: Option<bool>,
    pub pg_dump: Option<String>,
    pub psql: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

/// Worker count from user input; zero and negative values run one worker.
fn clamp_workers(requested: i64) -> usize {
    usize::try_from(requested.max(1)).unwrap_or(usize::MAX)
}

/// Command-line flags. Unset options fall back to the `--config` file, then
/// to the built-in defaults.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct SyncArgs {
    /// Main (source) database URL
    #[arg(long, env = "MAIN_DSN", hide_env_values = true)]
    pub source: Option<String>,
    /// Standby (target) database URL
    #[arg(long, env = "STANDIN_DSN", hide_env_values = true)]
    pub target: Option<String>,
    /// Schema to synchronize [default: public]
    #[arg(long)]
    pub schema: Option<String>,
    /// Key values per chunk for tables with a single integer primary key [default: 10000]
    #[arg(long)]
    pub chunk_size: Option<u64>,
    /// Tables synchronized in parallel; zero or less runs one worker [default: 4]
    #[arg(long, allow_negative_numbers = true)]
    pub workers: Option<i64>,
    /// Drop target tables that do not exist on the source
    #[arg(long)]
    pub clean_extra: bool,
    /// Serve the source tables through postgres_fdw instead of copying data
    #[arg(long)]
    pub fdw_mode: bool,
    /// Only sync rows modified after --last-sync-time
    #[arg(long)]
    pub use_updated_at: bool,
    /// Modification timestamp column for incremental mode [default: updated_at]
    #[arg(long)]
    pub updated_at_column: Option<String>,
    /// Incremental watermark (YYYY-MM-DD HH:MM:SS)
    #[arg(long)]
    pub last_sync_time: Option<String>,
    /// What to do when deleting stale rows fails [default: best-effort]
    #[arg(long, value_enum)]
    pub delete_policy: Option<DeletePolicy>,
    /// Skip the schema (DDL) step
    #[arg(long)]
    pub skip_schema: bool,
    /// Skip the data step
    #[arg(long)]
    pub skip_data: bool,
    /// Path to pg_dump (defaults to the one in PATH)
    #[arg(long)]
    pub pg_dump: Option<String>,
    /// Path to psql (defaults to the one in PATH)
    #[arg(long)]
    pub psql: Option<String>,
    /// TOML file with default values for these options
    #[arg(long = "config")]
    pub config_path: Option<PathBuf>,
}

/// Everything one invocation does, fully resolved and validated.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub source_url: String,
    pub target_url: String,
    pub sync: SyncConfig,
    pub sync_schema: bool,
    pub sync_data: bool,
    pub tools: ClientTools,
}

impl RunSettings {
    /// Load the config file named by `--config` (if any) and resolve.
    pub fn from_args(args: SyncArgs) -> Result<Self> {
        let file = match &args.config_path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    /// Merge flags over file values over defaults, then validate.
    pub fn resolve(args: SyncArgs, file: FileConfig) -> Result<Self> {
        let source_url = args.source.or(file.source).context(
            "Source database URL not provided. Use --source, MAIN_DSN, or `source` in the config file",
        )?;
        let target_url = args.target.or(file.target).context(
            "Target database URL not provided. Use --target, STANDIN_DSN, or `target` in the config file",
        )?;
        validate_connection_string(&source_url).context("Invalid source URL")?;
        validate_connection_string(&target_url).context("Invalid target URL")?;
        validate_source_target_different(&source_url, &target_url)?;

        let use_updated_at = args.use_updated_at || file.use_updated_at.unwrap_or(false);
        let fdw_mode = args.fdw_mode || file.fdw_mode.unwrap_or(false);
        let last_sync_time = args.last_sync_time.or(file.last_sync_time);
        let mode = resolve_mode(
            fdw_mode,
            use_updated_at,
            args.updated_at_column.or(file.updated_at_column),
            last_sync_time.as_deref(),
        )?;

        let sync = SyncConfig {
            schema: args
                .schema
                .or(file.schema)
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            chunk_size: args
                .chunk_size
                .or(file.chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            workers: args
                .workers
                .or(file.workers)
                .map(clamp_workers)
                .unwrap_or(DEFAULT_WORKERS),
            clean_extra: args.clean_extra || file.clean_extra.unwrap_or(false),
            mode,
            delete_policy: args
                .delete_policy
                .or(file.delete_policy)
                .unwrap_or_default(),
        };
        sync.validate()?;
        if let SyncMode::Incremental { column, .. } = &sync.mode {
            validate_postgres_identifier(column).context("Invalid updated-at column name")?;
        }

        Ok(Self {
            source_url,
            target_url,
            sync,
            sync_schema: !args.skip_schema && file.sync_schema.unwrap_or(true),
            sync_data: !args.skip_data && file.sync_data.unwrap_or(true),
            tools: ClientTools {
                pg_dump: args.pg_dump.or(file.pg_dump),
                psql: args.psql.or(file.psql),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.chunk_size, 10_000);
        assert_eq!(config.worker_count(), 4);
        assert!(!config.clean_extra);
        assert_eq!(config.mode, SyncMode::Diff);
        assert_eq!(config.delete_policy, DeletePolicy::BestEffort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_count_coerced_to_one() {
        let config = SyncConfig {
            workers: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = SyncConfig {
            chunk_size: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_schema_rejected() {
        let config = SyncConfig {
            schema: "public; DROP".to_string(),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_watermark() {
        let ts = parse_watermark("2024-03-01 12:30:00").unwrap();
        assert_eq!(ts.to_string(), "2024-03-01 12:30:00");
        assert!(parse_watermark("yesterday").is_err());
    }

    #[test]
    fn test_resolve_mode() {
        assert_eq!(resolve_mode(false, false, None, None).unwrap(), SyncMode::Diff);
        assert_eq!(
            resolve_mode(true, true, None, Some("2024-01-01 00:00:00")).unwrap(),
            SyncMode::ForeignDataWrapper
        );
        match resolve_mode(false, true, None, Some("2024-01-01 00:00:00")).unwrap() {
            SyncMode::Incremental { column, .. } => assert_eq!(column, "updated_at"),
            other => panic!("unexpected mode {:?}", other),
        }
        assert!(resolve_mode(false, true, None, None).is_err());
    }

    #[test]
    fn test_file_config_parse() {
        let config = FileConfig::parse(
            r#"
            source = "postgresql://u:p@main:5432/app"
            schema = "sales"
            chunk-size = 500
            workers = 8
            clean-extra = true
            delete-policy = "atomic"
            "#,
        )
        .unwrap();

        assert_eq!(config.schema.as_deref(), Some("sales"));
        assert_eq!(config.chunk_size, Some(500));
        assert_eq!(config.workers, Some(8));
        assert_eq!(config.clean_extra, Some(true));
        assert_eq!(config.delete_policy, Some(DeletePolicy::Atomic));
        assert!(config.target.is_none());
    }

    #[test]
    fn test_file_config_rejects_unknown_keys() {
        assert!(FileConfig::parse("chunksize = 5").is_err());
    }

    fn args(source: &str, target: &str) -> SyncArgs {
        SyncArgs {
            source: Some(source.to_string()),
            target: Some(target.to_string()),
            ..SyncArgs::default()
        }
    }

    const MAIN: &str = "postgresql://app:pw@main:5432/shop";
    const STANDBY: &str = "postgresql://app:pw@standby:5432/shop";

    #[test]
    fn test_resolve_defaults() {
        let settings = RunSettings::resolve(args(MAIN, STANDBY), FileConfig::default()).unwrap();
        assert_eq!(settings.sync.schema, "public");
        assert_eq!(settings.sync.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.sync.workers, DEFAULT_WORKERS);
        assert!(settings.sync_schema);
        assert!(settings.sync_data);
        assert!(settings.tools.pg_dump.is_none());
    }

    #[test]
    fn test_resolve_flags_override_file() {
        let file = FileConfig::parse(
            r#"
            source = "postgresql://app:pw@elsewhere:5432/shop"
            schema = "sales"
            chunk-size = 500
            workers = 2
            sync-schema = false
            pg-dump = "/opt/pg/bin/pg_dump"
            "#,
        )
        .unwrap();
        let mut cli = args(MAIN, STANDBY);
        cli.chunk_size = Some(50);

        let settings = RunSettings::resolve(cli, file).unwrap();
        assert_eq!(settings.source_url, MAIN);
        assert_eq!(settings.sync.schema, "sales");
        assert_eq!(settings.sync.chunk_size, 50);
        assert_eq!(settings.sync.workers, 2);
        assert!(!settings.sync_schema);
        assert_eq!(settings.tools.pg_dump.as_deref(), Some("/opt/pg/bin/pg_dump"));
    }

    #[test]
    fn test_resolve_non_positive_workers_runs_one() {
        let mut cli = args(MAIN, STANDBY);
        cli.workers = Some(-1);
        let settings = RunSettings::resolve(cli, FileConfig::default()).unwrap();
        assert_eq!(settings.sync.workers, 1);

        let file = FileConfig::parse("workers = 0").unwrap();
        let settings = RunSettings::resolve(args(MAIN, STANDBY), file).unwrap();
        assert_eq!(settings.sync.workers, 1);
    }

    #[test]
    fn test_negative_workers_flag_parses() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            args: SyncArgs,
        }

        let cli = Cli::try_parse_from(["standby-sync", "--workers", "-1"]).unwrap();
        assert_eq!(cli.args.workers, Some(-1));
        assert_eq!(clamp_workers(-1), 1);
        assert_eq!(clamp_workers(6), 6);
    }

    #[test]
    fn test_resolve_requires_urls() {
        let err = RunSettings::resolve(SyncArgs::default(), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Source database URL not provided"));
    }

    #[test]
    fn test_resolve_rejects_same_database() {
        assert!(RunSettings::resolve(args(MAIN, MAIN), FileConfig::default()).is_err());
    }

    #[test]
    fn test_resolve_incremental_mode() {
        let mut cli = args(MAIN, STANDBY);
        cli.use_updated_at = true;
        cli.last_sync_time = Some("2024-05-01 00:00:00".to_string());
        cli.updated_at_column = Some("modified".to_string());

        let settings = RunSettings::resolve(cli, FileConfig::default()).unwrap();
        match settings.sync.mode {
            SyncMode::Incremental { column, since } => {
                assert_eq!(column, "modified");
                assert_eq!(since.to_string(), "2024-05-01 00:00:00");
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_from_args_reads_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            format!("source = \"{}\"\ntarget = \"{}\"\nworkers = 9\n", MAIN, STANDBY).as_bytes(),
        )
        .unwrap();

        let cli = SyncArgs {
            config_path: Some(file.path().to_path_buf()),
            ..SyncArgs::default()
        };
        let settings = RunSettings::from_args(cli).unwrap();
        assert_eq!(settings.sync.workers, 9);
        assert_eq!(settings.target_url, STANDBY);
    }
}
