//! `medkit-cache`: inspect and maintain a result cache on disk.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use medkit_core::{CacheError, CacheKey, MedkitError, MedkitResult, StorageSettings};
use medkit_storage::cache::{Codec, LmdbStore, RecordStore};
use medkit_storage::{telemetry, transfer};

#[derive(Parser, Debug)]
#[command(name = "medkit-cache", version, about = "Inspect and maintain a medkit result cache")]
struct Cli {
    /// Cache directory (defaults to MEDKIT_DB_PATH or storage/medkit.lmdb)
    #[arg(long, global = true, env = "MEDKIT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Capacity ceiling in megabytes
    #[arg(long, global = true, env = "MEDKIT_DB_CAPACITY_MB")]
    capacity_mb: Option<u64>,

    /// Compression threshold in bytes
    #[arg(long, global = true, env = "MEDKIT_COMPRESSION_THRESHOLD")]
    threshold: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show entry count, accounted size and capacity
    Stats,
    /// List every key as hex
    Keys,
    /// Write the decoded payload for a key to stdout
    Get { key: String },
    /// Remove the record for a key
    Delete { key: String },
    /// Remove every record
    Clear,
    /// Export all records to a JSON file
    Export { file: PathBuf },
    /// Import records from a JSON file
    Import {
        file: PathBuf,
        /// Replace records that already exist
        #[arg(long)]
        overwrite: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_tracing(cli.log_json) {
        eprintln!("warning: {}", e);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn settings_from(cli: &Cli) -> MedkitResult<StorageSettings> {
    let mut settings = StorageSettings::from_env();
    if let Some(path) = &cli.db_path {
        settings.db_path = path.clone();
    }
    if let Some(capacity_mb) = cli.capacity_mb {
        settings.db_capacity_mb = capacity_mb;
    }
    if let Some(threshold) = cli.threshold {
        settings.compression_threshold_bytes = threshold;
    }
    settings.validate()?;
    Ok(settings)
}

/// Decoded payload for `key`, or `None` when nothing is stored under it.
fn fetch_payload(store: &LmdbStore, key: &CacheKey) -> MedkitResult<Option<Vec<u8>>> {
    match store.get(key)? {
        Some(record) => Ok(Some(record.decode_payload()?)),
        None => Ok(None),
    }
}

fn run(cli: Cli) -> MedkitResult<ExitCode> {
    let settings = settings_from(&cli)?;
    let store = LmdbStore::open(settings.store_config())?;
    let mut stdout = std::io::stdout().lock();
    let mut code = ExitCode::SUCCESS;

    match cli.cmd {
        Command::Stats => {
            let stats = store.stats()?;
            writeln!(stdout, "path:               {}", store.path().display()).map_err(io_error)?;
            writeln!(stdout, "entries:            {}", stats.entries).map_err(io_error)?;
            writeln!(stdout, "size_bytes:         {}", stats.size_bytes).map_err(io_error)?;
            writeln!(stdout, "capacity_bytes:     {}", stats.capacity_bytes).map_err(io_error)?;
            writeln!(stdout, "remaining_bytes:    {}", store.capacity_remaining()).map_err(io_error)?;
            writeln!(stdout, "map_size_bytes:     {}", stats.map_size_bytes).map_err(io_error)?;
        }
        Command::Keys => {
            for key in store.keys()? {
                writeln!(stdout, "{}", key).map_err(io_error)?;
            }
        }
        Command::Get { key } => {
            let key = CacheKey::from_hex(&key)?;
            match fetch_payload(&store, &key)? {
                Some(payload) => stdout.write_all(&payload).map_err(io_error)?,
                None => {
                    eprintln!("not found: {}", key);
                    code = ExitCode::FAILURE;
                }
            }
        }
        Command::Delete { key } => {
            let key = CacheKey::from_hex(&key)?;
            let removed = store.delete(&key)?;
            writeln!(stdout, "{}", if removed { "deleted" } else { "not found" })
                .map_err(io_error)?;
        }
        Command::Clear => {
            let removed = store.clear()?;
            writeln!(stdout, "removed {} records", removed).map_err(io_error)?;
        }
        Command::Export { file } => {
            let report = transfer::export_to_path(&store, &file)?;
            writeln!(
                stdout,
                "exported {} records ({} skipped) to {}",
                report.exported,
                report.skipped,
                file.display()
            )
            .map_err(io_error)?;
        }
        Command::Import { file, overwrite } => {
            let codec = Codec::new(settings.compression_threshold_bytes);
            let overwrite = overwrite || settings.db_overwrite;
            let report = transfer::import_from_path(&store, &file, codec, overwrite)?;
            writeln!(
                stdout,
                "imported {} records ({} kept, {} skipped) from {}",
                report.imported,
                report.kept,
                report.skipped,
                file.display()
            )
            .map_err(io_error)?;
        }
    }

    drop(stdout);
    store.close().wait();
    Ok(code)
}

fn io_error(e: std::io::Error) -> MedkitError {
    MedkitError::Cache(CacheError::from(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use medkit_core::{derive_cache_key, StoreConfig};
    use medkit_storage::cache::CacheRecord;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_import_with_globals() {
        let cli = Cli::try_parse_from([
            "medkit-cache",
            "--db-path",
            "/tmp/cache.lmdb",
            "import",
            "backup.json",
            "--overwrite",
            "--capacity-mb",
            "5",
        ])
        .expect("parse should succeed");

        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/cache.lmdb")));
        assert_eq!(cli.capacity_mb, Some(5));
        assert!(matches!(cli.cmd, Command::Import { overwrite: true, .. }));
    }

    #[test]
    fn test_fetch_missing_key_is_none() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = StoreConfig::new(temp_dir.path().join("cache.lmdb"), 64 * 1024)
            .with_logging(false);
        let store = LmdbStore::open(config).expect("store creation should succeed");
        let key = derive_cache_key("never-stored").expect("derive should succeed");

        assert_eq!(fetch_payload(&store, &key).expect("fetch should succeed"), None);

        store
            .put(&CacheRecord::encode(key, b"{\"ok\":true}", 100), false)
            .expect("put should succeed");
        assert_eq!(
            fetch_payload(&store, &key).expect("fetch should succeed"),
            Some(b"{\"ok\":true}".to_vec())
        );
    }
}
