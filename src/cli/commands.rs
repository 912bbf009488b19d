//! CLI command implementations
//!
//! Each command loads the configuration, does one job and prints one JSON
//! object describing the result. Partial recovery is a success; only a
//! pass that wrote nothing, or could not start, is an error.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde_json::json;

use crate::backup::{BackupKit, RecoverKit, TableFilter, FLAG_NO_CREATE_TABLE};
use crate::config::Config;
use crate::pager::read_kdf_salt;
use crate::repair::{
    LeafInfo, MasterInfo, Outcome, RepairKit, FLAG_ALL_TABLES, FLAG_CHECK_TABLE_COLUMNS,
    FLAG_NO_CREATE_TABLES,
};

use super::args::{Cli, Command, KeyArgs};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Options of the `repair` command
#[derive(Debug)]
pub struct RepairRequest<'a> {
    pub corrupt: &'a Path,
    pub dest: &'a Path,
    pub master: Option<&'a Path>,
    pub master_key: Option<&'a [u8]>,
    pub leaf: Option<&'a Path>,
    pub tables: &'a [String],
    pub flags: u32,
    pub key: Option<&'a [u8]>,
}

/// Load the configuration and run the parsed command.
pub fn run_command(cli: Cli) -> CliResult<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_logging()?;

    match cli.command {
        Command::Repair {
            corrupt,
            dest,
            master,
            master_key,
            leaf,
            tables,
            no_create,
            all_tables,
            check_columns,
            key,
        } => {
            let mut flags = 0;
            if no_create {
                flags |= FLAG_NO_CREATE_TABLES;
            }
            if all_tables {
                flags |= FLAG_ALL_TABLES;
            }
            if check_columns {
                flags |= FLAG_CHECK_TABLE_COLUMNS;
            }
            let request = RepairRequest {
                corrupt: &corrupt,
                dest: &dest,
                master: master.as_deref(),
                master_key: master_key.as_deref().map(str::as_bytes),
                leaf: leaf.as_deref(),
                tables: &tables,
                flags,
                key: key.bytes(),
            };
            repair(&config, &request)
        }
        Command::SaveMaster {
            db,
            out,
            salt_from,
            key,
        } => save_master(&db, &out, salt_from.as_deref(), &key),
        Command::ScanLeaf { db, out, tables } => scan_leaf(&db, &out, &tables),
        Command::Backup {
            db,
            out,
            tables,
            no_create,
            key,
        } => {
            let flags = if no_create { FLAG_NO_CREATE_TABLE } else { 0 };
            backup(&db, &out, &tables, flags, &key)
        }
        Command::Recover {
            dump,
            dest,
            fatal,
            key,
        } => recover(&dump, &dest, fatal, &key),
    }
}

/// Copy what survives of `request.corrupt` into `request.dest`.
pub fn repair(config: &Config, request: &RepairRequest<'_>) -> CliResult<()> {
    let names: Vec<&str> = request.tables.iter().map(String::as_str).collect();
    let filter = if names.is_empty() { None } else { Some(names.as_slice()) };

    let master = match request.master {
        Some(path) => {
            let key = request.master_key.or(request.key);
            Some(MasterInfo::load(path, key, filter)?.0)
        }
        None if !names.is_empty() => Some(MasterInfo::make(names.iter().copied())),
        None => None,
    };
    let cipher = request.key.map(|key| config.cipher.spec(key));

    let mut kit = RepairKit::open(request.corrupt, cipher.as_ref(), master.as_ref())?;
    kit.set_commit_batch_rows(config.commit_batch_rows);
    if let Some(path) = request.leaf {
        let leaves = LeafInfo::load(path)?;
        kit.set_leaf_info(&leaves);
    }

    let dest = Connection::open(request.dest)?;
    let outcome = kit.output(&dest, request.flags);

    write_response(json!({
        "outcome": outcome,
        "session": kit.session_id().to_string(),
        "success": kit.success_count(),
        "failure": kit.failure_count(),
        "statistics": kit.statistics(),
        "integrity": {
            "header": !kit.is_header_corrupted(),
            "data": !kit.is_data_corrupted(),
            "kdf_salt": !kit.is_salt_corrupted(),
        },
        "last_error": kit.last_error(),
    }))?;

    if outcome == Outcome::Failed {
        return Err(CliError::repair_failed(
            kit.last_error().unwrap_or("no rows could be recovered"),
        ));
    }
    Ok(())
}

/// Snapshot the schema of a healthy database.
///
/// With `salt_from`, the KDF salt of that encrypted file goes into the
/// catalog so a later repair can open it after its first page is damaged.
pub fn save_master(
    db: &Path,
    out: &Path,
    salt_from: Option<&Path>,
    key: &KeyArgs,
) -> CliResult<()> {
    let conn = open_existing(db)?;
    let Some(source) = salt_from else {
        if !MasterInfo::save(&conn, out, key.bytes()) {
            return Err(CliError::repair_failed(format!(
                "could not save schema of {} to {}",
                db.display(),
                out.display()
            )));
        }
        return write_response(json!({ "saved": out.display().to_string(), "kdf_salt": false }));
    };

    let salt = read_kdf_salt(source).map_err(|e| CliError::invalid_argument(e.to_string()))?;
    let mut info = MasterInfo::capture(&conn)?;
    info.set_kdf_salt(salt);
    info.write(out, key.bytes())?;
    write_response(json!({ "saved": out.display().to_string(), "kdf_salt": true }))
}

/// Record each table's leaf pages.
pub fn scan_leaf(db: &Path, out: &Path, tables: &[String]) -> CliResult<()> {
    let conn = open_existing(db)?;
    let names: Vec<&str> = tables.iter().map(String::as_str).collect();
    let filter = if names.is_empty() { None } else { Some(names.as_slice()) };

    let info = LeafInfo::scan(&conn, filter, None)?;
    info.save(out)?;

    let leaves: usize = info
        .roots()
        .into_iter()
        .filter_map(|root| info.leaves(root).map(<[u32]>::len))
        .sum();
    write_response(json!({
        "saved": out.display().to_string(),
        "tables": info.roots().len(),
        "leaves": leaves,
    }))
}

/// Dump a database to a statement stream.
pub fn backup(
    db: &Path,
    out: &Path,
    tables: &[String],
    flags: u32,
    key: &KeyArgs,
) -> CliResult<()> {
    let conn = open_existing(db)?;
    let filters = if tables.is_empty() {
        None
    } else {
        Some(tables.iter().map(|t| parse_table_filter(t)).collect())
    };

    let mut kit = BackupKit::new(out, key.bytes(), flags, filters);
    let outcome = kit.run(&conn)?;
    write_response(json!({
        "outcome": outcome,
        "rows": kit.row_count(),
        "statements": kit.statement_count(),
    }))
}

/// Replay a dump into `dest`.
pub fn recover(dump: &Path, dest: &Path, fatal: bool, key: &KeyArgs) -> CliResult<()> {
    let mut kit = RecoverKit::new(dump, key.bytes())?;
    let conn = Connection::open(dest)?;
    let outcome = kit.run(&conn, fatal);

    write_response(json!({
        "outcome": outcome,
        "success": kit.success_count(),
        "failure": kit.failure_count(),
        "last_error": kit.last_error(),
    }))?;

    if outcome == Outcome::Failed {
        return Err(CliError::backup_failed(
            kit.last_error().unwrap_or("replay failed"),
        ));
    }
    Ok(())
}

/// `name` or `name:condition`.
fn parse_table_filter(arg: &str) -> TableFilter {
    match arg.split_once(':') {
        Some((name, condition)) if !condition.trim().is_empty() => {
            TableFilter::matching(name, condition)
        }
        Some((name, _)) => TableFilter::all_rows(name),
        None => TableFilter::all_rows(arg),
    }
}

fn open_existing(path: &Path) -> CliResult<Connection> {
    if !path.exists() {
        return Err(CliError::invalid_argument(format!(
            "{} does not exist",
            path.display()
        )));
    }
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_table_filter() {
        let all = parse_table_filter("users");
        assert_eq!(all.name, "users");
        assert!(all.condition.is_none());

        let some = parse_table_filter("users:id > 10");
        assert_eq!(some.name, "users");
        assert_eq!(some.condition.as_deref(), Some("id > 10"));

        let empty = parse_table_filter("users:");
        assert!(empty.condition.is_none());
    }

    #[test]
    fn test_open_existing_rejects_missing() {
        let dir = TempDir::new().unwrap();
        let err = open_existing(&dir.path().join("absent.db")).unwrap_err();
        assert_eq!(err.code_str(), "RESCUE_CLI_INVALID_ARGUMENT");
    }

    #[test]
    fn test_repair_command_copies_rows() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        let dest = dir.path().join("dest.db");
        {
            let conn = Connection::open(&src).unwrap();
            conn.execute_batch(
                "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT);
                 INSERT INTO t VALUES(1, 'x'), (2, 'y');",
            )
            .unwrap();
        }

        let tables: Vec<String> = Vec::new();
        let request = RepairRequest {
            corrupt: &src,
            dest: &dest,
            master: None,
            master_key: None,
            leaf: None,
            tables: &tables,
            flags: 0,
            key: None,
        };
        repair(&Config::default(), &request).unwrap();

        let conn = Connection::open(&dest).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
