//! Local SQLite record of what each bootstrap run actually landed.
//!
//! Deployments cannot be recalled, so after a failed run the journal is the
//! only place that says which artifacts exist on the backend and how far each
//! one got.

use crate::core::address::{Address, ResolvedAddress};
use crate::core::artifact::{ArtifactId, ArtifactKind};
use crate::core::error::{KeystoneError, RunError};
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

pub const JOURNAL_SCHEMA_RUNS: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        status TEXT NOT NULL,
        hub TEXT NOT NULL,
        error TEXT
    )
";

pub const JOURNAL_SCHEMA_LANDED: &str = "
    CREATE TABLE IF NOT EXISTS landed (
        run_id TEXT NOT NULL,
        artifact_id TEXT NOT NULL,
        address TEXT NOT NULL,
        kind TEXT NOT NULL,
        phase TEXT NOT NULL,
        ts TEXT NOT NULL,
        PRIMARY KEY (run_id, artifact_id),
        FOREIGN KEY(run_id) REFERENCES runs(run_id)
    )
";

pub const JOURNAL_SCHEMA_REGISTRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS registrations (
        run_id TEXT NOT NULL,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        ts TEXT NOT NULL,
        PRIMARY KEY (run_id, name),
        FOREIGN KEY(run_id) REFERENCES runs(run_id)
    )
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    fn from_status_str(s: &str) -> Self {
        match s {
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub hub: String,
    pub error: Option<String>,
}

/// An artifact that reached the backend, and the last step it completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandedRecord {
    pub artifact: ArtifactId,
    pub address: Address,
    pub kind: String,
    pub phase: String,
    pub ts: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationRecord {
    pub name: String,
    pub address: Address,
    pub ts: String,
}

pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (creating if needed) the journal database at `path`.
    pub fn open(path: &Path) -> Result<Self, KeystoneError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, KeystoneError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, KeystoneError> {
        conn.execute("PRAGMA foreign_keys=ON;", [])?;
        conn.execute(JOURNAL_SCHEMA_RUNS, [])?;
        conn.execute(JOURNAL_SCHEMA_LANDED, [])?;
        conn.execute(JOURNAL_SCHEMA_REGISTRATIONS, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, rusqlite::Error>,
    ) -> Result<R, KeystoneError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&conn)?)
    }

    /// Start a run and return its id.
    pub fn begin_run(&self, hub: &ArtifactId) -> Result<String, KeystoneError> {
        let run_id = time::new_run_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, started_at, status, hub) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, time::now_epoch_z(), RunStatus::Running.as_str(), hub.as_str()],
            )
        })?;
        Ok(run_id)
    }

    pub fn record_landed(
        &self,
        run_id: &str,
        kind: ArtifactKind,
        landed: &ResolvedAddress,
    ) -> Result<(), KeystoneError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO landed (run_id, artifact_id, address, kind, phase, ts)
                 VALUES (?1, ?2, ?3, ?4, 'deploy', ?5)",
                params![
                    run_id,
                    landed.artifact().as_str(),
                    landed.address().to_hex(),
                    kind.as_str(),
                    time::now_epoch_z()
                ],
            )
        })?;
        Ok(())
    }

    /// Mark the last step a landed artifact completed.
    pub fn advance(&self, run_id: &str, artifact: &ArtifactId, phase: &str) -> Result<(), KeystoneError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE landed SET phase = ?3, ts = ?4 WHERE run_id = ?1 AND artifact_id = ?2",
                params![run_id, artifact.as_str(), phase, time::now_epoch_z()],
            )
        })?;
        if changed == 0 {
            return Err(KeystoneError::NotFound(format!(
                "landed artifact {} in run {}",
                artifact, run_id
            )));
        }
        Ok(())
    }

    pub fn record_registration(
        &self,
        run_id: &str,
        name: &str,
        address: Address,
    ) -> Result<(), KeystoneError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO registrations (run_id, name, address, ts)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, name, address.to_hex(), time::now_epoch_z()],
            )
        })?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &str, error: Option<&RunError>) -> Result<(), KeystoneError> {
        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let message = error.map(|e| e.to_string());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET finished_at = ?2, status = ?3, error = ?4 WHERE run_id = ?1",
                params![run_id, time::now_epoch_z(), status.as_str(), message],
            )
        })?;
        Ok(())
    }

    /// Every run, newest first.
    pub fn runs(&self) -> Result<Vec<RunRecord>, KeystoneError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, started_at, finished_at, status, hub, error
                 FROM runs ORDER BY run_id DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    status: RunStatus::from_status_str(&row.get::<_, String>(3)?),
                    hub: row.get(4)?,
                    error: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunRecord>, KeystoneError> {
        Ok(self.runs()?.into_iter().find(|r| r.run_id == run_id))
    }

    /// The most recent run id, if any run was recorded.
    pub fn latest_run_id(&self) -> Result<Option<String>, KeystoneError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id FROM runs ORDER BY run_id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn landed(&self, run_id: &str) -> Result<Vec<LandedRecord>, KeystoneError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT artifact_id, address, kind, phase, ts FROM landed
                 WHERE run_id = ?1 ORDER BY artifact_id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;

        rows.into_iter()
            .map(|(artifact, address, kind, phase, ts)| {
                Ok(LandedRecord {
                    artifact: ArtifactId::new(artifact),
                    address: Address::from_str(&address)?,
                    kind,
                    phase,
                    ts,
                })
            })
            .collect()
    }

    pub fn registrations(&self, run_id: &str) -> Result<Vec<RegistrationRecord>, KeystoneError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, address, ts FROM registrations WHERE run_id = ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;

        rows.into_iter()
            .map(|(name, address, ts)| {
                Ok(RegistrationRecord {
                    name,
                    address: Address::from_str(&address)?,
                    ts,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Phase;

    fn landed(id: &str, b: u8) -> ResolvedAddress {
        ResolvedAddress::new(ArtifactId::from(id), Address::from_bytes(&[b; 20]).unwrap())
    }

    #[test]
    fn test_run_lifecycle() {
        let journal = Journal::in_memory().unwrap();
        let run_id = journal.begin_run(&ArtifactId::from("Hub")).unwrap();

        journal
            .record_landed(&run_id, ArtifactKind::Module, &landed("Hub", 1))
            .unwrap();
        journal
            .advance(&run_id, &ArtifactId::from("Hub"), "settled")
            .unwrap();
        journal
            .record_registration(&run_id, "Hub", Address::from_bytes(&[1; 20]).unwrap())
            .unwrap();
        journal.finish_run(&run_id, None).unwrap();

        let run = journal.run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.finished_at.is_some());
        assert!(run.error.is_none());

        let rows = journal.landed(&run_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].phase, "settled");
        assert_eq!(rows[0].kind, "module");
        assert_eq!(journal.registrations(&run_id).unwrap()[0].name, "Hub");
        assert_eq!(journal.latest_run_id().unwrap(), Some(run_id));
    }

    #[test]
    fn test_failed_run_keeps_error() {
        let journal = Journal::in_memory().unwrap();
        let run_id = journal.begin_run(&ArtifactId::from("Hub")).unwrap();
        let err = RunError::new(
            &ArtifactId::from("M"),
            Phase::Deploy,
            KeystoneError::Backend("out of gas".into()),
        );
        journal.finish_run(&run_id, Some(&err)).unwrap();

        let run = journal.run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("out of gas"));
    }

    #[test]
    fn test_advance_unknown_artifact_is_not_found() {
        let journal = Journal::in_memory().unwrap();
        let run_id = journal.begin_run(&ArtifactId::from("Hub")).unwrap();
        let err = journal
            .advance(&run_id, &ArtifactId::from("Ghost"), "bind")
            .unwrap_err();
        assert!(matches!(err, KeystoneError::NotFound(_)));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.db");
        let journal = Journal::open(&path).unwrap();
        journal.begin_run(&ArtifactId::from("Hub")).unwrap();
        assert!(path.exists());
        assert_eq!(Journal::open(&path).unwrap().runs().unwrap().len(), 1);
    }
}
