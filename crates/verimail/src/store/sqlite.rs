//! SQLite-backed verification store.

use super::{is_expired, AddressStatus, StoreStats, VerificationRecord, VerificationState, VerificationStore};
use crate::error::{VerifyError, VerifyResult};
use crate::token;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Durable store. The connection mutex is the serialization point; every
/// mutating operation runs inside a single transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    token_ttl: Option<Duration>,
}

impl SqliteStore {
    /// Open or create a database file at `path`
    pub fn open<P: AsRef<Path>>(path: P, token_ttl: Option<Duration>) -> VerifyResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn, token_ttl)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(token_ttl: Option<Duration>) -> VerifyResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, token_ttl)
    }

    fn with_connection(conn: Connection, token_ttl: Option<Duration>) -> VerifyResult<Self> {
        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            token_ttl,
        })
    }

    fn migrate(conn: &Connection) -> VerifyResult<()> {
        let current_version = Self::schema_version(conn)?;

        if current_version < SCHEMA_VERSION {
            info!(
                current = current_version,
                target = SCHEMA_VERSION,
                "Running database migrations"
            );

            if current_version < 1 {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS schema_version (
                        version INTEGER PRIMARY KEY
                    );

                    CREATE TABLE IF NOT EXISTS verifications (
                        address TEXT PRIMARY KEY,
                        token TEXT UNIQUE,
                        state TEXT NOT NULL,
                        issued_at TEXT NOT NULL,
                        verified_at TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_verifications_state ON verifications(state, issued_at);
                    "#,
                )?;
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    fn schema_version(conn: &Connection) -> VerifyResult<i32> {
        let table_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(0);
        }

        Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0).map(|v| v.unwrap_or(0))
        })?)
    }

    fn lock(&self) -> VerifyResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VerifyError::storage("connection lock poisoned"))
    }

    fn fresh_token(tx: &Transaction<'_>) -> VerifyResult<String> {
        loop {
            let token = token::generate();
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM verifications WHERE token = ?1)",
                params![token],
                |row| row.get(0),
            )?;
            if !taken {
                return Ok(token);
            }
        }
    }
}

/// Fixed-width UTC timestamps so that text comparison matches time order
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> VerifyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| VerifyError::storage(format!("corrupt timestamp {:?}: {}", s, e)))
}

struct RawRecord {
    address: String,
    token: Option<String>,
    state: String,
    issued_at: String,
    verified_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            token: row.get(1)?,
            state: row.get(2)?,
            issued_at: row.get(3)?,
            verified_at: row.get(4)?,
        })
    }

    fn into_record(self) -> VerifyResult<VerificationRecord> {
        let state = VerificationState::parse(&self.state)
            .ok_or_else(|| VerifyError::storage(format!("corrupt state {:?}", self.state)))?;
        Ok(VerificationRecord {
            address: self.address,
            token: self.token,
            state,
            issued_at: parse_timestamp(&self.issued_at)?,
            verified_at: self.verified_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

impl VerificationStore for SqliteStore {
    fn issue(&self, address: &str) -> VerifyResult<String> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let token = Self::fresh_token(&tx)?;
        tx.execute(
            "INSERT INTO verifications (address, token, state, issued_at, verified_at)
             VALUES (?1, ?2, ?3, ?4, NULL)
             ON CONFLICT(address) DO UPDATE SET
                token = excluded.token,
                state = excluded.state,
                issued_at = excluded.issued_at,
                verified_at = NULL",
            params![
                address,
                token,
                VerificationState::Pending.as_str(),
                format_timestamp(Utc::now())
            ],
        )?;
        tx.commit()?;

        debug!("Issued token for {}", address);
        Ok(token)
    }

    fn consume(&self, token: &str) -> VerifyResult<String> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT address, issued_at FROM verifications WHERE token = ?1 AND state = ?2",
                params![token, VerificationState::Pending.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((address, issued_at)) = row else {
            return Err(VerifyError::TokenNotFound);
        };

        if is_expired(parse_timestamp(&issued_at)?, self.token_ttl, now) {
            tx.execute("DELETE FROM verifications WHERE address = ?1", params![address])?;
            tx.commit()?;
            warn!("Attempted to use expired token for {}", address);
            return Err(VerifyError::TokenNotFound);
        }

        tx.execute(
            "UPDATE verifications SET state = ?2, token = NULL, verified_at = ?3 WHERE address = ?1",
            params![address, VerificationState::Verified.as_str(), format_timestamp(now)],
        )?;
        tx.commit()?;

        debug!("Consumed token for {}", address);
        Ok(address)
    }

    fn status(&self, address: &str) -> VerifyResult<AddressStatus> {
        Ok(self
            .record(address)?
            .map(|record| record.state.into())
            .unwrap_or(AddressStatus::Unknown))
    }

    fn record(&self, address: &str) -> VerifyResult<Option<VerificationRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT address, token, state, issued_at, verified_at
                 FROM verifications WHERE address = ?1",
                params![address],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn purge_expired(&self) -> VerifyResult<u64> {
        let Some(ttl) = self.token_ttl else {
            return Ok(0);
        };

        let cutoff = format_timestamp(Utc::now() - ttl);
        let conn = self.lock()?;
        let purged = conn.execute(
            "DELETE FROM verifications WHERE state = ?1 AND issued_at <= ?2",
            params![VerificationState::Pending.as_str(), cutoff],
        )?;

        info!("Purged {} expired pending records", purged);
        Ok(purged as u64)
    }

    fn stats(&self) -> VerifyResult<StoreStats> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM verifications GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = StoreStats::default();
        for row in rows {
            let (state, count) = row?;
            match VerificationState::parse(&state) {
                Some(VerificationState::Pending) => stats.pending = count as usize,
                Some(VerificationState::Verified) => stats.verified = count as usize,
                None => warn!("Ignoring records with unknown state {:?}", state),
            }
        }
        Ok(stats)
    }
}
