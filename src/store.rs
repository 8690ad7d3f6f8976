use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use tokio::{task, time};

use crate::{
    error::StoreError,
    models::{Host, HostDepth, NewHost, Port, Script},
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    address     TEXT NOT NULL UNIQUE COLLATE NOCASE,
    name        TEXT,
    comment     TEXT,
    raw_report  BLOB NOT NULL,
    batch_id    TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ports (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id  INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    port     INTEGER NOT NULL CHECK (port BETWEEN 0 AND 65535),
    protocol TEXT NOT NULL,
    state    TEXT NOT NULL,
    service  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ports_host ON ports(host_id, position);
CREATE INDEX IF NOT EXISTS idx_ports_number_state ON ports(port, state);

-- A script belongs to exactly one host (host-level) or one port.
CREATE TABLE IF NOT EXISTS scripts (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id  INTEGER REFERENCES hosts(id) ON DELETE CASCADE,
    port_id  INTEGER REFERENCES ports(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    title    TEXT NOT NULL,
    output   TEXT NOT NULL,
    CHECK ((host_id IS NULL) <> (port_id IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_scripts_host ON scripts(host_id, position);
CREATE INDEX IF NOT EXISTS idx_scripts_port ON scripts(port_id, position);
"#;

#[derive(Debug, Clone, Copy)]
enum ScriptOwner {
    Host(i64),
    Port(i64),
}

/// Point in time after which storage work stops and rolls back instead of
/// committing.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.remaining().is_zero() {
            return Err(StoreError::TimedOut(self.budget));
        }
        Ok(())
    }
}

/// SQLite-backed host store. Every operation opens its own connection, so the
/// store is cheap to clone and safe to share across blocking workers; isolation
/// between them comes from SQLite transactions.
#[derive(Debug, Clone)]
pub struct HostStore {
    path: PathBuf,
    busy_timeout: Duration,
    deadline: Option<Deadline>,
}

impl HostStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let store = Self {
            path: path.to_path_buf(),
            busy_timeout,
            deadline: None,
        };

        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(store)
    }

    /// Handle whose operations all end by `deadline`: lock waits are cut short
    /// and an operation started after it fails with [`StoreError::TimedOut`]
    /// before touching the database.
    pub fn until(&self, deadline: Deadline) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn check_deadline(&self) -> Result<(), StoreError> {
        match &self.deadline {
            Some(deadline) => deadline.check(),
            None => Ok(()),
        }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        self.check_deadline()?;
        let busy_timeout = match &self.deadline {
            Some(deadline) => self.busy_timeout.min(deadline.remaining()),
            None => self.busy_timeout,
        };

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    pub fn exists(&self, address: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let found = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM hosts WHERE address = ?1)",
            params![address],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    pub fn get(&self, address: &str, depth: HostDepth) -> Result<Option<Host>, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let host = tx
            .query_row(
                "SELECT id, address, name, comment, raw_report, batch_id, ingested_at
                 FROM hosts WHERE address = ?1",
                params![address],
                host_from_row,
            )
            .optional()?;

        let Some(mut host) = host else {
            return Ok(None);
        };

        if depth.loads_ports() {
            host.ports = load_ports(&tx, host.id, depth.loads_port_scripts())?;
        }
        if depth.loads_host_scripts() {
            host.host_scripts = load_scripts(&tx, ScriptOwner::Host(host.id))?;
        }

        tx.commit()?;
        Ok(Some(host))
    }

    pub fn list_addresses(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT address FROM hosts ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }

    pub fn find_addresses_by_open_port(&self, port: u16) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT h.address FROM hosts h
             WHERE EXISTS (
                 SELECT 1 FROM ports p
                 WHERE p.host_id = h.id AND p.port = ?1 AND p.state = 'open'
             )
             ORDER BY h.id",
        )?;
        let rows = stmt.query_map(params![port], |row| row.get(0))?;
        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }

    pub fn count_hosts(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM hosts", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Removes a host together with its ports and scripts (schema-level cascade).
    pub fn delete_by_address(&self, address: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM hosts WHERE address = ?1", params![address])?;
        Ok(removed > 0)
    }

    /// Writes every host with its owned subtree in one transaction. Either all
    /// hosts become visible or none do; a deadline passing before the commit
    /// rolls the whole batch back.
    pub fn insert_batch(
        &self,
        batch_id: &str,
        ingested_at: DateTime<Utc>,
        hosts: &[NewHost],
    ) -> Result<usize, StoreError> {
        if hosts.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ingested_at = ingested_at.to_rfc3339();

        {
            let mut insert_host = tx.prepare(
                "INSERT INTO hosts (address, name, comment, raw_report, batch_id, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut insert_port = tx.prepare(
                "INSERT INTO ports (host_id, position, port, protocol, state, service)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut insert_script = tx.prepare(
                "INSERT INTO scripts (host_id, port_id, position, title, output)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for host in hosts {
                insert_host.execute(params![
                    host.address,
                    host.name,
                    host.comment,
                    host.raw_report,
                    batch_id,
                    ingested_at,
                ])?;
                let host_id = tx.last_insert_rowid();

                for (position, port) in host.ports.iter().enumerate() {
                    insert_port.execute(params![
                        host_id,
                        position as i64,
                        port.number,
                        port.protocol,
                        port.state,
                        port.service,
                    ])?;
                    let port_id = tx.last_insert_rowid();

                    for (position, script) in port.scripts.iter().enumerate() {
                        insert_script.execute(params![
                            None::<i64>,
                            port_id,
                            position as i64,
                            script.title,
                            script.output,
                        ])?;
                    }
                }

                for (position, script) in host.host_scripts.iter().enumerate() {
                    insert_script.execute(params![
                        host_id,
                        None::<i64>,
                        position as i64,
                        script.title,
                        script.output,
                    ])?;
                }

                self.check_deadline()?;
            }
        }

        self.check_deadline()?;
        tx.commit()?;
        Ok(hosts.len())
    }

    #[cfg(test)]
    pub(crate) fn row_counts(&self) -> Result<(i64, i64, i64), StoreError> {
        let conn = self.connect()?;
        let count = |table: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok((count("hosts")?, count("ports")?, count("scripts")?))
    }
}

/// Runs a blocking read off the async runtime, failing with
/// [`StoreError::TimedOut`] instead of waiting past `timeout`.
pub async fn offload<T, E, F>(timeout: Duration, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    match time::timeout(timeout, task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(StoreError::Worker(join_err.to_string()).into()),
        Err(_) => Err(StoreError::TimedOut(timeout).into()),
    }
}

/// Runs a blocking storage job that writes. The job is bound to `deadline`
/// and rolls back on its own once it passes, so it is awaited to the end and
/// the reply always matches what was committed.
pub async fn offload_until<T, E, F>(deadline: Deadline, f: F) -> Result<T, E>
where
    F: FnOnce(Deadline) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    match task::spawn_blocking(move || f(deadline)).await {
        Ok(result) => result,
        Err(join_err) => Err(StoreError::Worker(join_err.to_string()).into()),
    }
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    let ingested_raw: String = row.get(6)?;
    let ingested_at = DateTime::parse_from_rfc3339(&ingested_raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(err)))?;

    Ok(Host {
        id: row.get(0)?,
        address: row.get(1)?,
        name: row.get(2)?,
        comment: row.get(3)?,
        raw_report: row.get(4)?,
        batch_id: row.get(5)?,
        ingested_at,
        ports: Vec::new(),
        host_scripts: Vec::new(),
    })
}

fn load_ports(
    tx: &Transaction<'_>,
    host_id: i64,
    with_scripts: bool,
) -> Result<Vec<Port>, StoreError> {
    let mut stmt = tx.prepare(
        "SELECT id, port, protocol, state, service FROM ports
         WHERE host_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![host_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Port {
                number: row.get(1)?,
                protocol: row.get(2)?,
                state: row.get(3)?,
                service: row.get(4)?,
                scripts: Vec::new(),
            },
        ))
    })?;

    let mut ports = Vec::new();
    for row in rows {
        let (port_id, mut port) = row?;
        if with_scripts {
            port.scripts = load_scripts(tx, ScriptOwner::Port(port_id))?;
        }
        ports.push(port);
    }
    Ok(ports)
}

fn load_scripts(tx: &Transaction<'_>, owner: ScriptOwner) -> Result<Vec<Script>, StoreError> {
    let (sql, owner_id) = match owner {
        ScriptOwner::Host(id) => (
            "SELECT title, output FROM scripts WHERE host_id = ?1 ORDER BY position",
            id,
        ),
        ScriptOwner::Port(id) => (
            "SELECT title, output FROM scripts WHERE port_id = ?1 ORDER BY position",
            id,
        ),
    };

    let mut stmt = tx.prepare(sql)?;
    let rows = stmt.query_map(params![owner_id], |row| {
        Ok(Script {
            title: row.get(0)?,
            output: row.get(1)?,
        })
    })?;

    let mut scripts = Vec::new();
    for row in rows {
        scripts.push(row?);
    }
    Ok(scripts)
}
