use std::net::IpAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql, Transaction};
use tokio::sync::Mutex;

// SQLite refuses statements with more than 999 bound parameters, so pruning
// works in id batches of at most that size.
const MAX_BATCH: usize = 999;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rr_question (
  id                INTEGER           PRIMARY KEY,
  name              TEXT              NOT NULL,
  CONSTRAINT        name_unique       UNIQUE (name)
);

CREATE TABLE IF NOT EXISTS rr_answer (
  id                INTEGER           PRIMARY KEY,
  name              TEXT              NOT NULL,
  CONSTRAINT        name_unique       UNIQUE (name)
);

CREATE TABLE IF NOT EXISTS rr_type (
  id                INTEGER           PRIMARY KEY,
  type              INTEGER           NOT NULL,
  CONSTRAINT        type_unique       UNIQUE (type)
);

CREATE TABLE IF NOT EXISTS remote_addr (
  id                INTEGER           PRIMARY KEY,
  addr              BLOB              NOT NULL,
  CONSTRAINT        addr_unique       UNIQUE (addr)
);

CREATE TABLE IF NOT EXISTS log (
  id                INTEGER           PRIMARY KEY,
  time              INTEGER           NOT NULL,
  hijacked          INTEGER           NOT NULL,
  remote_addr_id    INTEGER           NOT NULL,
  rr_type_id        INTEGER           NOT NULL,
  rr_question_id    INTEGER           NOT NULL,
  FOREIGN KEY       (remote_addr_id)  REFERENCES remote_addr(id),
  FOREIGN KEY       (rr_type_id)      REFERENCES rr_type(id),
  FOREIGN KEY       (rr_question_id)  REFERENCES rr_question(id)
);

CREATE TABLE IF NOT EXISTS log_rr_answer (
  id                INTEGER           PRIMARY KEY,
  log_id            INTEGER           NOT NULL,
  rr_answer_id      INTEGER           NOT NULL,
  FOREIGN KEY       (log_id)          REFERENCES log(id),
  FOREIGN KEY       (rr_answer_id)    REFERENCES rr_answer(id)
);

CREATE TABLE IF NOT EXISTS cache (
  id                INTEGER           PRIMARY KEY,
  key               INTEGER           NOT NULL,
  data              TEXT              NOT NULL,
  CONSTRAINT        key_unique        UNIQUE (key)
);

CREATE INDEX IF NOT EXISTS log_time_index ON log(time);
CREATE INDEX IF NOT EXISTS log_remote_addr_id_index ON log(remote_addr_id);
CREATE INDEX IF NOT EXISTS log_rr_question_id_index ON log(rr_question_id);
CREATE INDEX IF NOT EXISTS log_rr_type_id_index ON log(rr_type_id);
CREATE INDEX IF NOT EXISTS log_rr_answer_log_id_index ON log_rr_answer(log_id);
CREATE INDEX IF NOT EXISTS log_rr_answer_rr_answer_id_index ON log_rr_answer(rr_answer_id);
";

/// One row of the joined log query. Entries with multiple answers come back
/// as multiple rows sharing the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub id: i64,
    pub time: i64,
    pub remote_addr: IpAddr,
    pub hijacked: bool,
    pub qtype: u16,
    pub question: String,
    pub answer: Option<String>,
}

/// A client for the SQLite database backing the request log and the
/// persistent cache. The single connection is behind a lock, so operations
/// are serialized: one writer at a time, readers excluded for the duration
/// of each call.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if necessary) the database at `path` and installs the
    /// schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let conn = Connection::open(path).context("open database")?;
        // foreign_keys defaults to off
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("enable wal")?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Writes one log entry in a single transaction.
    pub async fn write_log(
        &self,
        time: i64,
        remote_addr: IpAddr,
        hijacked: bool,
        qtype: u16,
        question: &str,
        answers: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let type_id = get_or_insert(&tx, "rr_type", "type", qtype)?;
        let question_id = get_or_insert(&tx, "rr_question", "name", question)?;
        let addr_id = get_or_insert(&tx, "remote_addr", "addr", addr_bytes(remote_addr))?;
        let mut answer_ids = Vec::with_capacity(answers.len());
        for answer in answers {
            answer_ids.push(get_or_insert(&tx, "rr_answer", "name", answer.as_str())?);
        }
        tx.execute(
            "INSERT INTO log (time, hijacked, remote_addr_id, rr_type_id, rr_question_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![time, hijacked, addr_id, type_id, question_id],
        )?;
        let log_id = tx.last_insert_rowid();
        for answer_id in answer_ids {
            tx.execute(
                "INSERT INTO log_rr_answer (log_id, rr_answer_id) VALUES (?1, ?2)",
                params![log_id, answer_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads the rows of the n most recent log entries, newest first.
    /// Answers of one entry are ordered by descending answer id so their
    /// relative order is stable.
    pub async fn read_log(&self, n: usize) -> Result<Vec<LogRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT log.id, log.time, log.hijacked, remote_addr.addr, rr_type.type,
                    rr_question.name, rr_answer.name
             FROM log
             INNER JOIN remote_addr ON remote_addr.id = log.remote_addr_id
             INNER JOIN rr_type ON rr_type.id = log.rr_type_id
             INNER JOIN rr_question ON rr_question.id = log.rr_question_id
             LEFT JOIN log_rr_answer ON log_rr_answer.log_id = log.id
             LEFT JOIN rr_answer ON rr_answer.id = log_rr_answer.rr_answer_id
             WHERE log.id IN (SELECT id FROM log ORDER BY time DESC, id DESC LIMIT ?1)
             ORDER BY log.time DESC, log.id DESC, rr_answer.id DESC",
        )?;
        let rows = stmt.query_map([n as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, u16>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, time, hijacked, addr, qtype, question, answer) = row?;
            entries.push(LogRow {
                id,
                time,
                remote_addr: addr_from_bytes(&addr)?,
                hijacked,
                qtype,
                question,
                answer,
            });
        }
        Ok(entries)
    }

    /// Deletes every log entry with time < t and garbage collects dimension
    /// rows that are no longer referenced. One transaction; ids are deleted
    /// in batches to stay under the parameter limit.
    pub async fn delete_log_before(&self, t: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        loop {
            let ids: Vec<i64> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM log WHERE time < ?1 LIMIT ?2")?;
                let rows = stmt.query_map(params![t, MAX_BATCH as i64], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            if ids.is_empty() {
                break;
            }
            let placeholders = vec!["?"; ids.len()].join(",");
            tx.execute(
                &format!("DELETE FROM log_rr_answer WHERE log_id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?;
            tx.execute(
                &format!("DELETE FROM log WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?;
        }
        tx.execute(
            "DELETE FROM rr_type WHERE id NOT IN (SELECT rr_type_id FROM log)",
            [],
        )?;
        tx.execute(
            "DELETE FROM rr_question WHERE id NOT IN (SELECT rr_question_id FROM log)",
            [],
        )?;
        tx.execute(
            "DELETE FROM remote_addr WHERE id NOT IN (SELECT remote_addr_id FROM log)",
            [],
        )?;
        tx.execute(
            "DELETE FROM rr_answer WHERE id NOT IN (SELECT rr_answer_id FROM log_rr_answer)",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All persisted cache values in insertion order.
    pub async fn read_cache(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM cache ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    /// Stores a packed cache value. Rewriting a key refreshes its insertion
    /// position.
    pub async fn write_cache(&self, key: u32, data: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
        tx.execute(
            "INSERT INTO cache (key, data) VALUES (?1, ?2)",
            params![key, data],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn remove_cache(&self, key: u32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub async fn truncate_cache(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM cache", [])?;
        Ok(())
    }
}

// select-then-insert upsert returning the stable row id
fn get_or_insert<T: ToSql>(
    tx: &Transaction<'_>,
    table: &str,
    column: &str,
    value: T,
) -> rusqlite::Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            &format!("SELECT id FROM {table} WHERE {column} = ?1"),
            [&value],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    tx.execute(
        &format!("INSERT INTO {table} ({column}) VALUES (?1)"),
        [&value],
    )?;
    Ok(tx.last_insert_rowid())
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn addr_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().expect("length checked");
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().expect("length checked");
            Ok(IpAddr::from(octets))
        }
        n => bail!("invalid address length: {}", n),
    }
}
