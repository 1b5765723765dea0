//! SQLite persistence layer.
//!
//! Stores the rendezvous tables (daily meeting points and hourly live
//! tokens) and the federation membership table. Uses WAL mode for
//! concurrent reads during writes. Dead drops are opaque ciphertext —
//! nothing here is ever plaintext content.

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use std::collections::HashMap;
use std::path::Path;

/// A persisted rendezvous entry (daily point or hourly token).
#[derive(Debug, Clone)]
pub struct PointRow {
    pub hash: Vec<u8>,
    pub peer_id: String,
    /// Opaque dead-drop ciphertext; empty for hourly tokens.
    pub dead_drop: Vec<u8>,
    pub relay_id: String,
    pub expires_at: i64,
    pub created_at: i64,
    pub vector_clock: i64,
}

/// A persisted federation member.
#[derive(Debug, Clone)]
pub struct MemberRow {
    pub server_id: String,
    pub node_id: String,
    pub endpoint: String,
    pub public_key: String,
    pub status: String,
    pub incarnation: i64,
    pub last_seen: i64,
    pub metadata: HashMap<String, String>,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (development and tests).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS daily_points (
                point_hash   BLOB NOT NULL,
                peer_id      TEXT NOT NULL,
                dead_drop    BLOB NOT NULL,
                relay_id     TEXT NOT NULL,
                expires_at   INTEGER NOT NULL,
                created_at   INTEGER NOT NULL,
                vector_clock INTEGER NOT NULL,
                PRIMARY KEY (point_hash, peer_id)
            );

            CREATE INDEX IF NOT EXISTS idx_daily_expiry
                ON daily_points(expires_at);

            CREATE TABLE IF NOT EXISTS hourly_tokens (
                token_hash   BLOB NOT NULL,
                peer_id      TEXT NOT NULL,
                relay_id     TEXT NOT NULL,
                expires_at   INTEGER NOT NULL,
                created_at   INTEGER NOT NULL,
                vector_clock INTEGER NOT NULL,
                PRIMARY KEY (token_hash, peer_id)
            );

            CREATE INDEX IF NOT EXISTS idx_hourly_expiry
                ON hourly_tokens(expires_at);

            CREATE TABLE IF NOT EXISTS members (
                server_id    TEXT PRIMARY KEY,
                node_id      TEXT NOT NULL,
                endpoint     TEXT NOT NULL,
                public_key   TEXT NOT NULL,
                status       TEXT NOT NULL,
                incarnation  INTEGER NOT NULL,
                last_seen    INTEGER NOT NULL,
                metadata     TEXT NOT NULL DEFAULT '{}'
            );
            ",
        )
    }

    /// Highest vector clock across both rendezvous tables, to seed the
    /// in-process counter after a restart.
    pub fn max_vector_clock(&self) -> SqlResult<i64> {
        let daily: Option<i64> = self
            .conn
            .query_row("SELECT MAX(vector_clock) FROM daily_points", [], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        let hourly: Option<i64> = self
            .conn
            .query_row("SELECT MAX(vector_clock) FROM hourly_tokens", [], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        Ok(daily.unwrap_or(0).max(hourly.unwrap_or(0)))
    }

    /// Register a peer on a batch of daily points, atomically.
    ///
    /// For every point: read the live entries of *other* peers (the dead
    /// drops to return), then upsert our own. Either all points commit or
    /// none do.
    #[allow(clippy::too_many_arguments)]
    pub fn register_daily_points(
        &mut self,
        peer_id: &str,
        points: &[Vec<u8>],
        dead_drop: &[u8],
        relay_id: &str,
        now: i64,
        ttl_secs: i64,
        clock: i64,
    ) -> SqlResult<Vec<PointRow>> {
        let tx = self.conn.transaction()?;
        let mut found = Vec::new();
        {
            let mut read = tx.prepare(
                "SELECT point_hash, peer_id, dead_drop, relay_id, expires_at, created_at, vector_clock
                 FROM daily_points
                 WHERE point_hash = ?1 AND peer_id != ?2 AND expires_at > ?3
                 ORDER BY vector_clock",
            )?;
            let mut write = tx.prepare(
                "INSERT INTO daily_points
                     (point_hash, peer_id, dead_drop, relay_id, expires_at, created_at, vector_clock)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(point_hash, peer_id) DO UPDATE SET
                     dead_drop = excluded.dead_drop,
                     relay_id = excluded.relay_id,
                     expires_at = excluded.expires_at,
                     vector_clock = excluded.vector_clock",
            )?;
            for point in points {
                let rows = read.query_map(params![point, peer_id, now], row_to_point)?;
                for row in rows {
                    found.push(row?);
                }
                write.execute(params![
                    point,
                    peer_id,
                    dead_drop,
                    relay_id,
                    now + ttl_secs,
                    now,
                    clock
                ])?;
            }
        }
        tx.commit()?;
        Ok(found)
    }

    /// Register a peer on a batch of hourly tokens, atomically. Returns
    /// the live entries of other peers already on each token.
    pub fn register_hourly_tokens(
        &mut self,
        peer_id: &str,
        tokens: &[Vec<u8>],
        relay_id: &str,
        now: i64,
        ttl_secs: i64,
        clock: i64,
    ) -> SqlResult<Vec<PointRow>> {
        let tx = self.conn.transaction()?;
        let mut found = Vec::new();
        {
            let mut read = tx.prepare(
                "SELECT token_hash, peer_id, relay_id, expires_at, created_at, vector_clock
                 FROM hourly_tokens
                 WHERE token_hash = ?1 AND peer_id != ?2 AND expires_at > ?3
                 ORDER BY vector_clock",
            )?;
            let mut write = tx.prepare(
                "INSERT INTO hourly_tokens
                     (token_hash, peer_id, relay_id, expires_at, created_at, vector_clock)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(token_hash, peer_id) DO UPDATE SET
                     relay_id = excluded.relay_id,
                     expires_at = excluded.expires_at,
                     vector_clock = excluded.vector_clock",
            )?;
            for token in tokens {
                let rows = read.query_map(params![token, peer_id, now], row_to_token)?;
                for row in rows {
                    found.push(row?);
                }
                write.execute(params![
                    token,
                    peer_id,
                    relay_id,
                    now + ttl_secs,
                    now,
                    clock
                ])?;
            }
        }
        tx.commit()?;
        Ok(found)
    }

    /// Live entries for one daily point.
    pub fn get_daily_point(&self, point: &[u8], now: i64) -> SqlResult<Vec<PointRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT point_hash, peer_id, dead_drop, relay_id, expires_at, created_at, vector_clock
             FROM daily_points
             WHERE point_hash = ?1 AND expires_at > ?2
             ORDER BY vector_clock",
        )?;
        let rows = stmt.query_map(params![point, now], row_to_point)?;
        rows.collect()
    }

    /// Remove every rendezvous entry owned by a peer.
    pub fn unregister_peer(&self, peer_id: &str) -> SqlResult<usize> {
        let daily = self
            .conn
            .execute("DELETE FROM daily_points WHERE peer_id = ?1", [peer_id])?;
        let hourly = self
            .conn
            .execute("DELETE FROM hourly_tokens WHERE peer_id = ?1", [peer_id])?;
        Ok(daily + hourly)
    }

    /// Evict expired rendezvous entries. Returns the number removed.
    pub fn cleanup_rendezvous(&self, now: i64) -> SqlResult<usize> {
        let daily = self
            .conn
            .execute("DELETE FROM daily_points WHERE expires_at <= ?1", [now])?;
        let hourly = self
            .conn
            .execute("DELETE FROM hourly_tokens WHERE expires_at <= ?1", [now])?;
        Ok(daily + hourly)
    }

    // ── membership ─────────────────────────────────────────────────

    /// Upsert a federation member.
    pub fn save_member(&self, member: &MemberRow) -> SqlResult<()> {
        let metadata = serde_json::to_string(&member.metadata).unwrap_or_else(|_| "{}".into());
        self.conn.execute(
            "INSERT INTO members
                 (server_id, node_id, endpoint, public_key, status, incarnation, last_seen, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(server_id) DO UPDATE SET
                 node_id = excluded.node_id,
                 endpoint = excluded.endpoint,
                 public_key = excluded.public_key,
                 status = excluded.status,
                 incarnation = excluded.incarnation,
                 last_seen = excluded.last_seen,
                 metadata = excluded.metadata",
            params![
                member.server_id,
                member.node_id,
                member.endpoint,
                member.public_key,
                member.status,
                member.incarnation,
                member.last_seen,
                metadata
            ],
        )?;
        Ok(())
    }

    /// Load all persisted members.
    pub fn load_members(&self) -> SqlResult<Vec<MemberRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT server_id, node_id, endpoint, public_key, status, incarnation, last_seen, metadata
             FROM members",
        )?;
        let rows = stmt.query_map([], |row| {
            let metadata: String = row.get(7)?;
            Ok(MemberRow {
                server_id: row.get(0)?,
                node_id: row.get(1)?,
                endpoint: row.get(2)?,
                public_key: row.get(3)?,
                status: row.get(4)?,
                incarnation: row.get(5)?,
                last_seen: row.get(6)?,
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            })
        })?;
        rows.collect()
    }

    /// Remove a member (left the federation past the failure timeout).
    pub fn delete_member(&self, server_id: &str) -> SqlResult<()> {
        self.conn
            .execute("DELETE FROM members WHERE server_id = ?1", [server_id])?;
        Ok(())
    }
}

fn row_to_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<PointRow> {
    Ok(PointRow {
        hash: row.get(0)?,
        peer_id: row.get(1)?,
        dead_drop: row.get(2)?,
        relay_id: row.get(3)?,
        expires_at: row.get(4)?,
        created_at: row.get(5)?,
        vector_clock: row.get(6)?,
    })
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<PointRow> {
    Ok(PointRow {
        hash: row.get(0)?,
        peer_id: row.get(1)?,
        dead_drop: Vec::new(),
        relay_id: row.get(2)?,
        expires_at: row.get(3)?,
        created_at: row.get(4)?,
        vector_clock: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_registration_returns_prior_entries_only() {
        let mut db = Db::open_memory().unwrap();
        let point = vec![0xAA; 32];

        let first = db
            .register_daily_points("alice", &[point.clone()], b"drop-a", "relay-1", 1000, 100, 1)
            .unwrap();
        assert!(first.is_empty());

        let second = db
            .register_daily_points("bob", &[point.clone()], b"drop-b", "relay-2", 1001, 100, 2)
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].peer_id, "alice");
        assert_eq!(second[0].dead_drop, b"drop-a");

        // Alice re-registers (upsert) and sees only Bob.
        let third = db
            .register_daily_points("alice", &[point], b"drop-a2", "relay-1", 1002, 100, 3)
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].peer_id, "bob");
    }

    #[test]
    fn expired_entries_are_invisible_and_evictable() {
        let mut db = Db::open_memory().unwrap();
        let point = vec![0x01; 32];
        db.register_daily_points("alice", &[point.clone()], b"d", "r", 1000, 50, 1)
            .unwrap();

        // Past expiry: invisible to reads and to later registrations.
        assert!(db.get_daily_point(&point, 1050).unwrap().is_empty());
        let found = db
            .register_daily_points("bob", &[point.clone()], b"d2", "r", 1050, 50, 2)
            .unwrap();
        assert!(found.is_empty());

        assert_eq!(db.cleanup_rendezvous(2000).unwrap(), 2);
    }

    #[test]
    fn unregister_peer_removes_everything() {
        let mut db = Db::open_memory().unwrap();
        db.register_daily_points("alice", &[vec![1], vec![2]], b"d", "r", 1000, 100, 1)
            .unwrap();
        db.register_hourly_tokens("alice", &[vec![3]], "r", 1000, 100, 2)
            .unwrap();
        assert_eq!(db.unregister_peer("alice").unwrap(), 3);
        assert!(db.get_daily_point(&[1], 1000).unwrap().is_empty());
    }

    #[test]
    fn member_roundtrip() {
        let db = Db::open_memory().unwrap();
        let mut metadata = HashMap::new();
        metadata.insert("region".to_string(), "eu-1".to_string());
        let row = MemberRow {
            server_id: "srv-a".into(),
            node_id: "node-a".into(),
            endpoint: "10.0.0.1:7100".into(),
            public_key: "srv-a".into(),
            status: "alive".into(),
            incarnation: 4,
            last_seen: 1234,
            metadata,
        };
        db.save_member(&row).unwrap();
        let loaded = db.load_members().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].incarnation, 4);
        assert_eq!(loaded[0].metadata["region"], "eu-1");

        db.delete_member("srv-a").unwrap();
        assert!(db.load_members().unwrap().is_empty());
    }
}
