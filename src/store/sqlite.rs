use super::Store;
use crate::error::StoreError;
use crate::line::{BadEntry, HealthCounters, Node, NodeId, Province, SampleRecord};

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS provinces (
        id INTEGER PRIMARY KEY,
        name TEXT
    );
    CREATE TABLE IF NOT EXISTS cities (
        id INTEGER PRIMARY KEY,
        name TEXT,
        line_type TEXT,
        max INTEGER,
        area_id INTEGER,
        good_count INTEGER NOT NULL DEFAULT 0,
        bad_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS node_test_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_name TEXT NOT NULL,
        success_rate REAL,
        avg_response_time INTEGER,
        test_time TEXT,
        outbound_ip TEXT,
        download_rate REAL,
        node_id INTEGER
    );
    CREATE TABLE IF NOT EXISTS download_url (
        id INTEGER PRIMARY KEY,
        url TEXT
    );
    CREATE TABLE IF NOT EXISTS good_line (
        node_id INTEGER PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS bad_line (
        outbound_ip TEXT PRIMARY KEY,
        node_id INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS bad_line_node ON bad_line (node_id);
    CREATE TABLE IF NOT EXISTS bad_ips (
        outbound_ip TEXT,
        node_id INTEGER,
        PRIMARY KEY (outbound_ip, node_id)
    );
";

/// SQLite-backed store. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("Opened store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        Ok(tokio::task::spawn_blocking(move || f(&*conn.lock())).await??)
    }

    async fn bump(&self, node: NodeId, column: &'static str) -> Result<u32, StoreError> {
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO cities (id, {col}) VALUES (?1, 1)
                     ON CONFLICT(id) DO UPDATE SET {col} = {col} + 1",
                    col = column
                ),
                params![node],
            )?;
            conn.query_row(
                &format!("SELECT {} FROM cities WHERE id = ?1", column),
                params![node],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn reset(&self, node: NodeId, column: &'static str) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.execute(
                &format!("UPDATE cities SET {} = 0 WHERE id = ?1", column),
                params![node],
            )
            .map(|_| ())
        })
        .await
    }
}

fn bad_rows(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<BadEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(BadEntry {
            outbound_ip: row.get(0)?,
            node_id: row.get(1)?,
        })
    })?;
    rows.collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_provinces(&self, provinces: &[Province]) -> Result<(), StoreError> {
        let provinces = provinces.to_vec();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for p in &provinces {
                tx.execute(
                    "INSERT INTO provinces (id, name) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                    params![p.id, p.name],
                )?;
            }
            tx.commit()
        })
        .await
    }

    async fn save_nodes(&self, nodes: &[Node]) -> Result<(), StoreError> {
        let nodes = nodes.to_vec();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for n in &nodes {
                tx.execute(
                    "INSERT INTO cities (id, name, line_type, max, area_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                        line_type = excluded.line_type, max = excluded.max,
                        area_id = excluded.area_id",
                    params![n.id, n.name, n.line_type, n.max, n.area_id],
                )?;
            }
            tx.commit()
        })
        .await
    }

    async fn has_catalog(&self) -> Result<bool, StoreError> {
        self.run(|conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM cities WHERE name IS NOT NULL)",
                [],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn node_ids(&self) -> Result<Vec<NodeId>, StoreError> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM cities WHERE name IS NOT NULL ORDER BY id")?;
            let ids = stmt.query_map([], |row| row.get(0))?;
            ids.collect()
        })
        .await
    }

    async fn record_sample(&self, sample: &SampleRecord) -> Result<(), StoreError> {
        let s = sample.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO node_test_results
                    (node_name, success_rate, avg_response_time, test_time, outbound_ip,
                     download_rate, node_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    s.node_name,
                    s.success_rate,
                    s.avg_latency_ms,
                    s.tested_at,
                    s.outbound_ip,
                    s.download_mbps,
                    s.node_id
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn download_url(&self) -> Result<Option<String>, StoreError> {
        self.run(|conn| {
            conn.query_row("SELECT url FROM download_url WHERE id = 1", [], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .map(Option::flatten)
        })
        .await
    }

    async fn set_download_url(&self, url: &str) -> Result<(), StoreError> {
        let url = url.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO download_url (id, url) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET url = excluded.url",
                params![url],
            )
            .map(|_| ())
        })
        .await
    }

    async fn counters(&self, node: NodeId) -> Result<HealthCounters, StoreError> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT good_count, bad_count FROM cities WHERE id = ?1",
                params![node],
                |row| {
                    Ok(HealthCounters {
                        good_count: row.get(0)?,
                        bad_count: row.get(1)?,
                    })
                },
            )
            .optional()
            .map(Option::unwrap_or_default)
        })
        .await
    }

    async fn bump_good(&self, node: NodeId) -> Result<u32, StoreError> {
        self.bump(node, "good_count").await
    }

    async fn reset_good(&self, node: NodeId) -> Result<(), StoreError> {
        self.reset(node, "good_count").await
    }

    async fn bump_bad(&self, node: NodeId) -> Result<u32, StoreError> {
        self.bump(node, "bad_count").await
    }

    async fn reset_bad(&self, node: NodeId) -> Result<(), StoreError> {
        self.reset(node, "bad_count").await
    }

    async fn is_good(&self, node: NodeId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM good_line WHERE node_id = ?1)",
                params![node],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn insert_good(&self, node: NodeId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO good_line (node_id) VALUES (?1)",
                params![node],
            )
            .map(|n| n > 0)
        })
        .await
    }

    async fn remove_good(&self, node: NodeId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            conn.execute("DELETE FROM good_line WHERE node_id = ?1", params![node])
                .map(|n| n > 0)
        })
        .await
    }

    async fn random_good(&self) -> Result<Option<NodeId>, StoreError> {
        self.run(|conn| {
            conn.query_row(
                "SELECT node_id FROM good_line ORDER BY RANDOM() LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn good_nodes(&self) -> Result<Vec<NodeId>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT node_id FROM good_line ORDER BY node_id")?;
            let ids = stmt.query_map([], |row| row.get(0))?;
            ids.collect()
        })
        .await
    }

    async fn is_bad_ip(&self, ip: &str) -> Result<bool, StoreError> {
        let ip = ip.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM bad_line WHERE outbound_ip = ?1)",
                params![ip],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn is_bad_node(&self, node: NodeId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM bad_line WHERE node_id = ?1)",
                params![node],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn insert_bad(&self, ip: &str, node: NodeId) -> Result<bool, StoreError> {
        let ip = ip.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bad_line (outbound_ip, node_id) VALUES (?1, ?2)",
                params![ip, node],
            )
            .map(|n| n > 0)
        })
        .await
    }

    async fn remove_bad_ip(&self, ip: &str) -> Result<bool, StoreError> {
        let ip = ip.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM bad_line WHERE outbound_ip = ?1", params![ip])
                .map(|n| n > 0)
        })
        .await
    }

    async fn remove_bad_node(&self, node: NodeId) -> Result<usize, StoreError> {
        self.run(move |conn| conn.execute("DELETE FROM bad_line WHERE node_id = ?1", params![node]))
            .await
    }

    async fn random_bad(&self) -> Result<Option<NodeId>, StoreError> {
        self.run(|conn| {
            conn.query_row(
                "SELECT node_id FROM bad_line ORDER BY RANDOM() LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn bad_entries(&self) -> Result<Vec<BadEntry>, StoreError> {
        self.run(|conn| {
            bad_rows(
                conn,
                "SELECT outbound_ip, node_id FROM bad_line ORDER BY outbound_ip",
            )
        })
        .await
    }

    async fn record_bad_ip(&self, ip: &str, node: NodeId) -> Result<(), StoreError> {
        let ip = ip.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bad_ips (outbound_ip, node_id) VALUES (?1, ?2)",
                params![ip, node],
            )
            .map(|_| ())
        })
        .await
    }

    async fn bad_ip_history(&self) -> Result<Vec<BadEntry>, StoreError> {
        self.run(|conn| {
            bad_rows(
                conn,
                "SELECT outbound_ip, node_id FROM bad_ips ORDER BY outbound_ip, node_id",
            )
        })
        .await
    }
}
