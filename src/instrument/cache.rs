//! Persistent cache of instrumented sources, keyed by
//! `(normalized path, content hash, tracker name)`.
//!
//! Purely an optimization: every entry can be regenerated from the source,
//! so callers treat any error here as a miss.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use super::{Instrumented, HitSite, SourceMap};
use crate::error::{CoverageError, Result};

pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA: &str = include_str!("../../schema.sql");

/// One cached transform.
#[derive(Debug, Clone)]
pub struct CachedSource {
    pub instrumented: Instrumented,
    pub created_at: String,
}

/// Everything but the text, stored as one JSON column.
#[derive(Serialize, Deserialize)]
struct Metadata {
    sourcemap: SourceMap,
    sites: Vec<HitSite>,
    hit_lines: BTreeSet<u32>,
    function_lines: BTreeSet<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
}

pub struct DiskCache {
    conn: Connection,
}

impl DiskCache {
    /// Open (or create) the cache database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn get(&self, path: &str, content_hash: &str, tracker: &str) -> Result<Option<CachedSource>> {
        let row = self
            .conn
            .query_row(
                "SELECT transformed, metadata, created_at FROM instrumented_source \
                 WHERE path = ?1 AND content_hash = ?2 AND tracker_name = ?3",
                params![path, content_hash, tracker],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((text, meta, created_at)) => {
                let meta: Metadata = serde_json::from_str(&meta)?;
                Ok(Some(CachedSource {
                    instrumented: Instrumented {
                        text,
                        sourcemap: meta.sourcemap,
                        sites: meta.sites,
                        hit_lines: meta.hit_lines,
                        function_lines: meta.function_lines,
                    },
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Store a transform, replacing older versions of the same file.
    pub fn put(&mut self, path: &str, content_hash: &str, tracker: &str, out: &Instrumented) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let meta = serde_json::to_string(&Metadata {
            sourcemap: out.sourcemap.clone(),
            sites: out.sites.clone(),
            hit_lines: out.hit_lines.clone(),
            function_lines: out.function_lines.clone(),
        })?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM instrumented_source WHERE path = ?1 AND content_hash != ?2",
            params![path, content_hash],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO instrumented_source \
             (path, content_hash, tracker_name, transformed, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![path, content_hash, tracker, out.text, meta, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT path), COALESCE(SUM(LENGTH(transformed)), 0) \
             FROM instrumented_source",
            [],
            |row| {
                Ok(CacheStats {
                    entries: row.get::<_, i64>(0)? as u64,
                    files: row.get::<_, i64>(1)? as u64,
                    bytes: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(stats)
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM instrumented_source", [])?)
    }
}

/// Ensure the schema is initialized, migrating older databases forward.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) if v > SCHEMA_VERSION => {
            return Err(CoverageError::Other(format!(
                "Cache schema version {v} is newer than this build supports ({SCHEMA_VERSION}). \
                 Delete the cache file or upgrade covlua."
            )));
        }
        Some(v) => migrate(conn, v)?,
    }
    Ok(())
}

/// Apply migrations from `from_version` up to `SCHEMA_VERSION`. Add an arm
/// `N => { ... }` for each step from N to N+1 and bump `SCHEMA_VERSION`.
fn migrate(conn: &Connection, from_version: u32) -> Result<()> {
    let mut current = from_version;
    while current < SCHEMA_VERSION {
        info!(from = current, to = current + 1, "migrating instrumentation cache schema");
        // 1 -> 2: hit calls gained a block id and metadata gained sites.
        // Entries are rebuilt on demand, so older ones are dropped.
        conn.execute_batch("DELETE FROM instrumented_source;")?;
        current += 1;
        conn.execute("UPDATE schema_version SET version = ?1", params![current])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{instrument, InstrumentOptions};

    fn sample() -> Instrumented {
        instrument("local x = 1\nprint(x)\n", "/p/a.lua", &InstrumentOptions::default()).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let mut cache = DiskCache::open_in_memory().unwrap();
        let out = sample();
        cache.put("/p/a.lua", "h1", "__covlua", &out).unwrap();

        let hit = cache.get("/p/a.lua", "h1", "__covlua").unwrap().unwrap();
        assert_eq!(hit.instrumented.text, out.text);
        assert_eq!(hit.instrumented.sourcemap, out.sourcemap);
        assert_eq!(hit.instrumented.hit_lines, out.hit_lines);
        assert_eq!(hit.instrumented.sites, out.sites);
        assert!(cache.get("/p/a.lua", "h2", "__covlua").unwrap().is_none());
        assert!(cache.get("/p/a.lua", "h1", "other").unwrap().is_none());
    }

    #[test]
    fn test_new_hash_replaces_old() {
        let mut cache = DiskCache::open_in_memory().unwrap();
        let out = sample();
        cache.put("/p/a.lua", "h1", "__covlua", &out).unwrap();
        cache.put("/p/a.lua", "h2", "__covlua", &out).unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.files, 1);
        assert!(cache.get("/p/a.lua", "h1", "__covlua").unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let mut cache = DiskCache::open_in_memory().unwrap();
        cache.put("/p/a.lua", "h1", "__covlua", &sample()).unwrap();
        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(cache.stats().unwrap(), CacheStats::default());
    }

    #[test]
    fn test_old_schema_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let mut cache = DiskCache::open(&path).unwrap();
            cache.put("/p/a.lua", "h1", "__covlua", &sample()).unwrap();
            cache.conn.execute("UPDATE schema_version SET version = 1", []).unwrap();
        }
        let cache = DiskCache::open(&path).unwrap();
        assert_eq!(cache.stats().unwrap().entries, 0);
        let version: u32 = cache
            .conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let mut cache = DiskCache::open(&path).unwrap();
            cache.put("/p/a.lua", "h1", "__covlua", &sample()).unwrap();
        }
        let cache = DiskCache::open(&path).unwrap();
        assert_eq!(cache.stats().unwrap().entries, 1);
    }
}
