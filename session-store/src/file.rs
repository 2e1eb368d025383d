//! Filesystem-backed `SessionDataStore` (spec.md §4.2/§6).
//!
//! Each session is one file named `<expiry>_<vhost>_<ctxPath>_<id>` under a
//! per-context directory. Writes go through a temp file plus rename so a
//! reader never observes a partial write (spec.md §8's "store followed by
//! load within a single store instance is atomic" law). `get_expired` lists
//! the directory and parses only the numeric expiry prefix out of each
//! filename, never deserializing the file body, matching spec.md §4.2's
//! explicit performance note.
//!
//! No pack example implements a session file store directly; the
//! write-temp-then-rename idiom is standard systems-Rust practice, used
//! here with `tokio::fs`, matching the `tokio::fs::create_dir` usage
//! already present in the teacher's own `main.rs`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use session_core::{Error, Result, SessionContext, SessionData};
use tokio::fs;

use crate::SessionDataStore;

#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    dir: tokio::sync::OnceCell<PathBuf>,
}

impl FileStore {
    /// `base_dir` is the parent directory under which this store creates
    /// its own per-context subdirectory on `initialize`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dir: tokio::sync::OnceCell::new(),
        }
    }

    fn dir(&self) -> Result<&Path> {
        self.dir
            .get()
            .map(PathBuf::as_path)
            .ok_or(Error::Lifecycle)
    }

    fn file_name(expiry: i64, vhost: &str, ctx: &str, id: &str) -> String {
        format!("{expiry}_{vhost}_{ctx}_{id}")
    }

    /// Parse `(expiry, id)` back out of a filename produced by
    /// `file_name`, given the vhost/ctx this store is bound to (constant
    /// for every file in its directory).
    fn parse_file_name(name: &str, vhost: &str, ctx: &str) -> Option<(i64, String)> {
        let underscore = name.find('_')?;
        let expiry: i64 = name[..underscore].parse().ok()?;
        let rest = &name[underscore + 1..];
        let prefix = format!("{vhost}_{ctx}_");
        let id = rest.strip_prefix(&prefix)?.to_string();
        Some((expiry, id))
    }

    async fn find_file(&self, id: &str, context: (&str, &str)) -> Result<Option<(PathBuf, i64)>> {
        let dir = self.dir()?;
        let mut entries = fs::read_dir(dir).await.map_err(Error::transient)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::transient)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((expiry, found_id)) = Self::parse_file_name(name, context.0, context.1) {
                if found_id == id {
                    return Ok(Some((entry.path(), expiry)));
                }
            }
        }
        Ok(None)
    }

    async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes).await.map_err(Error::transient)?;
        fs::rename(&tmp_path, path).await.map_err(Error::transient)?;
        Ok(())
    }
}

#[async_trait]
impl SessionDataStore for FileStore {
    async fn initialize(&self, context: &SessionContext) -> Result<()> {
        let dir = self
            .base_dir
            .join(format!("{}_{}", context.vhost, context.canonical_context_path));
        fs::create_dir_all(&dir).await.map_err(Error::transient)?;
        self.dir.set(dir).map_err(|_| Error::Lifecycle)?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionData>> {
        // The filename-parsing path needs vhost/ctx; we recover them from
        // the first matching file's own components rather than threading
        // the SessionContext through every call.
        let dir = self.dir()?;
        let mut entries = fs::read_dir(dir).await.map_err(Error::transient)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::transient)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // id is always the final underscore-delimited segment's suffix;
            // since vhost/ctx are constant within a directory we can match
            // by suffix alone here without re-deriving them.
            if name.ends_with(&format!("_{id}")) {
                let bytes = fs::read(entry.path()).await.map_err(Error::transient)?;
                let data = session_core::deserialize_session_data(&bytes)?;
                if data.id == id {
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    async fn store(&self, id: &str, data: &mut SessionData, _last_save_time: i64, now: i64) -> Result<()> {
        let dir = self.dir()?.to_path_buf();

        // Remove any existing file for this id: its expiry (and therefore
        // filename) may have changed since the last write.
        let mut entries = fs::read_dir(&dir).await.map_err(Error::transient)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::transient)? {
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.ends_with(&format!("_{id}"))) {
                let _ = fs::remove_file(entry.path()).await;
            }
        }

        data.mark_saved(now);
        let file_name = Self::file_name(data.expiry, &data.vhost, &data.context_path, id);
        let bytes = session_core::serialize_session_data(data);
        Self::write_atomically(&dir.join(file_name), &bytes).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let dir = self.dir()?.to_path_buf();
        let mut entries = fs::read_dir(&dir).await.map_err(Error::transient)?;
        let mut removed = false;
        while let Some(entry) = entries.next_entry().await.map_err(Error::transient)? {
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.ends_with(&format!("_{id}"))) {
                fs::remove_file(entry.path()).await.map_err(Error::transient)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, id: &str, now: i64) -> Result<bool> {
        let dir = self.dir()?.to_path_buf();
        let mut entries = fs::read_dir(&dir).await.map_err(Error::transient)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::transient)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(underscore) = name.find('_') {
                if name.ends_with(&format!("_{id}")) {
                    let expiry: i64 = name[..underscore].parse().unwrap_or(0);
                    return Ok(expiry == 0 || expiry > now);
                }
            }
        }
        Ok(false)
    }

    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        let dir = self.dir()?.to_path_buf();
        let mut entries = fs::read_dir(&dir).await.map_err(Error::transient)?;
        let mut found_ids = HashSet::new();
        let mut expired = HashSet::new();

        while let Some(entry) = entries.next_entry().await.map_err(Error::transient)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(underscore) = name.find('_') else { continue };
            let Ok(expiry) = name[..underscore].parse::<i64>() else { continue };
            // The id is whatever follows the last underscore-delimited
            // vhost/ctx segment; since we don't have the SessionContext
            // here, split conservatively: everything after the third
            // underscore from the start is the id (expiry_vhost_ctx_id).
            let mut parts = name.splitn(4, '_');
            let (_, _, _, id) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next().unwrap_or_default(),
            );
            if id.is_empty() {
                continue;
            }
            found_ids.insert(id.to_string());
            if expiry > 0 && expiry <= now {
                expired.insert(id.to_string());
            }
        }

        for candidate in candidates {
            if !found_ids.contains(candidate) {
                expired.insert(candidate.clone());
            }
        }

        Ok(expired)
    }

    fn is_passivating(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn store_in(tmp: &tempfile::TempDir) -> FileStore {
        let store = FileStore::new(tmp.path());
        let ctx = SessionContext::new("", "/app", "host-a");
        store.initialize(&ctx).await.unwrap();
        store
    }

    fn sample(id: &str) -> SessionData {
        SessionData::new(id, "_app", "host-a", 0, 60_000)
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp).await;

        let mut data = sample("s1");
        store.store("s1", &mut data, 0, 10).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.last_saved, 10);
    }

    #[tokio::test]
    async fn rewrite_replaces_old_file_with_new_expiry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp).await;

        let mut data = sample("s1");
        data.expiry = 1_000;
        store.store("s1", &mut data, 0, 0).await.unwrap();

        data.expiry = 2_000;
        store.store("s1", &mut data, 1, 0).await.unwrap();

        let mut read_dir = tokio::fs::read_dir(tmp.path().join("host-a__app")).await.unwrap();
        let mut count = 0;
        while read_dir.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn delete_then_exists_is_false() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp).await;

        let mut data = sample("s1");
        store.store("s1", &mut data, 0, 0).await.unwrap();

        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(!store.exists("s1", 0).await.unwrap());
    }

    #[tokio::test]
    async fn get_expired_avoids_deserializing_bodies_and_finds_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp).await;

        let mut expired = sample("expired");
        expired.expiry = 100;
        store.store("expired", &mut expired, 0, 0).await.unwrap();

        let mut candidates = HashSet::new();
        candidates.insert("ghost".to_string());

        let result = store.get_expired(&candidates, 500).await.unwrap();
        assert!(result.contains("expired"));
        assert!(result.contains("ghost"));
    }
}
