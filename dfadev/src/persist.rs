use std::path::Path;

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;

/// SQLite-backed place where an outgoing engine publishes its store and the incoming one picks
/// it up.
#[derive(Clone)]
pub struct SnapshotStore {
    db: Connection,
}

impl SnapshotStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path).await?;
        Self::init(db).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().await?;
        Self::init(db).await
    }

    async fn init(db: Connection) -> Result<Self> {
        db.call(|conn| {
            conn.execute("
                CREATE TABLE IF NOT EXISTS snapshot
                    (
                        device TEXT PRIMARY KEY,
                        generation INTEGER,
                        body BLOB,
                        body_hash TEXT
                    )
            ", [])?;
            Ok(())
        }).await?;
        Ok(SnapshotStore { db })
    }

    /// Publish a snapshot, replacing whatever was stored for the device before.
    pub async fn publish(&self, device: &str, snapshot: &Snapshot) -> Result<()> {
        let body = snapshot.encode();
        let body_hash = Snapshot::checksum(&body);
        let generation = snapshot.generation as i64;
        let device = device.to_string();
        debug!(%device, generation, %body_hash, "publishing snapshot");

        self.db.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO snapshot (device, generation, body, body_hash)
                    VALUES (?, ?, ?, ?)",
                rusqlite::params![&device, generation, body, &body_hash],
            )?;
            tx.commit()?;
            Ok(())
        }).await?;
        Ok(())
    }

    /// Retrieve the published snapshot and delete it, both in one transaction.
    ///
    /// The row is consumed even when the image turns out to be damaged; a damaged image is
    /// reported and never replaced by a fresh store.
    pub async fn take(&self, device: &str) -> Result<Snapshot> {
        let key = device.to_string();
        let row = self.db.call(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(Vec<u8>, String)> = tx.query_row(
                "SELECT body, body_hash FROM snapshot WHERE device = ?",
                [&key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ).optional()?;
            tx.execute("DELETE FROM snapshot WHERE device = ?", [&key])?;
            tx.commit()?;
            Ok(row)
        }).await?;

        let (body, body_hash) = row.ok_or_else(|| Error::MissingSnapshot(device.to_string()))?;
        let actual = Snapshot::checksum(&body);
        if actual != body_hash {
            return Err(Error::CorruptSnapshot(format!(
                "checksum mismatch: stored {body_hash}, computed {actual}"
            )));
        }
        let snapshot = Snapshot::decode(&body)?;
        info!(device, generation = snapshot.generation, "snapshot retrieved");
        Ok(snapshot)
    }

    pub async fn close(self) -> Result<()> {
        self.db.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::tests::odd_length;

    #[tokio::test]
    async fn publish_then_take_once() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let mut aut = odd_length();
        aut.feed(b"x");
        let snap = Snapshot { generation: 3, automaton: aut };

        store.publish("dfa", &snap).await.unwrap();
        assert_eq!(store.take("dfa").await.unwrap(), snap);
        assert!(matches!(store.take("dfa").await, Err(Error::MissingSnapshot(_))));
    }

    #[tokio::test]
    async fn devices_are_independent_and_overwritten() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let first = Snapshot { generation: 1, automaton: odd_length() };
        let mut aut = odd_length();
        aut.feed(b"!");
        let second = Snapshot { generation: 2, automaton: aut };

        store.publish("dfa", &first).await.unwrap();
        store.publish("dfa", &second).await.unwrap();
        store.publish("other", &first).await.unwrap();

        assert_eq!(store.take("dfa").await.unwrap(), second);
        assert_eq!(store.take("other").await.unwrap(), first);
    }

    #[tokio::test]
    async fn damaged_row_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite3");
        let store = SnapshotStore::open(&path).await.unwrap();
        store.publish("dfa", &Snapshot { generation: 0, automaton: odd_length() }).await.unwrap();
        store.db.call(|conn| {
            conn.execute("UPDATE snapshot SET body_hash = '0000000000000000'", [])?;
            Ok(())
        }).await.unwrap();

        assert!(matches!(store.take("dfa").await, Err(Error::CorruptSnapshot(_))));
        assert!(matches!(store.take("dfa").await, Err(Error::MissingSnapshot(_))));
    }

    #[tokio::test]
    async fn survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite3");
        let snap = Snapshot { generation: 9, automaton: odd_length() };

        let store = SnapshotStore::open(&path).await.unwrap();
        store.publish("dfa", &snap).await.unwrap();
        store.close().await.unwrap();

        let store = SnapshotStore::open(&path).await.unwrap();
        assert_eq!(store.take("dfa").await.unwrap(), snap);
    }
}
