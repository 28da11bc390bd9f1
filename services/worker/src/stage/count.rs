// Rows counted per key, kept in one persisted file per client. The file
// header records the last applied seq of every upstream replica, so a batch
// replayed after a crash is recognized and not counted twice.
use super::{Stage, decode_batch, passthrough};
use crate::mailer::Mailer;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use conveyor_common::{ClientId, DelId};
use conveyor_middleware::Delivery;
use conveyor_storage::{PersistedHeader, Persistor, StorageError};
use conveyor_wire::batch::{Batch, Columns, Row};
use std::collections::BTreeMap;
use std::path::Path;

const COMPONENT: &str = "count";
const COUNTS_FILE: &str = "counts";
const COUNT_FIELD: &str = "count";

type Counts = BTreeMap<Vec<String>, u64>;

pub struct CountStage {
    keys: Vec<String>,
    persistor: Persistor,
}

impl CountStage {
    pub fn new(state_dir: &Path, replicas: usize, keys: Vec<String>) -> Self {
        Self {
            keys,
            persistor: Persistor::new(state_dir, COMPONENT, replicas),
        }
    }

    /// Adds the rows of `batch` to the counts of `id.client_id`. Returns false
    /// when `id` was already applied.
    pub fn apply(&self, id: DelId, batch: &Batch) -> Result<bool> {
        let (header, mut counts) = self.load(id.client_id)?;
        if header.is_dup(id) {
            tracing::debug!(%id, "batch already counted");
            return Ok(false);
        }
        for row in &batch.rows {
            match self.key_of(row) {
                Some(key) => *counts.entry(key).or_insert(0) += 1,
                None => tracing::warn!(%id, keys = ?self.keys, "row without count keys skipped"),
            }
        }
        self.persistor
            .store(id, COUNTS_FILE, &self.encode(&counts), Some(header))
            .with_context(|| format!("store counts of client {}", id.client_id))?;
        Ok(true)
    }

    /// One row per key with its total under `count`.
    pub fn totals(&self, client_id: ClientId) -> Result<Batch> {
        let (_, counts) = self.load(client_id)?;
        Ok(self.to_batch(&counts))
    }

    fn key_of(&self, row: &Row) -> Option<Vec<String>> {
        self.keys.iter().map(|key| row.get(key).cloned()).collect()
    }

    fn load(&self, client_id: ClientId) -> Result<(PersistedHeader, Counts)> {
        match self.persistor.load(client_id, COUNTS_FILE) {
            Ok(file) => Ok((file.header, self.decode(&file.state)?)),
            Err(StorageError::NotFound(_)) => Ok((
                PersistedHeader::empty(self.persistor.replicas()),
                Counts::new(),
            )),
            Err(err) => Err(err).with_context(|| format!("load counts of client {client_id}")),
        }
    }

    fn to_batch(&self, counts: &Counts) -> Batch {
        let rows = counts
            .iter()
            .map(|(key, count)| {
                let mut row: Row = self.keys.iter().cloned().zip(key.iter().cloned()).collect();
                row.insert(COUNT_FIELD.to_string(), count.to_string());
                row
            })
            .collect();
        Batch::new(rows)
    }

    fn encode(&self, counts: &Counts) -> Vec<u8> {
        self.to_batch(counts).encode(&Columns::new()).to_vec()
    }

    fn decode(&self, state: &[u8]) -> Result<Counts> {
        let batch = Batch::decode(state).context("decode persisted counts")?;
        batch
            .rows
            .iter()
            .map(|row| {
                let key = self
                    .key_of(row)
                    .ok_or_else(|| anyhow!("persisted row without keys"))?;
                let count = row
                    .get(COUNT_FIELD)
                    .and_then(|count| count.parse::<u64>().ok())
                    .ok_or_else(|| anyhow!("persisted row without a count"))?;
                Ok((key, count))
            })
            .collect()
    }
}

#[async_trait]
impl Stage for CountStage {
    fn name(&self) -> &'static str {
        "count"
    }

    async fn batch(&mut self, _mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        let Some(batch) = decode_batch(delivery) else {
            return Ok(());
        };
        self.apply(delivery.id(), &batch)?;
        Ok(())
    }

    async fn eof(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        let headers = &delivery.headers;
        let extra = passthrough(headers);
        let totals = self.totals(headers.client_id)?;
        if !totals.is_empty() {
            mailer
                .publish_batch(&totals, headers.client_id, &extra)
                .await?;
        }
        mailer.publish_eof(headers.client_id, &extra).await
    }

    async fn flush(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        let headers = &delivery.headers;
        mailer
            .publish_flush(headers.client_id, &passthrough(headers))
            .await?;
        self.persistor
            .flush(headers.client_id)
            .with_context(|| format!("remove counts of client {}", headers.client_id))
    }

    async fn purge(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        mailer.publish_purge(&passthrough(&delivery.headers)).await?;
        self.persistor.purge().context("remove all counts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[&str]) -> Batch {
        Batch::new(
            ids.iter()
                .map(|id| Row::from([("movieId".to_string(), id.to_string())]))
                .collect(),
        )
    }

    fn count_of(batch: &Batch, id: &str) -> Option<String> {
        batch
            .rows
            .iter()
            .find(|row| row.get("movieId").map(String::as_str) == Some(id))
            .and_then(|row| row.get(COUNT_FIELD).cloned())
    }

    #[test]
    fn counts_accumulate_across_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = CountStage::new(dir.path(), 2, vec!["movieId".to_string()]);
        assert!(stage.apply(DelId::new(0, 0, 4), &rows(&["1", "2", "1"])).expect("apply"));
        assert!(stage.apply(DelId::new(1, 0, 4), &rows(&["2"])).expect("apply"));

        let totals = stage.totals(4).expect("totals");
        assert_eq!(totals.len(), 2);
        assert_eq!(count_of(&totals, "1").as_deref(), Some("2"));
        assert_eq!(count_of(&totals, "2").as_deref(), Some("2"));
    }

    #[test]
    fn replayed_batches_are_not_counted_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = CountStage::new(dir.path(), 1, vec!["movieId".to_string()]);
        assert!(stage.apply(DelId::new(0, 0, 4), &rows(&["1"])).expect("apply"));
        assert!(stage.apply(DelId::new(0, 1, 4), &rows(&["1"])).expect("apply"));
        assert!(!stage.apply(DelId::new(0, 1, 4), &rows(&["1"])).expect("replay"));
        assert!(!stage.apply(DelId::new(0, 0, 4), &rows(&["1"])).expect("replay"));

        // A fresh stage over the same directory sees the same totals.
        let restarted = CountStage::new(dir.path(), 1, vec!["movieId".to_string()]);
        assert_eq!(
            count_of(&restarted.totals(4).expect("totals"), "1").as_deref(),
            Some("2")
        );
    }

    #[test]
    fn rows_without_keys_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = CountStage::new(dir.path(), 1, vec!["movieId".to_string(), "year".to_string()]);
        let batch = Batch::new(vec![
            Row::from([
                ("movieId".to_string(), "7".to_string()),
                ("year".to_string(), "1999".to_string()),
            ]),
            Row::from([("movieId".to_string(), "7".to_string())]),
        ]);
        stage.apply(DelId::new(0, 0, 1), &batch).expect("apply");
        let totals = stage.totals(1).expect("totals");
        assert_eq!(totals.len(), 1);
        assert_eq!(totals.rows[0].get("year").map(String::as_str), Some("1999"));
        assert_eq!(totals.rows[0].get(COUNT_FIELD).map(String::as_str), Some("1"));
    }

    #[test]
    fn unknown_clients_have_no_totals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = CountStage::new(dir.path(), 1, vec!["movieId".to_string()]);
        assert!(stage.totals(99).expect("totals").is_empty());
    }
}
