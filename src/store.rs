//! Append-only bet log.
//!
//! Records live in one delimited text file. A single exclusive lock covers
//! both appends and scans, so a batch is written contiguously and a reader
//! never observes a partially written record.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::bet::Bet;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bet log i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("bet log row encoding failed: {0}")]
    Encode(#[from] csv::Error),
}

/// Durable store for accepted bets.
pub struct BetStore {
    path: PathBuf,
    // Exclusive across append and scan; fairness of the queue is the
    // runtime's, contention is expected to be low.
    lock: Mutex<()>,
}

impl BetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Appends a batch of bets as one contiguous run of rows.
    ///
    /// The whole batch is encoded before the lock is taken and written with
    /// a single call, then flushed, so either every record of the batch
    /// becomes durable in order or the error is reported to the caller.
    pub async fn append(&self, bets: &[Bet]) -> Result<(), StoreError> {
        let mut rows = Vec::new();
        {
            let mut encoder = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut rows);
            for bet in bets {
                encoder.serialize(bet)?;
            }
            encoder.flush()?;
        }

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(&rows).await?;
        file.flush().await?;
        Ok(())
    }

    /// Scans the log and returns the documents of the given agency's
    /// winning bets, in append order.
    ///
    /// A log that does not exist yet reads as empty. Rows that fail to
    /// parse are logged and skipped rather than failing the scan.
    pub async fn winners_for(&self, agency: u32) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut documents = Vec::new();
        let mut row = 0usize;
        while let Some(line) = lines.next_line().await? {
            row += 1;
            if line.is_empty() {
                continue;
            }
            let bet = match parse_row(&line) {
                Ok(bet) => bet,
                Err(err) => {
                    warn!(row, error = %err, "skipping malformed bet log row");
                    continue;
                }
            };
            if bet.agency == agency && bet.is_winner() {
                documents.push(bet.document);
            }
        }
        Ok(documents)
    }
}

fn parse_row(line: &str) -> Result<Bet, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    reader.deserialize::<Bet>().next().unwrap_or_else(|| {
        Err(csv::Error::from(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "row holds no record",
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn bet(agency: u32, document: &str, number: u32) -> Bet {
        Bet {
            agency,
            first_name: "Maria".into(),
            last_name: "Gomez".into(),
            document: document.into(),
            birthdate: NaiveDate::from_ymd_opt(1990, 5, 14).unwrap(),
            number,
        }
    }

    #[tokio::test]
    async fn winners_are_filtered_by_agency_and_number() {
        let dir = tempdir().unwrap();
        let store = BetStore::new(dir.path().join("bets.csv"));

        store
            .append(&[
                bet(1, "10000001", 7574),
                bet(1, "10000002", 1234),
                bet(2, "20000001", 7574),
            ])
            .await
            .unwrap();

        assert_eq!(store.winners_for(1).await.unwrap(), vec!["10000001"]);
        assert_eq!(store.winners_for(2).await.unwrap(), vec!["20000001"]);
        assert!(store.winners_for(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = BetStore::new(dir.path().join("never-written.csv"));
        assert!(store.winners_for(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_append_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bets.csv");
        let store = BetStore::new(&path);

        store
            .append(&[bet(1, "A1", 1), bet(1, "A2", 2)])
            .await
            .unwrap();
        store.append(&[bet(1, "B1", 3)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let documents: Vec<&str> = contents
            .lines()
            .map(|line| line.split(',').nth(3).unwrap())
            .collect();
        assert_eq!(documents, vec!["A1", "A2", "B1"]);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bets.csv");
        let store = BetStore::new(&path);

        store.append(&[bet(1, "10000001", 7574)]).await.unwrap();
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "this,is,not,a,bet").unwrap();
        }
        store.append(&[bet(1, "10000002", 7574)]).await.unwrap();

        assert_eq!(
            store.winners_for(1).await.unwrap(),
            vec!["10000001", "10000002"]
        );
    }

    #[tokio::test]
    async fn delimiter_characters_in_names_survive_the_log() {
        let dir = tempdir().unwrap();
        let store = BetStore::new(dir.path().join("bets.csv"));

        let mut tricky = bet(1, "10000001", 7574);
        tricky.first_name = "Maria, \"La Quiniela\"".into();
        store.append(&[tricky]).await.unwrap();

        assert_eq!(store.winners_for(1).await.unwrap(), vec!["10000001"]);
    }
}
