//! Agency-side client: streams a bet file to the server in batches, signals
//! completion, and prints the winning documents that come back.

use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use chrono::NaiveDate;
use tokio::fs::File;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::bet::{Bet, BIRTHDATE_FORMAT};
use crate::cli::ClientArgs;
use crate::protocol::{self, AckStatus, Frame};

// Agency bet files carry five fields per row; the agency id comes from the
// command line.
const ROW_FIELDS: usize = 5;

/// Streams a bet file in submission-sized batches.
///
/// Rows that do not parse are logged with their line number and skipped, so
/// one bad row never blocks the rest of an agency's file.
pub struct BatchReader {
    lines: Lines<BufReader<File>>,
    agency: u32,
    batch_size: usize,
    line_number: usize,
}

impl BatchReader {
    pub async fn open(path: &Path, agency: u32, batch_size: usize) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open bet file {}", path.display()))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            agency,
            batch_size,
            line_number: 0,
        })
    }

    /// Next batch of at most `batch_size` bets, `None` once the file is
    /// exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Bet>>> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            let Some(line) = self.lines.next_line().await? else {
                break;
            };
            self.line_number += 1;
            // Files exported on other platforms may carry a byte order mark.
            let line = line.strip_prefix('\u{feff}').unwrap_or(&line).trim();
            if line.is_empty() {
                continue;
            }
            match self.parse_row(line) {
                Ok(bet) => batch.push(bet),
                Err(err) => {
                    warn!(line = self.line_number, error = %err, "skipping malformed bet row");
                }
            }
        }
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    fn parse_row(&self, line: &str) -> Result<Bet> {
        let mut rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(line.as_bytes());
        let record = rows
            .records()
            .next()
            .ok_or_else(|| anyhow!("empty row"))??;
        if record.len() != ROW_FIELDS {
            bail!("expected {ROW_FIELDS} fields, got {}", record.len());
        }

        let birthdate = NaiveDate::parse_from_str(record[3].trim(), BIRTHDATE_FORMAT)
            .with_context(|| format!("invalid birthdate {:?}", &record[3]))?;
        let number: u32 = record[4]
            .trim()
            .parse()
            .with_context(|| format!("invalid wager number {:?}", &record[4]))?;

        Ok(Bet {
            agency: self.agency,
            first_name: record[0].trim().to_string(),
            last_name: record[1].trim().to_string(),
            document: record[2].trim().to_string(),
            birthdate,
            number,
        })
    }
}

/// Runs one agency end to end: submit every batch, signal completion, wait
/// through the draw, and print the winners.
pub async fn run(args: ClientArgs) -> Result<()> {
    ensure!(args.id > 0, "agency id must be positive");
    ensure!(args.batch_size > 0, "batch size must be positive");

    let mut batches = BatchReader::open(&args.file, args.id, args.batch_size).await?;

    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!(agency = args.id, server = %args.server, "connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut read_half = BufReader::new(read_half);

    let mut sent = 0usize;
    let mut records = 0usize;
    while let Some(batch) = batches.next_batch().await? {
        let count = batch.len();
        submit_batch(&mut read_half, &mut write_half, batch)
            .await
            .with_context(|| format!("submission {} was not accepted", sent + 1))?;
        sent += 1;
        records += count;
        debug!(batch = sent, count, "batch accepted");
    }
    info!(agency = args.id, batches = sent, records, "all bets submitted");

    let documents = finish_and_fetch_winners(&mut read_half, &mut write_half).await?;
    info!(agency = args.id, winners = documents.len(), "draw results received");

    print_winners(&documents).await?;
    Ok(())
}

async fn submit_batch<R, W>(reader: &mut R, writer: &mut W, bets: Vec<Bet>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    protocol::write_frame(writer, &Frame::Submission(bets)).await?;
    match read_reply(reader).await? {
        Frame::Ack(AckStatus::Ok) => Ok(()),
        Frame::Ack(AckStatus::Fail) => bail!("server rejected the batch"),
        other => bail!("expected an acknowledgement, got {other:?}"),
    }
}

async fn finish_and_fetch_winners<R, W>(reader: &mut R, writer: &mut W) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    protocol::write_frame(writer, &Frame::Finished).await?;
    match read_reply(reader).await? {
        Frame::Winners(documents) => Ok(documents),
        other => bail!("expected draw results, got {other:?}"),
    }
}

async fn read_reply<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let (header, body) = protocol::read_frame(reader)
        .await?
        .ok_or_else(|| anyhow!("server closed the connection"))?;
    Ok(Frame::decode(&header, &body)?)
}

async fn print_winners(documents: &[String]) -> Result<()> {
    let mut report = format!("winners: {}\n", documents.len());
    for document in documents {
        report.push_str(document);
        report.push('\n');
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(report.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
