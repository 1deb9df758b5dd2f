//! Wire protocol spoken between agencies and the central server.
//!
//! Every message is two newline-terminated lines: a `TAG:COUNT` header
//! followed by one body line. The count is the number of payload items in
//! the body (bet-strings or winner documents) so the receiver can validate
//! the batch before parsing any record.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::bet::{Bet, BetParseError};

/// Separator between bet-strings (and winner documents) in a body line.
pub const BATCH_SEPARATOR: char = '~';

const TAG_SUBMISSION: &str = "S";
const TAG_FINISHED: &str = "F";
const TAG_WINNERS: &str = "W";
const TAG_ACK: &str = "R";

const FINISHED_BODY: &str = "FINISHED";
const NO_WINNERS_BODY: &str = "N";
const ACK_OK_BODY: &str = "OK";
const ACK_FAIL_BODY: &str = "FAIL";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Batch of bets an agency wants stored.
    Submission(Vec<Bet>),
    /// End-of-submissions marker; the sender now waits for the draw.
    Finished,
    /// Winning documents for the asking agency, possibly none.
    Winners(Vec<String>),
    /// Outcome of the previous submission.
    Ack(AckStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    Fail,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed header {0:?}")]
    MalformedHeader(String),
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    #[error("header declared {declared} items but the body carries {actual}")]
    CountMismatch { declared: usize, actual: usize },
    #[error("unexpected body {0:?}")]
    UnexpectedBody(String),
    #[error(transparent)]
    Bet(#[from] BetParseError),
}

impl Frame {
    /// Decodes a header/body pair read off the wire.
    pub fn decode(header: &str, body: &str) -> Result<Self, ProtocolError> {
        let (tag, count) = header
            .split_once(':')
            .and_then(|(tag, count)| Some((tag, count.parse::<usize>().ok()?)))
            .ok_or_else(|| ProtocolError::MalformedHeader(header.to_string()))?;

        match tag {
            TAG_SUBMISSION => decode_submission(count, body),
            TAG_FINISHED => {
                expect_count(header, count, 1)?;
                expect_body(body, FINISHED_BODY)?;
                Ok(Frame::Finished)
            }
            TAG_WINNERS => decode_winners(count, body),
            TAG_ACK => {
                expect_count(header, count, 1)?;
                match body {
                    ACK_OK_BODY => Ok(Frame::Ack(AckStatus::Ok)),
                    ACK_FAIL_BODY => Ok(Frame::Ack(AckStatus::Fail)),
                    other => Err(ProtocolError::UnexpectedBody(other.to_string())),
                }
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }

    /// Encodes the frame as its two wire lines, trailing newlines included.
    pub fn encode(&self) -> String {
        let (tag, count, body) = match self {
            Frame::Submission(bets) => {
                let body = bets
                    .iter()
                    .map(Bet::encode)
                    .collect::<Vec<_>>()
                    .join(&BATCH_SEPARATOR.to_string());
                (TAG_SUBMISSION, bets.len(), body)
            }
            Frame::Finished => (TAG_FINISHED, 1, FINISHED_BODY.to_string()),
            Frame::Winners(documents) if documents.is_empty() => {
                (TAG_WINNERS, 0, NO_WINNERS_BODY.to_string())
            }
            Frame::Winners(documents) => (
                TAG_WINNERS,
                documents.len(),
                documents.join(&BATCH_SEPARATOR.to_string()),
            ),
            Frame::Ack(AckStatus::Ok) => (TAG_ACK, 1, ACK_OK_BODY.to_string()),
            Frame::Ack(AckStatus::Fail) => (TAG_ACK, 1, ACK_FAIL_BODY.to_string()),
        };
        format!("{tag}:{count}\n{body}\n")
    }
}

/// True when the header names the end-of-submission tag, whether or not
/// the whole message decodes.
pub fn is_finished_header(header: &str) -> bool {
    header.split(':').next() == Some(TAG_FINISHED)
}

fn decode_submission(declared: usize, body: &str) -> Result<Frame, ProtocolError> {
    let items: Vec<&str> = body.split(BATCH_SEPARATOR).collect();
    if items.len() != declared {
        return Err(ProtocolError::CountMismatch {
            declared,
            actual: items.len(),
        });
    }
    let bets = items
        .into_iter()
        .map(Bet::decode)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Frame::Submission(bets))
}

fn decode_winners(declared: usize, body: &str) -> Result<Frame, ProtocolError> {
    if declared == 0 {
        expect_body(body, NO_WINNERS_BODY)?;
        return Ok(Frame::Winners(Vec::new()));
    }
    let documents: Vec<String> = body
        .split(BATCH_SEPARATOR)
        .map(str::to_string)
        .collect();
    if documents.len() != declared {
        return Err(ProtocolError::CountMismatch {
            declared,
            actual: documents.len(),
        });
    }
    Ok(Frame::Winners(documents))
}

fn expect_count(header: &str, got: usize, want: usize) -> Result<(), ProtocolError> {
    if got == want {
        Ok(())
    } else {
        Err(ProtocolError::MalformedHeader(header.to_string()))
    }
}

fn expect_body(got: &str, want: &str) -> Result<(), ProtocolError> {
    if got == want {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedBody(got.to_string()))
    }
}

/// Reads the next header/body pair off the wire.
///
/// Returns `Ok(None)` when the peer closed the connection before sending a
/// header. A close after the header started, or any line that ends without
/// its newline, is a transport failure and surfaces as `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<(String, String)>>
where
    R: AsyncBufRead + Unpin,
{
    let header = match read_wire_line(reader).await? {
        Some(line) => line,
        None => return Ok(None),
    };
    let body = match read_wire_line(reader).await? {
        Some(line) => line,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed between header and body",
            ))
        }
    };
    Ok(Some((header, body)))
}

async fn read_wire_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        ));
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes one frame and flushes it.
///
/// `write_all` keeps writing through partial writes and fails the message
/// if the peer stops accepting bytes, so a frame is never half-sent
/// silently.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.encode().as_bytes()).await?;
    writer.flush().await
}
