//! Central lottery server: accept loop, per-connection handlers, and the
//! wiring between the bet log and the draw gate.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::bet::Bet;
use crate::draw::{DrawGate, DrawOutcome};
use crate::protocol::{self, AckStatus, Frame};
use crate::store::BetStore;

pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub agencies: usize,
    pub data_file: PathBuf,
    pub draw_timeout: Duration,
    pub shutdown_grace: Duration,
}

/// Shared state every connection handler works against.
struct ServerState {
    store: BetStore,
    gate: DrawGate,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_grace: Duration,
}

impl Server {
    /// Binds the listening socket and prepares the shared state. Must be
    /// called from within a runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        ensure!(config.agencies > 0, "expected agency count must be positive");

        let socket = match config.listen {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.listen)?;
        let listener = socket.listen(config.backlog)?;

        info!(
            agencies = config.agencies,
            data_file = %config.data_file.display(),
            "server initialized"
        );
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                store: BetStore::new(config.data_file),
                gate: DrawGate::new(config.agencies, config.draw_timeout),
            }),
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts agency connections until the shutdown future resolves, then
    /// drains outstanding handlers.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            shutdown_grace,
        } = self;
        tokio::pin!(shutdown);
        let mut handlers = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut handlers);
                    reap_finished_handlers(&mut handlers);
                }
            }
        }

        // Stop accepting before draining so no new handler sneaks in.
        drop(listener);
        drain_handlers(&state, handlers, shutdown_grace).await;
        Ok(())
    }

    /// Runs until interrupted by ctrl-c.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to listen for shutdown signal");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    handlers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_agency_handler(stream, peer, state, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_agency_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    handlers: &mut JoinSet<()>,
) {
    debug!(%peer, "accepted agency connection");
    let state = Arc::clone(state);
    handlers.spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "agency connection closed with error");
        }
    });
}

/// Collects handlers that already finished so the registry does not grow
/// with connection churn.
fn reap_finished_handlers(handlers: &mut JoinSet<()>) {
    while let Some(result) = handlers.try_join_next() {
        if let Err(err) = result {
            warn!(error = ?err, "connection handler aborted");
        }
    }
}

/// Waits for outstanding handlers, each wait bounded by the grace period.
/// Handlers still running when a full grace period passes without progress
/// are logged and left behind.
async fn drain_handlers(state: &ServerState, mut handlers: JoinSet<()>, grace: Duration) {
    info!(active = handlers.len(), "shutting down");
    state.gate.abort();

    while !handlers.is_empty() {
        match timeout(grace, handlers.join_next()).await {
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(err))) => warn!(error = ?err, "connection handler aborted"),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    abandoned = handlers.len(),
                    "handlers still running after the grace period"
                );
                handlers.detach_all();
                break;
            }
        }
    }
    info!("server shutdown complete");
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    run_session(&mut reader, &mut write_half, &state, peer).await
}

/// Per-connection session machine.
///
/// Submissions are appended and acknowledged without closing the
/// connection; the end-of-submission message registers the agency at the
/// draw gate, answers with its winners, and ends the session. Malformed
/// messages are answered with a failure acknowledgement, and only a
/// malformed end-of-submission message ends the session early.
async fn run_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    state: &ServerState,
    peer: Option<SocketAddr>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut agency: Option<u32> = None;

    while let Some((header, body)) = protocol::read_frame(reader).await? {
        match Frame::decode(&header, &body) {
            Ok(Frame::Submission(bets)) => {
                handle_submission(writer, state, &mut agency, bets).await?;
            }
            Ok(Frame::Finished) => {
                handle_finished(writer, state, agency).await?;
                debug!(peer = ?peer, agency = ?agency, "session complete");
                return Ok(());
            }
            Ok(frame) => {
                warn!(peer = ?peer, frame = ?frame, "unexpected message from agency");
                protocol::write_frame(writer, &Frame::Ack(AckStatus::Fail)).await?;
            }
            Err(err) => {
                warn!(peer = ?peer, error = %err, "rejected malformed message");
                protocol::write_frame(writer, &Frame::Ack(AckStatus::Fail)).await?;
                if protocol::is_finished_header(&header) {
                    return Ok(());
                }
            }
        }
    }

    debug!(peer = ?peer, agency = ?agency, "agency disconnected before finishing");
    Ok(())
}

async fn handle_submission<W>(
    writer: &mut W,
    state: &ServerState,
    agency: &mut Option<u32>,
    bets: Vec<Bet>,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    // A decoded batch is never empty, so the first record names the agency.
    if let Some(first) = bets.first() {
        *agency = Some(first.agency);
    }

    let status = match state.store.append(&bets).await {
        Ok(()) => {
            info!(agency = ?agency, count = bets.len(), "stored bet batch");
            AckStatus::Ok
        }
        Err(err) => {
            warn!(agency = ?agency, error = %err, "failed to store bet batch");
            AckStatus::Fail
        }
    };
    protocol::write_frame(writer, &Frame::Ack(status)).await?;
    Ok(())
}

async fn handle_finished<W>(
    writer: &mut W,
    state: &ServerState,
    agency: Option<u32>,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let outcome = state.gate.arrive().await;

    let documents = match (outcome, agency) {
        (DrawOutcome::Released { .. }, Some(agency)) => {
            match state.store.winners_for(agency).await {
                Ok(documents) => documents,
                Err(err) => {
                    warn!(agency, error = %err, "winner scan failed");
                    Vec::new()
                }
            }
        }
        (DrawOutcome::Released { .. }, None) => {
            warn!("agency finished without a stored batch, no winners to report");
            Vec::new()
        }
        (DrawOutcome::TimedOut, _) => {
            warn!(agency = ?agency, "draw rendezvous timed out, answering with no winners");
            Vec::new()
        }
        (DrawOutcome::Aborted, _) => {
            warn!(agency = ?agency, "draw aborted by shutdown, answering with no winners");
            Vec::new()
        }
    };

    info!(agency = ?agency, winners = documents.len(), "sending draw results");
    protocol::write_frame(writer, &Frame::Winners(documents)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, write_frame};
    use chrono::NaiveDate;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    fn test_state(agencies: usize, data_file: &Path) -> Arc<ServerState> {
        Arc::new(ServerState {
            store: BetStore::new(data_file),
            gate: DrawGate::new(agencies, Duration::from_secs(5)),
        })
    }

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

    struct SessionUnderTest {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        session: JoinHandle<Result<()>>,
    }

    fn spawn_session(state: &Arc<ServerState>) -> SessionUnderTest {
        let (agency_side, server_side) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let state = Arc::clone(state);
        let session = tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut writer = server_write;
            run_session(&mut reader, &mut writer, &state, None).await
        });

        let (agency_read, agency_write) = tokio::io::split(agency_side);
        SessionUnderTest {
            reader: BufReader::new(agency_read),
            writer: agency_write,
            session,
        }
    }

    impl SessionUnderTest {
        async fn send(&mut self, frame: &Frame) {
            write_frame(&mut self.writer, frame).await.expect("send");
        }

        async fn send_raw(&mut self, payload: &str) {
            self.writer
                .write_all(payload.as_bytes())
                .await
                .expect("send raw");
        }

        async fn reply(&mut self) -> Frame {
            let (header, body) = timeout(Duration::from_secs(5), read_frame(&mut self.reader))
                .await
                .expect("reply before timeout")
                .expect("read reply")
                .expect("session still open");
            Frame::decode(&header, &body).expect("decode reply")
        }

        async fn expect_closed(mut self) {
            let next = timeout(Duration::from_secs(5), read_frame(&mut self.reader))
                .await
                .expect("close before timeout")
                .expect("read");
            assert!(next.is_none(), "expected closed session, got {next:?}");
            timeout(Duration::from_secs(5), self.session)
                .await
                .expect("session exit")
                .expect("session join")
                .expect("session result");
        }
    }

    #[tokio::test]
    async fn submissions_are_acked_and_finish_reports_winners() {
        let dir = tempdir().unwrap();
        let state = test_state(1, &dir.path().join("bets.csv"));
        let mut agency = spawn_session(&state);

        agency
            .send(&Frame::Submission(vec![
                bet(3, "30000001", 7574),
                bet(3, "30000002", 11),
            ]))
            .await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Ok));

        agency.send(&Frame::Finished).await;
        assert_eq!(
            agency.reply().await,
            Frame::Winners(vec!["30000001".into()])
        );
        agency.expect_closed().await;
    }

    #[tokio::test]
    async fn malformed_batches_are_rejected_without_closing() {
        let dir = tempdir().unwrap();
        let state = test_state(1, &dir.path().join("bets.csv"));
        let mut agency = spawn_session(&state);

        agency.send_raw("S:3\nnot~enough\n").await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Fail));

        // The session must still accept a correct batch afterwards.
        agency
            .send(&Frame::Submission(vec![bet(2, "20000001", 7574)]))
            .await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Ok));

        agency.send(&Frame::Finished).await;
        assert_eq!(
            agency.reply().await,
            Frame::Winners(vec!["20000001".into()])
        );
        agency.expect_closed().await;
    }

    #[tokio::test]
    async fn malformed_finish_closes_after_fail() {
        let dir = tempdir().unwrap();
        let state = test_state(1, &dir.path().join("bets.csv"));
        let mut agency = spawn_session(&state);

        agency.send_raw("F:1\nDONE\n").await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Fail));
        agency.expect_closed().await;
    }

    #[tokio::test]
    async fn finish_without_batches_reports_no_winners() {
        let dir = tempdir().unwrap();
        let state = test_state(1, &dir.path().join("bets.csv"));
        let mut agency = spawn_session(&state);

        agency.send(&Frame::Finished).await;
        assert_eq!(agency.reply().await, Frame::Winners(Vec::new()));
        agency.expect_closed().await;
    }

    #[tokio::test]
    async fn unexpected_frames_get_fail_and_session_continues() {
        let dir = tempdir().unwrap();
        let state = test_state(1, &dir.path().join("bets.csv"));
        let mut agency = spawn_session(&state);

        agency.send(&Frame::Ack(AckStatus::Ok)).await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Fail));

        agency
            .send(&Frame::Submission(vec![bet(4, "40000001", 7574)]))
            .await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Ok));
    }

    #[tokio::test]
    async fn storage_failure_is_acked_as_fail() {
        let dir = tempdir().unwrap();
        // Pointing the log at a directory makes every append fail.
        let state = test_state(1, dir.path());
        let mut agency = spawn_session(&state);

        agency
            .send(&Frame::Submission(vec![bet(1, "10000001", 7574)]))
            .await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Fail));

        // The session survives the storage error.
        agency.send(&Frame::Finished).await;
        assert!(matches!(agency.reply().await, Frame::Winners(_)));
        agency.expect_closed().await;
    }

    #[tokio::test]
    async fn disconnect_before_finish_ends_the_session_cleanly() {
        let dir = tempdir().unwrap();
        let state = test_state(2, &dir.path().join("bets.csv"));
        let mut agency = spawn_session(&state);

        agency
            .send(&Frame::Submission(vec![bet(1, "10000001", 1)]))
            .await;
        assert_eq!(agency.reply().await, Frame::Ack(AckStatus::Ok));

        drop(agency.writer);
        drop(agency.reader);
        let result = timeout(Duration::from_secs(5), agency.session)
            .await
            .expect("session exit")
            .expect("session join");
        assert!(result.is_ok());
    }
}
