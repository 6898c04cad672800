use quanta::Instant;
use splice_transport::congestion::pacing_delay;
use splice_transport::session::ErrorBudget;
use splice_transport::wire::{is_source_id, Message, RxStatus, CLIENT_ID, DATA_PACKET_LEN};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::source::{Catalog, PayloadSource};
use crate::config::SpliceConfig;
use crate::error::SessionError;
use crate::net::udp::{recv_classified, send_message};
use crate::scheduler::bucket::SpliceScheduler;

/// Idle wait between control polls once the stream is exhausted.
const LINGER_POLL: Duration = Duration::from_millis(1);

/// How a server session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOutcome {
    /// Every owned sequence was sent, FIN went out and the client went quiet.
    Completed,
    /// The client sent FIN.
    ClientFinished,
    Cancelled,
}

/// Summary of one served session.
#[derive(Debug, Clone)]
pub struct ServerReport {
    pub id: u8,
    pub filename: String,
    pub outcome: ServerOutcome,
    pub packets_sent: u64,
    pub retransmits: u64,
    pub switches_accepted: u64,
    pub switches_rejected: u64,
    pub rate_kbps: u32,
}

impl ServerReport {
    fn new(id: u8, filename: String, rate_kbps: u32) -> Self {
        Self {
            id,
            filename,
            outcome: ServerOutcome::Completed,
            packets_sent: 0,
            retransmits: 0,
            switches_accepted: 0,
            switches_rejected: 0,
            rate_kbps,
        }
    }
}

/// One of the four sources.
///
/// Waits for a REQUEST, then streams the sequences its [`SpliceScheduler`]
/// assigns to it. Between sends the socket is polled without blocking for
/// NAK, SPLICE, RATE and FIN control packets; the loop is single threaded.
pub struct SourceServer {
    id: u8,
    socket: UdpSocket,
    config: SpliceConfig,
    catalog: Catalog,
    cancel: Arc<AtomicBool>,
}

struct Stream {
    client: SocketAddr,
    source: Box<dyn PayloadSource>,
    scheduler: SpliceScheduler,
    total_packets: u32,
    pacing: Duration,
    budget: ErrorBudget,
    report: ServerReport,
}

enum Control {
    Continue,
    ClientFinished,
}

impl SourceServer {
    pub fn bind(
        id: u8,
        addr: SocketAddr,
        config: SpliceConfig,
        catalog: Catalog,
    ) -> Result<Self, SessionError> {
        if !is_source_id(id) {
            return Err(SessionError::InvalidSource(id));
        }
        let socket = UdpSocket::bind(addr)?;
        info!(id, addr = %socket.local_addr()?, "source server bound");
        Ok(Self {
            id,
            socket,
            config,
            catalog,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Setting the flag ends the session at the next poll.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Wait for one request and serve it to completion.
    pub fn serve(&mut self) -> Result<ServerReport, SessionError> {
        let Some(mut stream) = self.await_request()? else {
            let mut report = ServerReport::new(self.id, String::new(), self.config.rate.max_kbps);
            report.outcome = ServerOutcome::Cancelled;
            return Ok(report);
        };
        match self.stream(&mut stream) {
            Ok(outcome) => {
                stream.report.outcome = outcome;
                info!(
                    id = self.id,
                    ?outcome,
                    sent = stream.report.packets_sent,
                    retransmits = stream.report.retransmits,
                    "session finished"
                );
                Ok(stream.report)
            }
            Err(e) => {
                error!(id = self.id, error = %e, "streaming failed");
                Err(e)
            }
        }
    }

    /// Wait in bounded reads until a client asks for a file we can serve.
    /// Returns `None` if cancelled first.
    fn await_request(&mut self) -> Result<Option<Stream>, SessionError> {
        self.socket.set_nonblocking(false)?;
        self.socket
            .set_read_timeout(Some(self.config.session.recv_timeout))?;
        info!(id = self.id, "waiting for a request");

        let mut buf = vec![0u8; DATA_PACKET_LEN + 1];
        while !self.cancelled() {
            let dgram = recv_classified(&self.socket, &mut buf, self.id);
            let Some(from) = dgram.from else { continue };
            if dgram.status != RxStatus::Ok {
                debug!(id = self.id, status = ?dgram.status, "ignored datagram while idle");
                continue;
            }
            let Some((_, Message::Request { filename })) = dgram.message(&buf) else {
                debug!(id = self.id, %from, "non-request datagram while idle");
                continue;
            };

            let Some(source) = self.catalog.open(&filename)? else {
                warn!(id = self.id, client = %from, filename = %filename, "request refused");
                self.send(&Message::RequestNak, from)?;
                continue;
            };
            let info = source.stream_info();
            self.send(&Message::RequestAck(info), from)?;
            info!(
                id = self.id,
                client = %from,
                filename = %filename,
                total_packets = info.total_packets,
                "request accepted, streaming"
            );
            let rate_kbps = self.config.rate.max_kbps;
            return Ok(Some(Stream {
                client: from,
                source,
                scheduler: SpliceScheduler::new(self.id, self.config.splice.frame),
                total_packets: info.total_packets,
                pacing: pacing_delay(rate_kbps),
                budget: ErrorBudget::new(self.config.session.max_consecutive_errors),
                report: ServerReport::new(self.id, filename, rate_kbps),
            }));
        }
        Ok(None)
    }

    fn stream(&mut self, stream: &mut Stream) -> Result<ServerOutcome, SessionError> {
        self.socket.set_nonblocking(true)?;
        let mut buf = vec![0u8; DATA_PACKET_LEN + 1];

        while stream.scheduler.current_seq() <= stream.total_packets {
            if self.cancelled() {
                info!(id = self.id, "cancelled, sending FIN");
                if let Err(e) = self.send(&Message::Fin, stream.client) {
                    warn!(id = self.id, error = %e, "FIN send failed");
                }
                return Ok(ServerOutcome::Cancelled);
            }
            if let Control::ClientFinished = self.poll_control(stream, &mut buf)? {
                return Ok(ServerOutcome::ClientFinished);
            }

            let Some(seq) = stream.scheduler.next_owned() else {
                continue;
            };
            if seq > stream.total_packets {
                continue;
            }
            match self.send_data(stream, seq) {
                Ok(()) => {
                    stream.budget.record_success();
                    stream.report.packets_sent += 1;
                }
                Err(e) => {
                    warn!(id = self.id, seq, error = %e, "data send failed");
                    if stream.budget.record_failure() {
                        return Err(self.fail(stream));
                    }
                }
            }
            thread::sleep(stream.pacing);
        }

        info!(id = self.id, sent = stream.report.packets_sent, "stream exhausted, sending FIN");
        self.send(&Message::Fin, stream.client)?;

        // Keep answering NAKs until the client finishes or goes quiet.
        let mut quiet_since = Instant::now();
        let mut served = stream.report.retransmits;
        while !self.cancelled() {
            if let Control::ClientFinished = self.poll_control(stream, &mut buf)? {
                return Ok(ServerOutcome::ClientFinished);
            }
            let now = Instant::now();
            if stream.report.retransmits != served {
                served = stream.report.retransmits;
                quiet_since = now;
            }
            if now.duration_since(quiet_since) >= self.config.session.fin_grace {
                return Ok(ServerOutcome::Completed);
            }
            thread::sleep(LINGER_POLL);
        }
        Ok(ServerOutcome::Cancelled)
    }

    /// Drain pending control packets without blocking.
    fn poll_control(&mut self, stream: &mut Stream, buf: &mut [u8]) -> Result<Control, SessionError> {
        loop {
            let dgram = recv_classified(&self.socket, buf, self.id);
            match dgram.status {
                RxStatus::Ok => {}
                RxStatus::Timeout => return Ok(Control::Continue),
                RxStatus::PeerTerminated => {
                    error!(id = self.id, "client sent FAIL");
                    return Err(SessionError::PeerTerminated(CLIENT_ID));
                }
                RxStatus::WrongDestination => {
                    debug!(id = self.id, "datagram for another node dropped");
                    continue;
                }
                status => {
                    warn!(id = self.id, ?status, "bad control datagram");
                    if stream.budget.record_failure() {
                        return Err(self.fail(stream));
                    }
                    continue;
                }
            }
            let Some((_, msg)) = dgram.message(buf) else {
                continue;
            };
            if dgram.from != Some(stream.client) {
                debug!(id = self.id, from = ?dgram.from, "control packet from unknown peer ignored");
                continue;
            }
            stream.budget.record_success();

            match msg {
                Message::Nak { seq } => {
                    if seq == 0 || seq > stream.total_packets {
                        warn!(id = self.id, seq, "NAK outside the stream ignored");
                        continue;
                    }
                    debug!(id = self.id, seq, "retransmission requested");
                    match self.send_data(stream, seq) {
                        Ok(()) => stream.report.retransmits += 1,
                        Err(e) => warn!(id = self.id, seq, error = %e, "retransmission failed"),
                    }
                }
                Message::SpliceUpdate(update) => match stream.scheduler.schedule_switch(update) {
                    Ok(()) => {
                        stream.report.switches_accepted += 1;
                        self.send(&Message::SpliceAck { sseq: update.sseq }, stream.client)?;
                    }
                    Err(e) => {
                        stream.report.switches_rejected += 1;
                        warn!(id = self.id, error = %e, "splice update discarded");
                    }
                },
                Message::RateChange { rate_kbps } => {
                    stream.report.rate_kbps = rate_kbps;
                    stream.pacing = pacing_delay(rate_kbps);
                    info!(
                        id = self.id,
                        rate_kbps,
                        pacing_us = stream.pacing.as_micros() as u64,
                        "rate changed"
                    );
                }
                Message::Fin => {
                    info!(id = self.id, "client finished the session");
                    return Ok(Control::ClientFinished);
                }
                Message::Request { .. } => {
                    // The client did not see our ack.
                    let info = stream.source.stream_info();
                    self.send(&Message::RequestAck(info), stream.client)?;
                }
                other => {
                    warn!(id = self.id, packet_type = %other.packet_type(), "unexpected packet type");
                }
            }
        }
    }

    fn send_data(&self, stream: &mut Stream, seq: u32) -> Result<(), SessionError> {
        let payload = stream
            .source
            .payload(seq)?
            .ok_or(SessionError::Internal("payload source ended before its stream length"))?;
        self.send(&Message::Data { seq, payload }, stream.client)
    }

    fn send(&self, msg: &Message, to: SocketAddr) -> Result<(), SessionError> {
        send_message(&self.socket, msg, self.id, CLIENT_ID, to)
    }

    /// Tell the client we are giving up.
    fn fail(&self, stream: &Stream) -> SessionError {
        let errors = stream.budget.consecutive();
        error!(id = self.id, errors, "error budget exhausted, sending FAIL");
        if let Err(e) = self.send(&Message::Fail, stream.client) {
            warn!(id = self.id, error = %e, "FAIL send failed");
        }
        SessionError::ErrorBudgetExhausted(errors)
    }
}
