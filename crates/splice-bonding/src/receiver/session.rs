use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use quanta::Instant;
use splice_transport::arq::{selector_for, RetransmitPlanner};
use splice_transport::congestion::RateController;
use splice_transport::session::{ErrorBudget, FinTracker, Handshake, LegState, SessionState};
use splice_transport::wire::{
    is_source_id, Message, RxStatus, SpliceUpdate, StreamInfo, CLIENT_ID, DATA_PACKET_LEN,
    SOURCE_COUNT,
};
use std::io::{self, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::aggregator::{ReorderBuffer, ReorderStats};
use super::sink::FrameSink;
use crate::config::SpliceConfig;
use crate::error::SessionError;
use crate::net::udp::{broadcast, recv_classified, send_message, Datagram};
use crate::scheduler::ratio::{SpliceController, SpliceStats};

/// Upper bound on a single blocking read, so cancellation and ack timeouts
/// are noticed while the sources are silent.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Summary of one client session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub filename: String,
    pub state: SessionState,
    pub stream: Option<StreamInfo>,
    pub active_sources: [bool; SOURCE_COUNT],
    pub packets_received: u64,
    pub packets_per_source: [u64; SOURCE_COUNT],
    pub buffer: ReorderStats,
    pub splice: SpliceStats,
    pub naks_sent: u64,
    pub rate_changes: u64,
    pub final_rate_kbps: u32,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Reorder buffer and output, shared between the receive loop and the timer.
struct Playout<S> {
    buffer: ReorderBuffer,
    sink: S,
    /// First sink failure; the session aborts once it is seen.
    write_error: Option<io::Error>,
}

impl<S: FrameSink> Playout<S> {
    fn flush(&mut self) {
        if self.write_error.is_some() {
            return;
        }
        if let Err(e) = self.buffer.flush(&mut self.sink) {
            error!(error = %e, "output write failed");
            self.write_error = Some(e);
        }
    }
}

#[derive(Debug, Default)]
struct TimerReport {
    naks_sent: u64,
    rate_changes: u64,
    final_rate_kbps: u32,
}

/// Everything the periodic timer thread needs.
struct Timer<S> {
    socket: Arc<UdpSocket>,
    servers: [SocketAddr; SOURCE_COUNT],
    playout: Arc<Mutex<Playout<S>>>,
    ratios: Arc<ArcSwap<[u8; SOURCE_COUNT]>>,
    /// Sources that accepted the request; refused ones are never NAKed.
    active: [bool; SOURCE_COUNT],
    rate: RateController,
    planner: RetransmitPlanner,
    interval: Duration,
}

impl<S: FrameSink> Timer<S> {
    /// Flush, adjust the send rate, and NAK lost sequences every `interval`
    /// until the stop channel closes.
    fn run(mut self, stop: Receiver<()>) -> TimerReport {
        let mut report = TimerReport::default();
        loop {
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let mut ratios = **self.ratios.load();
            for (weight, &active) in ratios.iter_mut().zip(&self.active) {
                if !active {
                    *weight = 0;
                }
            }
            let mut playout = self.playout.lock().unwrap_or_else(|e| e.into_inner());
            playout.flush();

            let occupancy = playout.buffer.occupancy();
            if let Some(change) = self.rate.on_occupancy(occupancy) {
                let rate_kbps = change.rate_kbps();
                info!(?change, occupancy, "requesting new send rate");
                broadcast(&self.socket, &Message::RateChange { rate_kbps }, CLIENT_ID, &self.servers);
                report.rate_changes += 1;
            }

            let naks = self.planner.plan(playout.buffer.lost(), &ratios);
            drop(playout);
            for nak in naks {
                let to = self.servers[nak.source as usize];
                match send_message(&self.socket, &Message::Nak { seq: nak.seq }, CLIENT_ID, nak.source, to) {
                    Ok(()) => report.naks_sent += 1,
                    Err(e) => warn!(seq = nak.seq, source = nak.source, error = %e, "NAK send failed"),
                }
            }
        }
        report.final_rate_kbps = self.rate.rate_kbps();
        report
    }
}

/// What the receive loop should do with one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rx {
    Packet,
    Skip,
    /// A full receive timeout passed without any packet.
    Silent,
}

/// Counters owned by the receive loop.
#[derive(Debug, Default)]
struct Arrivals {
    packets: u64,
    per_source: [u64; SOURCE_COUNT],
}

/// The client side of a spliced transfer.
///
/// Requests a file from all four sources, reorders the DATA they send into
/// a [`FrameSink`], and steers the split between them with SPLICE updates.
/// Packet reception, splice control and FIN tracking run on the calling
/// thread; a `splice-timer` thread flushes the buffer, adapts the send rate
/// and requests retransmissions.
pub struct ClientSession {
    socket: Arc<UdpSocket>,
    servers: [SocketAddr; SOURCE_COUNT],
    config: SpliceConfig,
    cancel: Arc<AtomicBool>,
    arrival_log: Option<Box<dyn Write + Send>>,
    started: Instant,
}

impl ClientSession {
    pub fn bind(
        local: SocketAddr,
        servers: [SocketAddr; SOURCE_COUNT],
        config: SpliceConfig,
    ) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(config.session.recv_timeout.min(POLL_INTERVAL)))?;
        info!(addr = %socket.local_addr()?, ?servers, "client bound");
        Ok(Self {
            socket: Arc::new(socket),
            servers,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            arrival_log: None,
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Setting the flag closes the session at the next poll; the sources are
    /// told with FIN.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Record `<elapsed ms> <seq>` for every DATA packet received.
    pub fn with_arrival_log(mut self, log: Box<dyn Write + Send>) -> Self {
        self.arrival_log = Some(log);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Fetch `filename` into `sink`. On success the sink is handed back
    /// after [`FrameSink::finish`]; on failure it has still been flushed as
    /// far as the data allowed.
    pub fn run<S: FrameSink + 'static>(
        mut self,
        filename: &str,
        sink: S,
    ) -> Result<(SessionReport, S), SessionError> {
        self.started = Instant::now();
        let playout = Arc::new(Mutex::new(Playout {
            buffer: ReorderBuffer::new(self.config.buffer.capacity, self.config.buffer.lost_threshold),
            sink,
            write_error: None,
        }));
        let mut budget = ErrorBudget::new(self.config.session.max_consecutive_errors);
        let mut arrivals = Arrivals::default();
        let mut report = SessionReport {
            filename: filename.to_string(),
            state: SessionState::Requesting,
            stream: None,
            active_sources: [false; SOURCE_COUNT],
            packets_received: 0,
            packets_per_source: [0; SOURCE_COUNT],
            buffer: ReorderStats::default(),
            splice: SpliceStats::default(),
            naks_sent: 0,
            rate_changes: 0,
            final_rate_kbps: self.config.rate.max_kbps,
            cancelled: false,
            elapsed: Duration::ZERO,
        };

        info!(filename, "requesting stream from all sources");
        let handshake = match self.handshake(filename, &playout, &mut budget, &mut arrivals) {
            Ok(Some(handshake)) => handshake,
            Ok(None) => {
                report.cancelled = true;
                report.state = SessionState::Closed;
                return self.close(report, arrivals, playout, None, TimerReport::default());
            }
            Err(e) => {
                self.notify_failure(&e);
                return Err(e);
            }
        };

        let active = handshake.active_sources();
        let stream = handshake.stream_info();
        report.active_sources = active;
        report.stream = stream;
        report.state = SessionState::Streaming;
        info!(
            ?active,
            total_packets = stream.map(|s| s.total_packets),
            total_len = stream.map(|s| s.total_len),
            "handshake complete, streaming"
        );

        let mut controller = SpliceController::new(self.config.splice.clone(), active);
        let ratios = Arc::new(ArcSwap::from_pointee(controller.current_ratios()));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let timer = Timer {
            socket: self.socket.clone(),
            servers: self.servers,
            playout: playout.clone(),
            ratios: ratios.clone(),
            active,
            rate: RateController::new(self.config.rate.clone()),
            planner: RetransmitPlanner::new(
                selector_for(self.config.retransmit.strategy, self.config.retransmit.seed),
                self.config.splice.frame,
                self.config.splice.ignore_divisor,
                self.config.retransmit.max_per_tick,
            ),
            interval: self.config.buffer.check_interval,
        };
        let timer_handle = thread::Builder::new()
            .name("splice-timer".into())
            .spawn(move || timer.run(stop_rx))?;

        let outcome = self.stream(
            &playout,
            &mut controller,
            &ratios,
            active,
            stream,
            &mut budget,
            &mut arrivals,
        );

        drop(stop_tx);
        let timer_report = timer_handle
            .join()
            .map_err(|_| SessionError::Internal("timer thread panicked"))?;
        report.splice = controller.get_stats();

        match outcome {
            Ok(cancelled) => {
                report.cancelled = cancelled;
                report.state = SessionState::Closed;
                self.close(report, arrivals, playout, stream, timer_report)
            }
            Err(e) => {
                self.notify_failure(&e);
                report.state = SessionState::Failed;
                // Keep whatever arrived in order.
                if let Err(close_err) = self.close(report, arrivals, playout, stream, timer_report) {
                    warn!(error = %close_err, "closing output after failure also failed");
                }
                Err(e)
            }
        }
    }

    /// Send REQUEST to every source and collect their replies. DATA from
    /// sources that already accepted is buffered meanwhile. Returns `None`
    /// if cancelled first.
    fn handshake<S: FrameSink>(
        &mut self,
        filename: &str,
        playout: &Mutex<Playout<S>>,
        budget: &mut ErrorBudget,
        arrivals: &mut Arrivals,
    ) -> Result<Option<Handshake>, SessionError> {
        let request = Message::Request {
            filename: filename.to_string(),
        };
        broadcast(&self.socket, &request, CLIENT_ID, &self.servers);

        let mut handshake = Handshake::new();
        let mut buf = vec![0u8; DATA_PACKET_LEN + 1];
        let mut last_rx = Instant::now();
        loop {
            if self.cancelled() {
                info!("cancelled during handshake");
                self.broadcast_fin(2);
                return Ok(None);
            }
            if handshake.all_refused() {
                return Err(SessionError::AllRefused(filename.to_string()));
            }
            if handshake.is_complete() {
                return Ok(Some(handshake));
            }

            let dgram = recv_classified(&self.socket, &mut buf, CLIENT_ID);
            let now = Instant::now();
            match self.account(&dgram, &buf, budget, &mut last_rx, now)? {
                Rx::Packet => {}
                Rx::Skip => continue,
                Rx::Silent => {
                    self.resend_request(&handshake, &request);
                    continue;
                }
            }
            let Some((hdr, msg)) = dgram.message(&buf) else {
                continue;
            };
            if !is_source_id(hdr.src) {
                warn!(src = hdr.src, "packet from unknown source dropped");
                continue;
            }
            match msg {
                Message::RequestAck(_) | Message::RequestNak => {
                    let accepted = matches!(msg, Message::RequestAck(_));
                    if handshake.leg(hdr.src) == Some(LegState::Pending) {
                        handshake.on_reply(hdr.src, &msg);
                        info!(src = hdr.src, accepted, "source replied to request");
                    }
                }
                Message::Data { seq, payload } if handshake.is_acked(hdr.src) => {
                    self.accept_data(playout, arrivals, hdr.src, seq, payload, now)?;
                }
                other => {
                    debug!(src = hdr.src, packet_type = %other.packet_type(), "ignored during handshake");
                }
            }
        }
    }

    /// Re-send the request to sources that have not answered.
    fn resend_request(&self, handshake: &Handshake, request: &Message) {
        for (src, addr) in self.servers.iter().enumerate() {
            let src = src as u8;
            if handshake.leg(src) != Some(LegState::Pending) {
                continue;
            }
            debug!(src, "no reply yet, re-sending request");
            if let Err(e) = send_message(&self.socket, request, CLIENT_ID, src, *addr) {
                warn!(src, error = %e, "request resend failed");
            }
        }
    }

    /// Receive loop of the streaming phase. Returns whether the session was
    /// cancelled.
    #[allow(clippy::too_many_arguments)]
    fn stream<S: FrameSink>(
        &mut self,
        playout: &Mutex<Playout<S>>,
        controller: &mut SpliceController,
        ratios: &ArcSwap<[u8; SOURCE_COUNT]>,
        active: [bool; SOURCE_COUNT],
        stream: Option<StreamInfo>,
        budget: &mut ErrorBudget,
        arrivals: &mut Arrivals,
    ) -> Result<bool, SessionError> {
        let mut fins = FinTracker::new(active, self.config.session.fin_grace);
        let mut buf = vec![0u8; DATA_PACKET_LEN + 1];
        let mut last_rx = Instant::now();
        let mut tail_marked = false;

        loop {
            let now = Instant::now();
            if self.cancelled() {
                info!("cancelled, closing session");
                self.broadcast_fin(2);
                return Ok(true);
            }
            if fins.all_received() {
                let mut p = playout.lock().unwrap_or_else(|e| e.into_inner());
                if !tail_marked {
                    if let Some(info) = stream {
                        p.buffer.mark_end(info.total_packets);
                    }
                    tail_marked = true;
                }
                p.flush();
                if stream.is_none() || p.buffer.is_complete() {
                    info!("all sources finished and the stream is complete");
                    drop(p);
                    self.broadcast_fin(1);
                    return Ok(false);
                }
            }
            if fins.grace_expired(now) {
                warn!(
                    received = arrivals.packets,
                    "sources went quiet after FIN, closing with what arrived"
                );
                self.broadcast_fin(1);
                return Ok(false);
            }
            if let Some(update) = controller.poll_ack_timeout(now) {
                self.push_splice(ratios, &update);
            }

            let dgram = recv_classified(&self.socket, &mut buf, CLIENT_ID);
            let now = Instant::now();
            if self.account(&dgram, &buf, budget, &mut last_rx, now)? != Rx::Packet {
                continue;
            }
            let Some((hdr, msg)) = dgram.message(&buf) else {
                continue;
            };
            if !is_source_id(hdr.src) {
                warn!(src = hdr.src, "packet from unknown source dropped");
                continue;
            }

            match msg {
                Message::Data { seq, payload } => {
                    fins.note_activity(now);
                    if let Some(update) = controller.record_data(hdr.src, seq, now) {
                        self.push_splice(ratios, &update);
                    }
                    self.accept_data(playout, arrivals, hdr.src, seq, payload, now)?;
                }
                Message::SpliceAck { sseq } => {
                    if controller.on_ack(hdr.src, sseq) {
                        debug!(sseq, "splice quorum reached");
                    }
                }
                Message::Fin => {
                    info!(src = hdr.src, "source finished");
                    fins.on_fin(hdr.src, now);
                }
                Message::RequestAck(_) | Message::RequestNak => {
                    debug!(src = hdr.src, "late handshake reply ignored");
                }
                other => {
                    warn!(src = hdr.src, packet_type = %other.packet_type(), "unexpected packet type");
                }
            }
        }
    }

    /// Apply the error budget to one read.
    fn account(
        &self,
        dgram: &Datagram,
        buf: &[u8],
        budget: &mut ErrorBudget,
        last_rx: &mut Instant,
        now: Instant,
    ) -> Result<Rx, SessionError> {
        match dgram.status {
            RxStatus::Ok => {
                budget.record_success();
                *last_rx = now;
                Ok(Rx::Packet)
            }
            RxStatus::PeerTerminated => {
                let src = dgram.header(buf).map_or(CLIENT_ID, |hdr| hdr.src);
                error!(src, "source sent FAIL");
                Err(SessionError::PeerTerminated(src))
            }
            RxStatus::Timeout => {
                // Short polls; only a full receive timeout of silence counts.
                if now.duration_since(*last_rx) < self.config.session.recv_timeout {
                    return Ok(Rx::Skip);
                }
                *last_rx = now;
                warn!(timeout = ?self.config.session.recv_timeout, "no packets received");
                self.charge(budget)?;
                Ok(Rx::Silent)
            }
            RxStatus::WrongDestination => {
                debug!(from = ?dgram.from, "datagram for another node dropped");
                Ok(Rx::Skip)
            }
            status => {
                warn!(?status, from = ?dgram.from, "bad datagram");
                self.charge(budget)?;
                Ok(Rx::Skip)
            }
        }
    }

    fn charge(&self, budget: &mut ErrorBudget) -> Result<(), SessionError> {
        if budget.record_failure() {
            let errors = budget.consecutive();
            error!(errors, "error budget exhausted");
            return Err(SessionError::ErrorBudgetExhausted(errors));
        }
        Ok(())
    }

    fn accept_data<S: FrameSink>(
        &mut self,
        playout: &Mutex<Playout<S>>,
        arrivals: &mut Arrivals,
        src: u8,
        seq: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<(), SessionError> {
        arrivals.packets += 1;
        arrivals.per_source[src as usize] += 1;
        self.log_arrival(seq, now);

        let mut p = playout.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(e) = p.write_error.take() {
            return Err(e.into());
        }
        p.buffer.insert(seq, payload);
        Ok(())
    }

    fn log_arrival(&mut self, seq: u32, now: Instant) {
        let Some(log) = self.arrival_log.as_mut() else {
            return;
        };
        let ms = now.duration_since(self.started).as_millis();
        if let Err(e) = writeln!(log, "{ms} {seq}") {
            warn!(error = %e, "arrival log write failed, disabling it");
            self.arrival_log = None;
        }
    }

    fn push_splice(&self, ratios: &ArcSwap<[u8; SOURCE_COUNT]>, update: &SpliceUpdate) {
        let sent = broadcast(&self.socket, &Message::SpliceUpdate(*update), CLIENT_ID, &self.servers);
        ratios.store(Arc::new(update.ratios));
        debug!(sseq = update.sseq, ratios = ?update.ratios, sent, "splice update broadcast");
    }

    fn broadcast_fin(&self, times: usize) {
        for _ in 0..times {
            broadcast(&self.socket, &Message::Fin, CLIENT_ID, &self.servers);
        }
    }

    /// Tell the sources the session is over after a local failure.
    fn notify_failure(&self, e: &SessionError) {
        match e {
            SessionError::AllRefused(_) => {}
            SessionError::PeerTerminated(_) => self.broadcast_fin(1),
            _ => {
                broadcast(&self.socket, &Message::Fail, CLIENT_ID, &self.servers);
            }
        }
    }

    /// Final flush, close the sink and assemble the report.
    fn close<S: FrameSink>(
        &mut self,
        mut report: SessionReport,
        arrivals: Arrivals,
        playout: Arc<Mutex<Playout<S>>>,
        stream: Option<StreamInfo>,
        timer: TimerReport,
    ) -> Result<(SessionReport, S), SessionError> {
        let playout = Arc::try_unwrap(playout)
            .map_err(|_| SessionError::Internal("playout still shared at close"))?
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        let Playout {
            mut buffer,
            mut sink,
            write_error,
        } = playout;
        if let Some(e) = write_error {
            return Err(e.into());
        }
        buffer.flush(&mut sink)?;
        sink.finish(stream.map(|s| s.total_len))?;
        if let Some(log) = self.arrival_log.as_mut() {
            if let Err(e) = log.flush() {
                warn!(error = %e, "arrival log flush failed");
            }
        }

        report.packets_received = arrivals.packets;
        report.packets_per_source = arrivals.per_source;
        report.buffer = buffer.get_stats();
        report.naks_sent = timer.naks_sent;
        report.rate_changes = timer.rate_changes;
        if timer.final_rate_kbps > 0 {
            report.final_rate_kbps = timer.final_rate_kbps;
        }
        report.elapsed = Instant::now().duration_since(self.started);

        let missing = stream.map(|s| (s.total_packets as u64).saturating_sub(report.buffer.flushed));
        info!(
            state = ?report.state,
            received = report.packets_received,
            flushed = report.buffer.flushed,
            missing,
            naks = report.naks_sent,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "session closed"
        );
        Ok((report, sink))
    }
}
