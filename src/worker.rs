//! # Peer Session
//!
//! One thread per remote peer, driving the connection through its states:
//! Connecting, Handshaking, Ready, Closed.
//!
//! ## Session Loop
//!
//! A dedicated reader thread performs blocking framed reads and feeds an
//! inbound channel, so the session loop can select over inbound messages,
//! coordinator commands and a short housekeeping tick. Housekeeping fills
//! the request pipeline, enforces the per-request and idle timeouts, sends
//! keep-alives and services queued uploads.
//!
//! ## Accounting
//!
//! Payload bytes in both directions land in shared accumulators that the
//! coordinator drains on its 1 s tick to maintain per-peer rate estimates.
//! The session never computes rates itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::client::Connection;
use crate::error::{Error, Result, WireError};
use crate::message::Message;
use crate::metainfo::Metainfo;
use crate::peer::{Bitfield, PeerAddr, PeerFlags, PeerKey};
use crate::scheduler::{BlockRequest, Delivery, Scheduler, REQUEST_TIMEOUT};
use crate::storage::StorageWriter;

/// Maximum outstanding block requests per peer.
pub const MAX_PIPELINE_DEPTH: usize = 5;

/// Sent when the connection has been write-idle this long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Cadence of the housekeeping pass when the wire is quiet.
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(500);

/// Largest block length we are willing to serve.
const MAX_SERVED_BLOCK: u32 = 1 << 17;

/// Queued upload requests beyond this are dropped oldest-first.
const MAX_PENDING_UPLOADS: usize = 64;

/// Commands the coordinator sends down to a session.
#[derive(Debug, Clone, Copy)]
pub enum Command {
    Choke,
    Unchoke,
    Have(u32),
    Shutdown,
}

/// Why a session ended; the coordinator buckets these into counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Download complete (or nothing left for this peer to contribute).
    Finished,
    /// Coordinator asked us to stop.
    Shutdown,
    /// Handshake, framing or protocol-sequence violation.
    Wire,
    /// Request or idle timeout.
    Timeout,
    /// Connect failure or transport error.
    Io,
}

/// Session-to-coordinator notifications.
#[derive(Debug)]
pub enum Event {
    /// Handshake done, bitfield sent; the session is in its steady state.
    Ready { peer: PeerKey },
    /// A piece verified and was written; broadcast `have` to all sessions.
    PieceVerified { index: u32 },
    /// Writing a verified piece failed; the download cannot continue.
    OutputError { message: String },
    /// The session is gone, with its terminal reason.
    Closed { peer: PeerKey, reason: CloseReason },
}

/// Transfer accumulators and remote-interest flag shared with the
/// coordinator.
#[derive(Default)]
pub struct SessionStats {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    peer_interested: AtomicBool,
}

impl SessionStats {
    pub fn new() -> Arc<SessionStats> {
        Arc::new(SessionStats::default())
    }

    /// Drain the inbound payload accumulator (coordinator tick).
    pub fn take_downloaded(&self) -> u64 {
        self.downloaded.swap(0, Ordering::Relaxed)
    }

    /// Drain the outbound payload accumulator (coordinator tick).
    pub fn take_uploaded(&self) -> u64 {
        self.uploaded.swap(0, Ordering::Relaxed)
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }
}

/// Everything a session needs to run against one peer.
pub struct Worker {
    key: PeerKey,
    addr: PeerAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    meta: Arc<Metainfo>,
    scheduler: Arc<Mutex<Scheduler>>,
    storage: Arc<Mutex<StorageWriter>>,
    stats: Arc<SessionStats>,
    events: Sender<Event>,
    control: Receiver<Command>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: PeerKey,
        addr: PeerAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        meta: Arc<Metainfo>,
        scheduler: Arc<Mutex<Scheduler>>,
        storage: Arc<Mutex<StorageWriter>>,
        stats: Arc<SessionStats>,
        events: Sender<Event>,
        control: Receiver<Command>,
    ) -> Worker {
        Worker {
            key,
            addr,
            info_hash,
            peer_id,
            meta,
            scheduler,
            storage,
            stats,
            events,
            control,
        }
    }

    /// Drive the session to completion; always emits a `Closed` event.
    pub fn run(self) {
        let reason = match self.connect_and_serve() {
            Ok(reason) => reason,
            Err(error) => {
                debug!("session {} ({}) failed: {error}", self.key, self.addr);
                close_reason(&error)
            }
        };

        let _ = self.events.send(Event::Closed {
            peer: self.key,
            reason,
        });
    }

    fn connect_and_serve(&self) -> Result<CloseReason> {
        // Connecting -> Handshaking -> Ready
        let conn = Connection::establish(self.addr, &self.info_hash, &self.peer_id)?;
        info!("connected to peer {} ({})", self.key, self.addr);

        let mut session = Session {
            key: self.key,
            conn,
            flags: PeerFlags::default(),
            bitfield: Bitfield::new(self.meta.num_pieces()),
            registered: false,
            saw_first_message: false,
            in_flight: Vec::new(),
            pending_uploads: VecDeque::new(),
            last_sent: Instant::now(),
            meta: Arc::clone(&self.meta),
            scheduler: Arc::clone(&self.scheduler),
            storage: Arc::clone(&self.storage),
            stats: Arc::clone(&self.stats),
            events: self.events.clone(),
        };

        let result = session.serve(&self.control);
        session.teardown();
        result
    }
}

struct Session {
    key: PeerKey,
    conn: Connection,
    flags: PeerFlags,
    bitfield: Bitfield,
    /// Whether this bitfield has been folded into scheduler availability.
    registered: bool,
    saw_first_message: bool,
    in_flight: Vec<(BlockRequest, Instant)>,
    pending_uploads: VecDeque<BlockRequest>,
    last_sent: Instant,
    meta: Arc<Metainfo>,
    scheduler: Arc<Mutex<Scheduler>>,
    storage: Arc<Mutex<StorageWriter>>,
    stats: Arc<SessionStats>,
    events: Sender<Event>,
}

impl Session {
    fn serve(&mut self, control: &Receiver<Command>) -> Result<CloseReason> {
        // our bitfield goes out first, even when empty
        let ours = self.scheduler.lock().unwrap().have_bitfield();
        self.send(&Message::Bitfield(ours.to_bytes()))?;
        let _ = self.events.send(Event::Ready { peer: self.key });

        let inbound = self.spawn_reader()?;

        loop {
            crossbeam_channel::select! {
                recv(inbound) -> frame => match frame {
                    Ok(Ok(message)) => self.dispatch(message)?,
                    Ok(Err(error)) => return Err(reader_error(error)),
                    Err(_) => return Err(Error::PeerTimeout),
                },
                recv(control) -> command => match command {
                    Ok(Command::Shutdown) | Err(_) => return Ok(CloseReason::Shutdown),
                    Ok(command) => self.apply_command(command)?,
                },
                default(HOUSEKEEPING_TICK) => {}
            }

            if self.scheduler.lock().unwrap().is_complete() {
                return Ok(CloseReason::Finished);
            }
            self.housekeeping()?;
        }
    }

    /// Blocking framed reads on a clone of the stream; the channel carries
    /// messages until the first error, which also ends the thread.
    fn spawn_reader(&self) -> Result<Receiver<Result<Message>>> {
        let mut stream = self.conn.reader()?;
        let (tx, rx) = bounded::<Result<Message>>(MAX_PIPELINE_DEPTH * 2);

        thread::spawn(move || loop {
            let frame = Message::read_from(&mut stream);
            let failed = frame.is_err();
            if tx.send(frame).is_err() || failed {
                break;
            }
        });

        Ok(rx)
    }

    fn dispatch(&mut self, message: Message) -> Result<()> {
        let first = !self.saw_first_message;
        self.saw_first_message = true;

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                debug!("peer {} choked us", self.key);
                self.flags.peer_choking = true;
                // outstanding requests will not be answered; free the slots
                self.scheduler.lock().unwrap().release_requests(self.key);
                self.in_flight.clear();
            }
            Message::Unchoke => {
                debug!("peer {} unchoked us", self.key);
                self.flags.peer_choking = false;
            }
            Message::Interested => {
                self.stats.peer_interested.store(true, Ordering::Relaxed);
            }
            Message::NotInterested => {
                self.stats.peer_interested.store(false, Ordering::Relaxed);
            }
            Message::Have(index) => {
                if !self.bitfield.has(index) {
                    self.bitfield.set(index);
                    self.scheduler.lock().unwrap().peer_has(index);
                    // availability now tracks this peer, so teardown must
                    // subtract its bitfield
                    self.registered = true;
                }
                self.update_interest()?;
            }
            Message::Bitfield(payload) => {
                if !first {
                    return Err(WireError::ProtocolViolation(
                        "bitfield after first message".into(),
                    )
                    .into());
                }
                let field = Bitfield::from_payload(&payload, self.meta.num_pieces())?;
                self.bitfield = field;
                self.scheduler.lock().unwrap().peer_joined(&self.bitfield);
                self.registered = true;
                self.update_interest()?;
            }
            Message::Request { index, begin, length } => {
                self.enqueue_upload(index, begin, length);
            }
            Message::Piece { index, begin, block } => {
                self.receive_block(index, begin, block)?;
            }
            Message::Cancel { index, begin, length } => {
                self.pending_uploads
                    .retain(|r| !(r.index == index && r.begin == begin && r.length == length));
            }
            Message::Unknown(id) => {
                debug!("peer {} sent unknown message id {id}, discarded", self.key);
            }
        }

        Ok(())
    }

    fn receive_block(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<()> {
        self.stats
            .downloaded
            .fetch_add(block.len() as u64, Ordering::Relaxed);

        if let Some(position) = self.in_flight.iter().position(|(req, _)| {
            req.index == index && req.begin == begin && req.length as usize == block.len()
        }) {
            self.in_flight.swap_remove(position);
        }

        let outcome = {
            let mut scheduler = self.scheduler.lock().unwrap();
            scheduler.deliver(self.key, index, begin, block)
        };

        match outcome {
            Delivery::Accepted => {}
            Delivery::Verified { index, offset, data } => {
                // disk write happens outside the scheduler lock
                let written = self.storage.lock().unwrap().write_piece(offset, &data);
                if let Err(error) = written {
                    let _ = self.events.send(Event::OutputError {
                        message: error.to_string(),
                    });
                    return Err(error);
                }
                let _ = self.events.send(Event::PieceVerified { index });
                self.update_interest()?;
            }
            Delivery::Corrupt { index } => {
                debug!("peer {} delivered corrupt piece {index}", self.key);
            }
            Delivery::Duplicate | Delivery::Rejected => {
                debug!(
                    "peer {} sent unexpected block {index}+{begin}, dropped",
                    self.key
                );
            }
        }

        Ok(())
    }

    fn apply_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Choke => {
                if !self.flags.am_choking {
                    self.flags.am_choking = true;
                    self.pending_uploads.clear();
                    self.send(&Message::Choke)?;
                }
            }
            Command::Unchoke => {
                if self.flags.am_choking {
                    self.flags.am_choking = false;
                    self.send(&Message::Unchoke)?;
                }
            }
            Command::Have(index) => {
                self.send(&Message::Have(index))?;
            }
            Command::Shutdown => unreachable!("handled in serve"),
        }
        Ok(())
    }

    fn housekeeping(&mut self) -> Result<()> {
        let now = Instant::now();

        // a request outstanding past the timeout closes the whole session;
        // its slot is restored for other peers first
        if let Some((stale, _)) = self
            .in_flight
            .iter()
            .find(|(_, issued)| now.duration_since(*issued) > REQUEST_TIMEOUT)
            .copied()
        {
            warn!(
                "peer {} request for block {}+{} timed out",
                self.key, stale.index, stale.begin
            );
            let mut scheduler = self.scheduler.lock().unwrap();
            for (req, _) in &self.in_flight {
                scheduler.release_block(self.key, req.index, req.begin);
            }
            return Err(Error::PeerTimeout);
        }

        self.fill_pipeline(now)?;
        self.serve_uploads()?;

        if now.duration_since(self.last_sent) > KEEPALIVE_INTERVAL {
            self.send(&Message::KeepAlive)?;
        }

        Ok(())
    }

    /// Issue requests until the pipeline is full or the scheduler runs dry.
    fn fill_pipeline(&mut self, now: Instant) -> Result<()> {
        if self.flags.peer_choking || !self.flags.am_interested {
            return Ok(());
        }

        while self.in_flight.len() < MAX_PIPELINE_DEPTH {
            let next = {
                let mut scheduler = self.scheduler.lock().unwrap();
                scheduler.next_request(self.key, &self.bitfield, now)
            };
            let Some(request) = next else { break };

            self.send(&Message::Request {
                index: request.index,
                begin: request.begin,
                length: request.length,
            })?;
            self.in_flight.push((request, now));
        }

        Ok(())
    }

    fn enqueue_upload(&mut self, index: u32, begin: u32, length: u32) {
        // requests while choking are legal to ignore
        if self.flags.am_choking {
            return;
        }

        let valid = index < self.meta.num_pieces()
            && length > 0
            && length <= MAX_SERVED_BLOCK
            && begin.checked_add(length).is_some_and(|end| end <= self.meta.piece_len(index));
        if !valid {
            debug!("peer {} sent out-of-range request, ignored", self.key);
            return;
        }

        if self.pending_uploads.len() >= MAX_PENDING_UPLOADS {
            self.pending_uploads.pop_front();
        }
        self.pending_uploads.push_back(BlockRequest { index, begin, length });
    }

    /// Serve a bounded batch of queued uploads from verified pieces.
    fn serve_uploads(&mut self) -> Result<()> {
        for _ in 0..4 {
            let Some(request) = self.pending_uploads.pop_front() else {
                break;
            };

            let have = self
                .scheduler
                .lock()
                .unwrap()
                .have_bitfield()
                .has(request.index);
            if !have {
                continue;
            }

            let offset = self.meta.piece_offset(request.index) + request.begin as u64;
            let block = self
                .storage
                .lock()
                .unwrap()
                .read_block(offset, request.length as usize)?;

            self.send(&Message::Piece {
                index: request.index,
                begin: request.begin,
                block,
            })?;
            self.stats
                .uploaded
                .fetch_add(request.length as u64, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Declare or retract interest based on what the peer can still give us.
    fn update_interest(&mut self) -> Result<()> {
        let useful = self.scheduler.lock().unwrap().peer_is_useful(&self.bitfield);

        if useful && !self.flags.am_interested {
            self.flags.am_interested = true;
            self.send(&Message::Interested)?;
        } else if !useful && self.flags.am_interested {
            self.flags.am_interested = false;
            self.send(&Message::NotInterested)?;
        }

        Ok(())
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        self.conn.send(message)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Return this peer's footprint to the shared state and drop the link.
    fn teardown(&mut self) {
        let mut scheduler = self.scheduler.lock().unwrap();
        if self.registered {
            scheduler.peer_left(self.key, &self.bitfield);
        } else {
            scheduler.release_requests(self.key);
        }
        drop(scheduler);
        self.conn.close();
    }
}

/// Classify a terminal session error for the coordinator's counters.
fn close_reason(error: &Error) -> CloseReason {
    match error {
        Error::Wire(_) => CloseReason::Wire,
        Error::PeerTimeout => CloseReason::Timeout,
        _ => CloseReason::Io,
    }
}

/// Errors surfaced by the blocking reader; a read timeout there is the
/// 120 s idle timeout.
fn reader_error(error: Error) -> Error {
    match error {
        Error::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Error::PeerTimeout
        }
        other => other,
    }
}
