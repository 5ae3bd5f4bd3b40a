//! # Download Coordinator
//!
//! Owns the peer set and drives the download: obtains peers from the
//! tracker, spawns one session per peer, samples transfer rates on a 1 s
//! tick, and runs the choke policy.
//!
//! ## Choke Policy
//!
//! Every tenth tick is a choke round: interested peers are ranked by their
//! download-rate estimate and the top four are unchoked, everyone else is
//! choked. Every third round one currently-choked interested peer is drawn
//! uniformly at random and takes the fourth slot, so the ranking keeps
//! exploring beyond its initial sample. Reciprocation concentrates upload
//! capacity on peers that verifiably send us data; the random slot keeps
//! the set from freezing.
//!
//! ## Peer Lifecycle
//!
//! Sessions that die are replaced from the remaining tracker list; when the
//! list runs out the coordinator re-announces, with exponential backoff on
//! announce failures. Peer failures never abort the download while another
//! peer remains and a piece is still missing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer::{PeerAddr, PeerKey};
use crate::scheduler::Scheduler;
use crate::storage::StorageWriter;
use crate::tracker::{AnnounceEvent, Progress, TrackerClient};
use crate::worker::{CloseReason, Command, Event, SessionStats, Worker};

/// Concurrent peer sessions.
const MAX_SESSIONS: usize = 5;

/// Peers taken from one tracker reply.
const MAX_TRACKER_PEERS: usize = 50;

/// Peers unchoked by the reciprocation ranking.
const UNCHOKE_SLOTS: usize = 4;

/// Ticks per choke round (1 s tick, 10 s round).
const TICKS_PER_CHOKE_ROUND: u64 = 10;

/// Choke rounds per optimistic override (30 s).
const ROUNDS_PER_OPTIMISTIC: u64 = 3;

/// EWMA weight of the newest 1 s rate sample.
const RATE_ALPHA: f64 = 0.2;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ANNOUNCE_RETRIES: u32 = 5;

/// Final accounting shown after the download ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadSummary {
    pub pieces_completed: u32,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub wasted_bytes: u64,
    pub verification_failures: u64,
    pub wire_errors: u64,
    pub timeout_errors: u64,
    pub io_errors: u64,
}

/// Coordinator-owned state for one live session.
struct PeerRecord {
    addr: PeerAddr,
    stats: Arc<SessionStats>,
    control: Sender<Command>,
    /// Session reached its steady state (handshake + bitfield done).
    ready: bool,
    /// Our side of the choke state; new peers start choked.
    am_choking: bool,
    download_rate: f64,
    upload_rate: f64,
}

/// Multi-peer orchestrator for one download.
pub struct Coordinator {
    meta: Arc<Metainfo>,
    scheduler: Arc<Mutex<Scheduler>>,
    storage: Arc<Mutex<StorageWriter>>,
    tracker: TrackerClient,
    peer_id: [u8; 20],

    candidates: VecDeque<PeerAddr>,
    /// Every address ever handed to us, for dedup across announces.
    known: HashSet<PeerAddr>,
    sessions: HashMap<PeerKey, PeerRecord>,
    next_key: PeerKey,

    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,

    announce_backoff: Duration,
    announce_failures: u32,
    next_announce_at: Instant,

    uploaded_total: u64,
    wire_errors: u64,
    timeout_errors: u64,
    io_errors: u64,
}

impl Coordinator {
    pub fn new(
        meta: Arc<Metainfo>,
        scheduler: Arc<Mutex<Scheduler>>,
        storage: Arc<Mutex<StorageWriter>>,
        tracker: TrackerClient,
        peer_id: [u8; 20],
    ) -> Coordinator {
        let (events_tx, events_rx) = unbounded();

        Coordinator {
            meta,
            scheduler,
            storage,
            tracker,
            peer_id,
            candidates: VecDeque::new(),
            known: HashSet::new(),
            sessions: HashMap::new(),
            next_key: 0,
            events_tx,
            events_rx,
            announce_backoff: BACKOFF_INITIAL,
            announce_failures: 0,
            next_announce_at: Instant::now(),
            uploaded_total: 0,
            wire_errors: 0,
            timeout_errors: 0,
            io_errors: 0,
        }
    }

    /// Run the download to completion (or terminal failure).
    pub fn run(mut self) -> Result<DownloadSummary> {
        self.announce_started()?;
        self.spawn_sessions();

        let progress = self.make_progress_bar();
        let ticker = crossbeam_channel::tick(Duration::from_secs(1));
        let events = self.events_rx.clone();
        let mut tick: u64 = 0;

        loop {
            crossbeam_channel::select! {
                recv(events) -> event => match event {
                    Ok(event) => {
                        if let Some(fatal) = self.handle_event(event, &progress)? {
                            return Err(fatal);
                        }
                    }
                    Err(_) => unreachable!("coordinator holds an event sender"),
                },
                recv(ticker) -> _ => {
                    tick += 1;
                    self.sample_rates();
                    if tick % TICKS_PER_CHOKE_ROUND == 0 {
                        let round = tick / TICKS_PER_CHOKE_ROUND;
                        self.choke_round(round % ROUNDS_PER_OPTIMISTIC == 0);
                    }
                    self.update_progress(&progress);
                    self.replenish_peers()?;
                }
            }

            if self.scheduler.lock().unwrap().is_complete() {
                progress.finish_with_message("complete");
                return self.finish();
            }
        }
    }

    /// Startup announce with exponential backoff; no peers at all is fatal.
    fn announce_started(&mut self) -> Result<()> {
        let mut backoff = BACKOFF_INITIAL;

        for attempt in 1..=MAX_ANNOUNCE_RETRIES {
            match self.tracker.announce(self.progress_report(), Some(AnnounceEvent::Started)) {
                Ok(announce) => {
                    self.next_announce_at = Instant::now() + announce.interval;
                    self.absorb_peers(announce.peers);
                    if self.candidates.is_empty() {
                        return Err(Error::Tracker("tracker returned no peers".into()));
                    }
                    info!("tracker returned {} candidate peers", self.candidates.len());
                    return Ok(());
                }
                Err(e) if attempt < MAX_ANNOUNCE_RETRIES => {
                    warn!("announce attempt {attempt} failed: {e}, retrying in {backoff:?}");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("loop returns on success or final failure")
    }

    fn absorb_peers(&mut self, peers: Vec<PeerAddr>) {
        for addr in peers.into_iter().take(MAX_TRACKER_PEERS) {
            if self.known.insert(addr) {
                self.candidates.push_back(addr);
            }
        }
    }

    /// Open sessions until the connection budget or candidate list runs out.
    fn spawn_sessions(&mut self) {
        while self.sessions.len() < MAX_SESSIONS {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };

            let key = self.next_key;
            self.next_key += 1;

            let stats = SessionStats::new();
            let (control_tx, control_rx) = bounded(16);

            let worker = Worker::new(
                key,
                addr,
                *self.meta.info_hash(),
                self.peer_id,
                Arc::clone(&self.meta),
                Arc::clone(&self.scheduler),
                Arc::clone(&self.storage),
                Arc::clone(&stats),
                self.events_tx.clone(),
                control_rx,
            );

            // record first: the session may emit events immediately
            self.sessions.insert(
                key,
                PeerRecord {
                    addr,
                    stats,
                    control: control_tx,
                    ready: false,
                    am_choking: true,
                    download_rate: 0.0,
                    upload_rate: 0.0,
                },
            );
            thread::spawn(move || worker.run());
        }
    }

    /// React to one session event; `Some(error)` aborts the download.
    fn handle_event(&mut self, event: Event, progress: &ProgressBar) -> Result<Option<Error>> {
        match event {
            Event::Ready { peer } => {
                if let Some(record) = self.sessions.get_mut(&peer) {
                    record.ready = true;
                }
            }
            Event::PieceVerified { index } => {
                for record in self.sessions.values() {
                    let _ = record.control.try_send(Command::Have(index));
                }
                self.update_progress(progress);
            }
            Event::OutputError { message } => {
                error!("output write failed: {message}");
                self.shutdown_sessions();
                return Ok(Some(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    message,
                ))));
            }
            Event::Closed { peer, reason } => {
                if let Some(record) = self.sessions.remove(&peer) {
                    debug!("session {peer} ({}) closed: {reason:?}", record.addr);
                }
                match reason {
                    CloseReason::Wire => self.wire_errors += 1,
                    CloseReason::Timeout => self.timeout_errors += 1,
                    CloseReason::Io => self.io_errors += 1,
                    CloseReason::Finished | CloseReason::Shutdown => {}
                }
                self.replenish_peers()?;
            }
        }
        Ok(None)
    }

    /// Keep the session budget filled; re-announce when the list is dry.
    fn replenish_peers(&mut self) -> Result<()> {
        if self.scheduler.lock().unwrap().is_complete() {
            return Ok(());
        }

        self.spawn_sessions();
        if !self.sessions.is_empty() && !self.candidates.is_empty() {
            return Ok(());
        }

        // periodic or exhaustion-driven re-announce, backoff-gated
        let now = Instant::now();
        let exhausted = self.sessions.is_empty() && self.candidates.is_empty();
        if !exhausted && now < self.next_announce_at {
            return Ok(());
        }
        if exhausted && now < self.next_announce_at && self.announce_failures > 0 {
            return Ok(());
        }

        match self.tracker.announce(self.progress_report(), None) {
            Ok(announce) => {
                self.announce_backoff = BACKOFF_INITIAL;
                self.announce_failures = 0;
                self.next_announce_at = now + announce.interval;
                self.absorb_peers(announce.peers);
                self.spawn_sessions();
            }
            Err(e) => {
                self.announce_failures += 1;
                warn!(
                    "re-announce failed ({} attempts): {e}",
                    self.announce_failures
                );
                self.next_announce_at = now + self.announce_backoff;
                self.announce_backoff = (self.announce_backoff * 2).min(BACKOFF_CAP);
            }
        }

        if self.sessions.is_empty() && self.candidates.is_empty() {
            let starved = self.announce_failures >= MAX_ANNOUNCE_RETRIES
                || self.announce_failures == 0;
            if starved {
                return Err(Error::PeersExhausted);
            }
        }

        Ok(())
    }

    /// Fold each session's 1 s byte counts into its rate estimates.
    fn sample_rates(&mut self) {
        for record in self.sessions.values_mut() {
            let down = record.stats.take_downloaded() as f64;
            let up = record.stats.take_uploaded() as f64;
            record.download_rate = RATE_ALPHA * down + (1.0 - RATE_ALPHA) * record.download_rate;
            record.upload_rate = RATE_ALPHA * up + (1.0 - RATE_ALPHA) * record.upload_rate;
            self.uploaded_total += up as u64;
        }
    }

    /// One choke round: unchoke the top ranked interested peers, optionally
    /// giving the last slot to a random currently-choked one.
    fn choke_round(&mut self, optimistic: bool) {
        let interested: Vec<(PeerKey, f64)> = self
            .sessions
            .iter()
            .filter(|(_, r)| r.ready && r.stats.peer_interested())
            .map(|(key, r)| (*key, r.download_rate))
            .collect();
        let currently_choked: HashSet<PeerKey> = self
            .sessions
            .iter()
            .filter(|(_, r)| r.am_choking)
            .map(|(key, _)| *key)
            .collect();

        let unchoke = select_unchoked(&interested, &currently_choked, optimistic);

        for (key, record) in self.sessions.iter_mut() {
            let should_unchoke = unchoke.contains(key);
            if should_unchoke && record.am_choking {
                record.am_choking = false;
                let _ = record.control.try_send(Command::Unchoke);
            } else if !should_unchoke && !record.am_choking {
                record.am_choking = true;
                let _ = record.control.try_send(Command::Choke);
            }
        }
    }

    fn make_progress_bar(&self) -> ProgressBar {
        let wanted = self.scheduler.lock().unwrap().wanted_pieces();
        let bar = ProgressBar::new(wanted as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {pos}/{len} pieces [{bar:40.cyan/blue}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar
    }

    fn update_progress(&self, progress: &ProgressBar) {
        let have = self.scheduler.lock().unwrap().have_count();
        let down: f64 = self.sessions.values().map(|r| r.download_rate).sum();
        let up: f64 = self.sessions.values().map(|r| r.upload_rate).sum();
        let active = self.sessions.values().filter(|r| r.ready).count();
        progress.set_position(have as u64);
        progress.set_message(format!(
            "down {:.1} KiB/s, up {:.1} KiB/s, {active} peers",
            down / 1024.0,
            up / 1024.0
        ));
    }

    fn progress_report(&self) -> Progress {
        let scheduler = self.scheduler.lock().unwrap();
        let stats = scheduler.stats();
        Progress {
            uploaded: self.uploaded_total,
            downloaded: stats.downloaded_bytes,
            left: scheduler.bytes_left(),
        }
    }

    fn shutdown_sessions(&mut self) {
        for record in self.sessions.values() {
            let _ = record.control.try_send(Command::Shutdown);
        }

        // wait briefly for sessions to report in; they poll every 500 ms
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.sessions.is_empty() && Instant::now() < deadline {
            match self.events_rx.recv_deadline(deadline) {
                Ok(Event::Closed { peer, .. }) => {
                    self.sessions.remove(&peer);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    /// Completion path: stop sessions, flush storage, tell the tracker.
    fn finish(mut self) -> Result<DownloadSummary> {
        self.shutdown_sessions();
        self.storage.lock().unwrap().sync()?;

        let report = self.progress_report();
        if let Err(e) = self
            .tracker
            .announce(report, Some(AnnounceEvent::Completed))
        {
            debug!("completed announce failed: {e}");
        }

        let scheduler = self.scheduler.lock().unwrap();
        let stats = scheduler.stats();
        Ok(DownloadSummary {
            pieces_completed: scheduler.have_count(),
            downloaded_bytes: stats.downloaded_bytes,
            uploaded_bytes: self.uploaded_total,
            wasted_bytes: stats.wasted_bytes,
            verification_failures: stats.verification_failures,
            wire_errors: self.wire_errors,
            timeout_errors: self.timeout_errors,
            io_errors: self.io_errors,
        })
    }
}

/// Choke-round selection, separated from session plumbing.
///
/// Ranks interested peers by rate (descending, ties to the lower key) and
/// unchokes the top [`UNCHOKE_SLOTS`]. When `optimistic` is set and more
/// than [`UNCHOKE_SLOTS`] peers are interested, the final slot goes to one
/// currently-choked peer drawn uniformly at random instead of the fourth
/// ranked. With [`UNCHOKE_SLOTS`] or fewer interested peers everyone is
/// unchoked and the override is skipped.
fn select_unchoked(
    interested: &[(PeerKey, f64)],
    currently_choked: &HashSet<PeerKey>,
    optimistic: bool,
) -> Vec<PeerKey> {
    let mut ranked: Vec<(PeerKey, f64)> = interested.to_vec();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    if ranked.len() <= UNCHOKE_SLOTS {
        return ranked.into_iter().map(|(key, _)| key).collect();
    }

    let mut unchoke: Vec<PeerKey> = ranked[..UNCHOKE_SLOTS].iter().map(|(k, _)| *k).collect();

    if optimistic {
        let top = &unchoke[..UNCHOKE_SLOTS - 1];
        let pool: Vec<PeerKey> = ranked
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| !top.contains(key) && currently_choked.contains(key))
            .collect();

        if let Some(lucky) = pool.choose(&mut rand::thread_rng()) {
            debug!("optimistic unchoke: peer {lucky}");
            unchoke.truncate(UNCHOKE_SLOTS - 1);
            unchoke.push(*lucky);
        }
    }

    unchoke
}
