//! # Tracker Client
//!
//! Announces to the HTTP tracker and parses the peer list out of its
//! bencoded reply.
//!
//! ## Announce Request
//!
//! An announce is a GET on the tracker URL with `info_hash`, `peer_id`,
//! `port`, `uploaded`, `downloaded`, `left`, `compact=1` and an optional
//! `event` query parameter. The two 20-byte identifiers are raw binary, so
//! the query string is assembled by hand: every byte outside the RFC 3986
//! unreserved set is percent-escaped.
//!
//! ## Reply
//!
//! A bencoded dictionary with `interval` (seconds until re-announce) and
//! `peers`, either in compact form (6 bytes per peer) or as a list of
//! `{ip, port}` dictionaries. A `failure reason` key turns into a
//! [`Error::Tracker`] carrying the tracker's own message.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer::{parse_compact_peers, PeerAddr};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);
const PEER_ID_PREFIX: &[u8; 8] = b"-RM0001-";

/// Lifecycle events reported to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Transfer totals reported with every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A successful announce: peers plus the tracker's re-announce interval.
#[derive(Debug)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<PeerAddr>,
}

/// Generate our peer id: fixed client prefix plus 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

/// HTTP announce client for one swarm.
pub struct TrackerClient {
    trackers: Vec<String>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::blocking::Client,
}

impl TrackerClient {
    pub fn new(meta: &Metainfo, peer_id: [u8; 20], port: u16) -> Result<TrackerClient> {
        let http = reqwest::blocking::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .map_err(|e| Error::Tracker(format!("could not build http client: {e}")))?;

        Ok(TrackerClient {
            trackers: meta.trackers().to_vec(),
            info_hash: *meta.info_hash(),
            peer_id,
            port,
            http,
        })
    }

    /// Announce to the first tracker that answers, in declared order.
    pub fn announce(
        &self,
        progress: Progress,
        event: Option<AnnounceEvent>,
    ) -> Result<Announce> {
        let mut last_err = Error::Tracker("no tracker URLs".into());

        for tracker in &self.trackers {
            match self.announce_one(tracker, progress, event) {
                Ok(announce) => {
                    debug!(
                        "tracker {tracker} returned {} peers, interval {}s",
                        announce.peers.len(),
                        announce.interval.as_secs()
                    );
                    return Ok(announce);
                }
                Err(e) => {
                    warn!("tracker {tracker} failed: {e}");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    fn announce_one(
        &self,
        tracker: &str,
        progress: Progress,
        event: Option<AnnounceEvent>,
    ) -> Result<Announce> {
        let url = build_announce_url(
            tracker,
            &self.info_hash,
            &self.peer_id,
            self.port,
            progress,
            event,
        )?;

        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|e| Error::Tracker(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Tracker(format!("tracker answered {status}")));
        }

        let body = response
            .bytes()
            .map_err(|e| Error::Tracker(format!("could not read reply: {e}")))?;

        parse_announce_reply(&body)
    }
}

/// Assemble the announce URL, percent-escaping the binary identifiers.
fn build_announce_url(
    tracker: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    progress: Progress,
    event: Option<AnnounceEvent>,
) -> Result<String> {
    // validate early so a junk announce key fails as a tracker error
    Url::parse(tracker).map_err(|e| Error::Tracker(format!("bad tracker url {tracker}: {e}")))?;

    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode(info_hash),
        percent_encode(peer_id),
        port,
        progress.uploaded,
        progress.downloaded,
        progress.left,
    );
    if let Some(event) = event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }

    let separator = if tracker.contains('?') { '&' } else { '?' };
    Ok(format!("{tracker}{separator}{query}"))
}

/// Percent-escape every byte outside the RFC 3986 unreserved set.
fn percent_encode(data: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push(HEX[(byte >> 4) as usize] as char);
                encoded.push(HEX[(byte & 0x0f) as usize] as char);
            }
        }
    }

    encoded
}

/// Bencoded announce reply.
#[derive(Deserialize)]
struct TrackerReply {
    #[serde(default)]
    interval: Option<u64>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<ByteBuf>,
    #[serde(default)]
    peers: Option<PeerList>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeerList {
    /// Compact form: a byte string, 6 bytes per peer.
    Compact(ByteBuf),
    /// Dictionary form: one `{ip, port}` dict per peer.
    Dicts(Vec<DictPeer>),
}

#[derive(Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

fn parse_announce_reply(body: &[u8]) -> Result<Announce> {
    let reply: TrackerReply = de::from_bytes(body)
        .map_err(|e| Error::Tracker(format!("malformed reply: {e}")))?;

    if let Some(reason) = reply.failure_reason {
        return Err(Error::Tracker(format!(
            "tracker refused announce: {}",
            String::from_utf8_lossy(&reason)
        )));
    }

    let peers = match reply.peers {
        Some(PeerList::Compact(bytes)) => parse_compact_peers(&bytes)?,
        Some(PeerList::Dicts(dicts)) => dicts
            .into_iter()
            .filter_map(|peer| {
                peer.ip
                    .parse()
                    .ok()
                    .map(|ip| PeerAddr { ip, port: peer.port })
            })
            .collect(),
        None => Vec::new(),
    };

    let interval = Duration::from_secs(reply.interval.unwrap_or(1800));
    Ok(Announce { interval, peers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn escapes_every_reserved_byte() {
        assert_eq!(percent_encode(b"AZaz09-._~"), "AZaz09-._~");
        assert_eq!(percent_encode(&[0x00, 0x20, 0x7f, 0xff]), "%00%20%7F%FF");
        assert_eq!(percent_encode(b"a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn builds_announce_url_with_event() {
        let url = build_announce_url(
            "http://tracker.example/announce",
            &[0xab; 20],
            b"-RM0001-AAAABBBBCCCC",
            6881,
            Progress { uploaded: 1, downloaded: 2, left: 3 },
            Some(AnnounceEvent::Started),
        )
        .unwrap();

        assert!(url.starts_with("http://tracker.example/announce?info_hash=%AB"));
        assert!(url.contains("&peer_id=-RM0001-AAAABBBBCCCC"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=1&downloaded=2&left=3"));
        assert!(url.contains("&compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn appends_with_ampersand_when_url_has_a_query() {
        let url = build_announce_url(
            "http://tracker.example/announce?key=abc",
            &[0; 20],
            &[0; 20],
            6881,
            Progress::default(),
            None,
        )
        .unwrap();
        assert!(url.starts_with("http://tracker.example/announce?key=abc&info_hash="));
        assert!(!url.contains("event"));
    }

    #[test]
    fn parses_compact_reply() {
        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 1, 2, 3, 0, 80]);
        body.push(b'e');

        let announce = parse_announce_reply(&body).unwrap();
        assert_eq!(announce.interval, Duration::from_secs(900));
        assert_eq!(announce.peers.len(), 2);
        assert_eq!(announce.peers[0].ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(announce.peers[0].port, 6881);
    }

    #[test]
    fn parses_dictionary_reply() {
        let body = b"d8:intervali600e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip8:10.0.0.94:porti80eeee";
        let announce = parse_announce_reply(body).unwrap();
        assert_eq!(announce.peers.len(), 2);
        assert_eq!(announce.peers[1].port, 80);
    }

    #[test]
    fn surfaces_tracker_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        let err = parse_announce_reply(body).unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }

    #[test]
    fn peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);
        assert_ne!(generate_peer_id()[8..], id[8..]);
    }
}
