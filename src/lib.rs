//! # Remora
//!
//! A leeching BitTorrent client: given a metainfo descriptor it contacts
//! the tracker, connects to remote peers over TCP, downloads and verifies
//! every piece of the described content, and writes the payload to local
//! storage.
//!
//! ## Subsystems
//!
//! - [`bencode`] / [`metainfo`]: descriptor parsing and the info digest
//! - [`tracker`]: HTTP announce and peer discovery
//! - [`handshake`] / [`message`] / [`client`]: the peer wire protocol
//! - [`worker`]: per-peer session state machine
//! - [`scheduler`]: piece/block selection, verification, request pipelining
//! - [`storage`]: single- and multi-file output
//! - [`coordinator`]: peer lifecycle and tit-for-tat choke control

#[macro_use]
extern crate log;

pub mod bencode;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod handshake;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod worker;
