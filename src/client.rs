//! # Peer Connection
//!
//! One TCP connection to a remote peer: dial, exchange the opening
//! handshake, then send and receive framed wire messages.
//!
//! The connection enforces the handshake timeout and validates the remote's
//! info digest before any post-handshake byte is exchanged. Message I/O is
//! split so the session can run a dedicated blocking reader: the read half
//! carries the peer's idle timeout, while writes keep a short timeout of
//! their own.

use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::message::Message;
use crate::peer::PeerAddr;

/// TCP connect plus handshake window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// No inbound bytes for this long means the peer is gone.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// An established, handshaken connection to one remote peer.
pub struct Connection {
    peer: PeerAddr,
    stream: TcpStream,
    remote_peer_id: [u8; 20],
}

impl Connection {
    /// Dial `peer` as the initiator and complete the handshake.
    ///
    /// Fails with `HandshakeMismatch` if the remote speaks a different
    /// protocol or belongs to a different swarm, and with `Io` on connect
    /// or handshake timeout.
    pub fn establish(
        peer: PeerAddr,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<Connection> {
        let stream = TcpStream::connect_timeout(&peer.socket_addr(), HANDSHAKE_TIMEOUT)
            .map_err(Error::Io)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(Error::Io)?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(Error::Io)?;

        let mut stream = stream;
        Handshake::new(*info_hash, *peer_id).write_to(&mut stream)?;
        let remote = Handshake::read_from(&mut stream, info_hash)?;

        // steady state: reads bound the peer idle timeout
        stream
            .set_read_timeout(Some(IDLE_TIMEOUT))
            .map_err(Error::Io)?;

        debug!("handshake complete with {peer}");

        Ok(Connection {
            peer,
            stream,
            remote_peer_id: remote.peer_id,
        })
    }

    /// Accept an inbound stream as the responder and complete the handshake.
    ///
    /// The remote's digest is validated before our handshake is sent, so a
    /// foreign swarm never sees our reply.
    pub fn accept(
        stream: TcpStream,
        peer: PeerAddr,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<Connection> {
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(Error::Io)?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(Error::Io)?;

        let mut stream = stream;
        let remote = Handshake::read_from(&mut stream, info_hash)?;
        Handshake::new(*info_hash, *peer_id).write_to(&mut stream)?;

        stream
            .set_read_timeout(Some(IDLE_TIMEOUT))
            .map_err(Error::Io)?;

        Ok(Connection {
            peer,
            stream,
            remote_peer_id: remote.peer_id,
        })
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn remote_peer_id(&self) -> &[u8; 20] {
        &self.remote_peer_id
    }

    /// Clone the stream handle for a dedicated blocking reader.
    pub fn reader(&self) -> Result<TcpStream> {
        self.stream.try_clone().map_err(Error::Io)
    }

    /// Send one framed message.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        message.write_to(&mut self.stream)
    }

    /// Receive one framed message, blocking up to the read timeout.
    pub fn recv(&mut self) -> Result<Message> {
        Message::read_from(&mut self.stream)
    }

    /// Tear the connection down; any blocked reader unblocks with an error.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::thread;

    fn local_peer(port: u16) -> PeerAddr {
        PeerAddr {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    #[test]
    fn initiator_and_responder_reach_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = thread::spawn(move || {
            let (stream, addr) = listener.accept().unwrap();
            let peer = PeerAddr { ip: addr.ip(), port: addr.port() };
            Connection::accept(stream, peer, &[5; 20], &[2; 20])
        });

        let mut local =
            Connection::establish(local_peer(port), &[5; 20], &[1; 20]).unwrap();
        let mut remote = remote.join().unwrap().unwrap();

        assert_eq!(local.remote_peer_id(), &[2; 20]);
        assert_eq!(remote.remote_peer_id(), &[1; 20]);

        // post-handshake traffic flows both ways
        local.send(&Message::Interested).unwrap();
        assert_eq!(remote.recv().unwrap(), Message::Interested);
        remote.send(&Message::Unchoke).unwrap();
        assert_eq!(local.recv().unwrap(), Message::Unchoke);
    }

    #[test]
    fn digest_mismatch_closes_both_sides_without_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = thread::spawn(move || {
            let (stream, addr) = listener.accept().unwrap();
            let peer = PeerAddr { ip: addr.ip(), port: addr.port() };
            Connection::accept(stream, peer, &[5; 20], &[2; 20])
        });

        // initiator announces a different swarm
        let local = Connection::establish(local_peer(port), &[6; 20], &[1; 20]);
        let remote = remote.join().unwrap();

        assert!(matches!(
            remote,
            Err(Error::Wire(WireError::HandshakeMismatch))
        ));
        // responder never replied, so the initiator fails too (mismatch on
        // the reply digest or a closed stream)
        assert!(local.is_err());
    }
}
