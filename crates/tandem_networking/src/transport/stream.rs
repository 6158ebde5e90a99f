//! Client end of a record connection.

use crate::error::{NetError, NetResult};
use crate::protocol::codec::{read_frame, read_preamble};
use crate::protocol::{Dictionary, Record};
use crate::transport::{RecordLink, SocketId, StatsCounters, TransportStats};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_shared::{ANY_NETWORK, DIAL_TIMEOUT, MIN_PORT};

/// A dialed TCP connection that has completed the preamble.
///
/// Reads and writes take separate locks, so one thread may block in
/// [`RecordStream::receive`] while another sends.
#[derive(Debug)]
pub struct RecordStream {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    dictionary: Dictionary,
    remote_socket_id: SocketId,
    peer: SocketAddr,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl RecordStream {
    /// Connects to `address:port` and reads the server's preamble.
    ///
    /// Rejects empty or `"NULL"` addresses and ports below 1000 without
    /// touching the network. Both the connect and the preamble wait are
    /// bounded by [`DIAL_TIMEOUT`], so a silent peer fails the dial.
    pub fn dial(address: &str, port: u16, small_packet_optimize: bool) -> NetResult<Self> {
        if address.is_empty() || address == ANY_NETWORK || port < MIN_PORT {
            return Err(NetError::InvalidAddress {
                address: address.to_owned(),
                port,
            });
        }
        let target = (address, port).to_socket_addrs()?.next().ok_or_else(|| NetError::InvalidAddress {
            address: address.to_owned(),
            port,
        })?;
        let stream = TcpStream::connect_timeout(&target, DIAL_TIMEOUT)?;
        stream.set_nodelay(small_packet_optimize)?;
        let peer = stream.peer_addr()?;
        let mut reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        reader.set_read_timeout(Some(DIAL_TIMEOUT))?;
        let (remote_socket_id, dictionary) = read_preamble(&mut reader)?;
        // Frame reads block until close() once connected.
        reader.set_read_timeout(None)?;
        tracing::debug!("Dialed {} as socket {} ({} templates)", peer, remote_socket_id, dictionary.len());

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            control,
            dictionary,
            remote_socket_id,
            peer,
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        })
    }

    /// Sends an already encoded frame.
    pub fn send_raw(&self, frame: &[u8]) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Disconnected);
        }
        let result = {
            let mut writer = self.writer.lock();
            writer.write_all(frame).map_err(NetError::from)
        };
        self.stats.record_send(&result, frame.len());
        result
    }

    /// Remote address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

impl RecordLink for RecordStream {
    fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    fn remote_socket_id(&self) -> SocketId {
        self.remote_socket_id
    }

    fn send(&self, record: &Record) -> NetResult<()> {
        let mut frame = Vec::with_capacity(record.encoded_len());
        record.encode(&mut frame);
        self.send_raw(&frame)
    }

    fn receive(&self, buffer: &mut Vec<u8>) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Disconnected);
        }
        let mut reader = self.reader.lock();
        read_frame(&mut *reader, buffer)?;
        self.stats.record_receive();
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Shutting down any handle wakes a reader blocked on another.
            if let Err(e) = self.control.shutdown(Shutdown::Both) {
                tracing::debug!("Shutdown of {} reported: {}", self.peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_rejects_bad_targets() {
        for (address, port) in [("", 5000), ("NULL", 5000), ("127.0.0.1", 80)] {
            match RecordStream::dial(address, port, true) {
                Err(NetError::InvalidAddress { .. }) => {}
                other => panic!("{address}:{port} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_dial_gives_up_on_silent_peer() {
        // Accepted by the kernel backlog, but nothing is ever written.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let started = std::time::Instant::now();
        let result = RecordStream::dial("127.0.0.1", port, true);
        assert!(matches!(result, Err(NetError::Io(_))), "{result:?}");
        assert!(started.elapsed() < DIAL_TIMEOUT * 3);
        drop(listener);
    }
}
