//! Socket plumbing behind small traits so the protocol layers can be driven by in-memory
//! fakes in tests. The tokio sockets are used through their `try_*` calls, which keeps
//! the feed loop cooperative while readiness still comes from the runtime's reactor.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

/// Connection-oriented writes are buffered up to this many bytes before the peer is
/// treated as a slow consumer.
pub const MAX_PENDING_BYTES: usize = 1 << 20;

/// Fire-and-forget datagram destination.
pub trait DatagramSink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
    Data(usize),
    /// Nothing ready right now.
    Idle,
    Closed,
}

pub trait Connection {
    fn peer(&self) -> String;
    /// Queues `bytes` and writes as much as the socket accepts without blocking.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive>;
    /// Retries queued bytes; called once per loop iteration.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn close(&mut self);
}

pub trait Acceptor {
    type Conn: Connection;
    /// `Ok(None)` when no connection is waiting.
    fn accept(&mut self) -> io::Result<Option<Self::Conn>>;
}

pub struct UdpSink {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpSink {
    /// Binds and waits until the socket is writable, so the first datagram is not lost to
    /// an unpolled reactor.
    pub async fn bind(local: SocketAddr, destination: SocketAddr, multicast_ttl: u32) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        if let SocketAddr::V4(v4) = destination {
            if v4.ip().is_multicast() {
                socket.set_multicast_ttl_v4(multicast_ttl)?;
                socket.set_multicast_loop_v4(true)?;
            }
        }
        socket.writable().await?;
        info!(%local, %destination, "UDP sink ready");
        Ok(UdpSink { socket, destination })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

impl DatagramSink for UdpSink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let sent = self.socket.try_send_to(bytes, self.destination)?;
        if sent != bytes.len() {
            return Err(io::Error::new(ErrorKind::WriteZero, "datagram truncated"));
        }
        Ok(())
    }
}

/// Discards everything; stands in for a disabled channel.
#[derive(Debug, Default)]
pub struct NullSink;

impl DatagramSink for NullSink {
    fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "TCP acceptor listening");
        Ok(TcpAcceptor { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Acceptor for TcpAcceptor {
    type Conn = TcpConnection;

    fn accept(&mut self) -> io::Result<Option<TcpConnection>> {
        // The loop polls again on its next iteration, so nobody needs waking.
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.listener.poll_accept(&mut cx) {
            Poll::Ready(Ok((stream, peer))) => {
                stream.set_nodelay(true)?;
                debug!(%peer, "Accepted connection");
                Ok(Some(TcpConnection { stream: Some(stream), peer, pending: Vec::new() }))
            }
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(None),
        }
    }
}

pub struct TcpConnection {
    /// `None` once closed.
    stream: Option<TcpStream>,
    peer: SocketAddr,
    pending: Vec<u8>,
}

impl TcpConnection {
    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection closed"));
        }
        if self.pending.len() + bytes.len() > MAX_PENDING_BYTES {
            return Err(io::Error::new(ErrorKind::OutOfMemory, "peer is not draining its socket"));
        }
        self.pending.extend_from_slice(bytes);
        self.flush()
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive> {
        let Some(stream) = &self.stream else {
            return Ok(Receive::Closed);
        };
        match stream.try_read(buf) {
            Ok(0) => Ok(Receive::Closed),
            Ok(n) => Ok(Receive::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Receive::Idle),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Receive::Idle),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        while !self.pending.is_empty() {
            match stream.try_write(&self.pending) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket accepted no bytes")),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.flush() {
            debug!(peer = %self.peer, error = %e, "Dropping unsent bytes on close");
        }
        if let Some(stream) = self.stream.take() {
            // Deregisters from the reactor; the std handle shuts down synchronously.
            if let Ok(std_stream) = stream.into_std() {
                let _ = std_stream.shutdown(std::net::Shutdown::Both);
            }
        }
        self.pending.clear();
        debug!(peer = %self.peer, "Closed connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{sleep, timeout, Instant};

    #[tokio::test]
    async fn test_tcp_round_trip_non_blocking() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert!(acceptor.accept().unwrap().is_none());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut conn = loop {
            if let Some(conn) = acceptor.accept().unwrap() {
                break conn;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            sleep(Duration::from_millis(5)).await;
        };

        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf).unwrap(), Receive::Idle);

        client.write_all(b"ping").await.unwrap();
        let n = loop {
            if let Receive::Data(n) = conn.receive(&mut buf).unwrap() {
                break n;
            }
            assert!(Instant::now() < deadline, "no data received");
            sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(&buf[..n], b"ping");

        conn.send(b"pong").unwrap();
        while conn.pending_len() > 0 {
            assert!(Instant::now() < deadline, "reply never left the queue");
            sleep(Duration::from_millis(5)).await;
            conn.flush().unwrap();
        }
        let mut reply = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(&reply, b"pong");

        conn.close();
        assert_eq!(conn.receive(&mut buf).unwrap(), Receive::Closed);
        assert!(conn.send(b"late").is_err());
    }

    #[tokio::test]
    async fn test_udp_sink_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination = receiver.local_addr().unwrap();
        let mut sink = UdpSink::bind("127.0.0.1:0".parse().unwrap(), destination, 1).await.unwrap();
        sink.send(b"packet").unwrap();
        let mut buf = [0u8; 32];
        let n = timeout(Duration::from_secs(5), receiver.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"packet");
    }
}
