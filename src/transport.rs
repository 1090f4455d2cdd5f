use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use log::trace;

use crate::Error;

/// Blocking datagram transport boundary.
///
/// The engine owns exactly one transport per run, so implementations need
/// no internal synchronization. A receive that produces no datagram within
/// `timeout` must return [`Error::Timeout`]; every other failure maps to
/// [`Error::Io`].
pub trait Transport {
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<(), Error>;

    fn receive_datagram(&mut self, timeout: Duration) -> Result<Vec<u8>, Error>;
}

/// [`Transport`] over a connected UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind a local socket and connect it to the peer.
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(local).map_err(|e| Error::Io(e.to_string()))?;
        socket.connect(peer).map_err(|e| Error::Io(e.to_string()))?;

        Ok(UdpTransport {
            socket,
            // Largest datagram the engine will ever accept.
            recv_buf: vec![0; 65535],
        })
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        UdpTransport {
            socket,
            recv_buf: vec![0; 65535],
        }
    }
}

impl Transport for UdpTransport {
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<(), Error> {
        trace!("Sending datagram of {} bytes", datagram.len());
        self.socket
            .send(datagram)
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }

    fn receive_datagram(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        // set_read_timeout rejects a zero duration.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::Io(e.to_string()))?;

        match self.socket.recv(&mut self.recv_buf) {
            Ok(n) => {
                trace!("Received datagram of {} bytes", n);
                Ok(self.recv_buf[..n].to_vec())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Err(Error::Timeout)
            }
            Err(e) => Err(Error::Io(e.to_string())),
        }
    }
}
