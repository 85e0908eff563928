use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use super::Listener;
use crate::{DistributionConfig, Result, StateSyncError};

/// Large enough for any UDP datagram, so oversize packets arrive whole and can
/// be rejected instead of silently truncated.
const RECV_BUFFER_SIZE: usize = 65_535;
/// How often the receive thread checks for a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(super) fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    (address, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("`{address}` did not resolve to any socket address"),
        )
    })
}

pub(super) fn bind_listener(config: &DistributionConfig) -> Result<UdpSocket> {
    resolve(&config.address, config.port)
        .and_then(UdpSocket::bind)
        .map_err(|source| StateSyncError::Bind {
            address: config.address.clone(),
            port: config.port,
            source,
        })
}

/// Unconnected socket able to reach `config.address:config.port`, including
/// broadcast addresses.
pub(super) fn open_sender(config: &DistributionConfig) -> Result<(UdpSocket, SocketAddr)> {
    let target = resolve(&config.address, config.port)?;
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local)?;
    socket.set_broadcast(true)?;
    Ok((socket, target))
}

/// Background receive loop feeding every datagram to a callback.
#[derive(Debug)]
pub(super) struct UdpListener {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl UdpListener {
    pub(super) fn spawn<F>(socket: UdpSocket, name: &str, mut on_datagram: F) -> Result<Self>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let worker = thread::Builder::new().name(name.to_string()).spawn({
            let stop = stop.clone();
            move || {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                while !stop.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, peer)) => {
                            trace!(%peer, len, "datagram received");
                            on_datagram(&buf[..len]);
                        }
                        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(err) => {
                            debug!(error = %err, "receive failed");
                            thread::sleep(POLL_INTERVAL);
                        }
                    }
                }
            }
        })?;

        Ok(Self {
            local_addr,
            stop,
            worker: Some(worker),
        })
    }
}

impl Listener for UdpListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!(addr = %self.local_addr, "receive thread panicked");
            }
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.stop();
    }
}
