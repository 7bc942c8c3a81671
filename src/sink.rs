//! 报文出口：组装好（可能已加密）的报文发往这里
//!
//! 端点以 URL 表示:
//! - `udp://host:port`
//! - `unix:///path/to/socket`（数据报套接字）
//! - `memory:`（进程内缓冲，主要用于测试）

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, RttError};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("sink is closed")]
    Closed,

    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },
}

/// 接收组装好的报文的网络或进程间通道
pub trait PacketSink {
    fn send(&mut self, packet: &[u8]) -> std::result::Result<(), SinkError>;

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        Ok(())
    }
}

impl<S: PacketSink + ?Sized> PacketSink for Box<S> {
    fn send(&mut self, packet: &[u8]) -> std::result::Result<(), SinkError> {
        (**self).send(packet)
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        (**self).close()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    packets: Vec<Vec<u8>>,
    closed: bool,
}

/// 在内存中收集报文，克隆共享同一缓冲
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.state().packets.clone()
    }

    pub fn len(&self) -> usize {
        self.state().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().packets.is_empty()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().packets)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl PacketSink for MemorySink {
    fn send(&mut self, packet: &[u8]) -> std::result::Result<(), SinkError> {
        let mut state = self.state();
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.packets.push(packet.to_vec());
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        self.state().closed = true;
        Ok(())
    }
}

/// 连接到单个对端的非阻塞 UDP 出口
pub struct UdpSink {
    socket: mio::net::UdpSocket,
    peer: SocketAddr,
}

impl UdpSink {
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = mio::net::UdpSocket::bind(local)?;
        socket.connect(peer)?;
        info!("UDP sink {} -> {}", socket.local_addr()?, peer);
        Ok(Self { socket, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl PacketSink for UdpSink {
    fn send(&mut self, packet: &[u8]) -> std::result::Result<(), SinkError> {
        let written = self.socket.send(packet)?;
        if written != packet.len() {
            return Err(SinkError::ShortWrite {
                written,
                len: packet.len(),
            });
        }
        Ok(())
    }
}

/// 非阻塞 Unix 数据报出口
#[cfg(unix)]
pub struct UnixDatagramSink {
    socket: mio::net::UnixDatagram,
}

#[cfg(unix)]
impl UnixDatagramSink {
    pub fn connect(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let socket = mio::net::UnixDatagram::unbound()?;
        socket.connect(path.as_ref())?;
        info!("Unix datagram sink -> {}", path.as_ref().display());
        Ok(Self { socket })
    }
}

#[cfg(unix)]
impl PacketSink for UnixDatagramSink {
    fn send(&mut self, packet: &[u8]) -> std::result::Result<(), SinkError> {
        let written = self.socket.send(packet)?;
        if written != packet.len() {
            return Err(SinkError::ShortWrite {
                written,
                len: packet.len(),
            });
        }
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        self.socket.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

/// 按端点 URL 打开出口
pub fn open_sink(endpoint: &str) -> Result<Box<dyn PacketSink>> {
    let url = Url::parse(endpoint)
        .map_err(|e| RttError::invalid_config(format!("bad sink endpoint {endpoint:?}: {e}")))?;
    debug!("opening sink {}", url);

    match url.scheme() {
        "udp" => {
            let host = url
                .host_str()
                .ok_or_else(|| RttError::invalid_config(format!("{endpoint}: missing host")))?;
            let port = url
                .port()
                .ok_or_else(|| RttError::invalid_config(format!("{endpoint}: missing port")))?;
            let peer = (host.trim_matches(|c: char| c == '[' || c == ']'), port)
                .to_socket_addrs()
                .map_err(|e| RttError::invalid_config(format!("{endpoint}: {e}")))?
                .next()
                .ok_or_else(|| RttError::invalid_config(format!("{endpoint}: no address")))?;
            Ok(Box::new(UdpSink::connect(peer).map_err(SinkError::from)?))
        }
        #[cfg(unix)]
        "unix" => {
            if url.path().is_empty() {
                return Err(RttError::invalid_config(format!("{endpoint}: missing path")));
            }
            Ok(Box::new(UnixDatagramSink::connect(url.path()).map_err(SinkError::from)?))
        }
        "memory" => Ok(Box::new(MemorySink::new())),
        other => Err(RttError::invalid_config(format!(
            "unsupported sink scheme {other:?}"
        ))),
    }
}
