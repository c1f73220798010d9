//! TCP (and TLS) transport for cache server connections
//!
//! Frames are written with a 4-byte big-endian length prefix. A handshake
//! frame announcing the channel kind is exchanged right after connecting.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::connection::{Connection, ConnectionFactory, Interrupt};
use crate::config::{ClientConfig, ServerLocation, TlsConfig};
use crate::protocol::codec;
use crate::protocol::{ChannelKind, Handshake};
use crate::utils::ConnectionError;

/// Frames larger than this are rejected as corrupt
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Byte stream under a connection
///
/// For TCP, we split into separate reader/writer.
/// For TLS, we use a single stream since native-tls doesn't support cloning.
enum Transport {
    Tcp {
        writer: BufWriter<TcpStream>,
        reader: BufReader<TcpStream>,
    },
    #[cfg(feature = "native-tls-backend")]
    NativeTls {
        stream: native_tls::TlsStream<TcpStream>,
    },
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Tcp { reader, .. } => reader.get_ref(),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream } => stream.get_ref(),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let len = (frame.len() as u32).to_be_bytes();
        match self {
            Transport::Tcp { writer, .. } => {
                writer.write_all(&len)?;
                writer.write_all(frame)?;
                writer.flush()
            }
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream } => {
                stream.write_all(&len)?;
                stream.write_all(frame)?;
                stream.flush()
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Transport::Tcp { reader, .. } => reader.read_exact(buf),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream } => stream.read_exact(buf),
        }
    }

    fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header)?;
        self.read_body(header)
    }

    fn read_body(&mut self, header: [u8; 4]) -> io::Result<Vec<u8>> {
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame of {} bytes exceeds limit", len),
            ));
        }
        let mut body = vec![0u8; len];
        self.read_exact(&mut body)?;
        Ok(body)
    }
}

/// Connection over TCP or TLS
pub struct TcpConnection {
    endpoint: String,
    transport: Transport,
    handshake: Handshake,
    closed: bool,
}

impl TcpConnection {
    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.transport.socket().set_read_timeout(Some(timeout))
    }

    fn exchange(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        let timeout_ms = timeout.as_millis() as u64;
        self.set_read_timeout(timeout)?;
        self.transport
            .write_frame(frame)
            .map_err(|e| ConnectionError::from_io(e, timeout_ms))?;
        self.transport
            .read_frame()
            .map_err(|e| ConnectionError::from_io(e, timeout_ms))
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.exchange(frame, timeout)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.set_read_timeout(timeout)?;
        let mut header = [0u8; 4];
        match self.transport.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(e) => return Err(ConnectionError::from_io(e, timeout.as_millis() as u64)),
        }
        self.transport
            .read_body(header)
            .map(Some)
            .map_err(|e| ConnectionError::from_io(e, timeout.as_millis() as u64))
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn interrupt_handle(&self) -> Option<Interrupt> {
        let socket = self.transport.socket().try_clone().ok()?;
        Some(Box::new(move || {
            let _ = socket.shutdown(Shutdown::Both);
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.transport.socket().shutdown(Shutdown::Both);
            debug!("Closed connection to {}", self.endpoint);
        }
    }
}

/// Connection factory carrying the socket settings shared by all endpoints
#[derive(Clone)]
pub struct TcpConnectionFactory {
    pub client_id: String,
    pub write_timeout: Duration,
    pub tls_config: Option<TlsConfig>,
}

impl TcpConnectionFactory {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            write_timeout: config.read_timeout,
            tls_config: config.tls.clone(),
        }
    }

    fn connect_socket(
        &self,
        endpoint: &str,
        location: &ServerLocation,
        timeout: Duration,
    ) -> Result<TcpStream, ConnectionError> {
        let connect_failed = |source: io::Error| ConnectionError::ConnectFailed {
            endpoint: endpoint.to_string(),
            source,
        };

        let addr = (location.host.as_str(), location.port)
            .to_socket_addrs()
            .map_err(connect_failed)?
            .next()
            .ok_or_else(|| connect_failed(io::Error::new(io::ErrorKind::NotFound, "No addresses found")))?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(connect_failed)?;

        // Disable Nagle's algorithm
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(timeout)).ok();
        stream.set_write_timeout(Some(self.write_timeout)).ok();
        Ok(stream)
    }

    fn open_transport(
        &self,
        endpoint: &str,
        location: &ServerLocation,
        timeout: Duration,
    ) -> Result<Transport, ConnectionError> {
        let stream = self.connect_socket(endpoint, location, timeout)?;
        match &self.tls_config {
            #[cfg(feature = "native-tls-backend")]
            Some(tls) => Ok(Transport::NativeTls {
                stream: tls_handshake(stream, &location.host, tls)?,
            }),
            #[cfg(not(feature = "native-tls-backend"))]
            Some(_) => Err(ConnectionError::TlsFailed(
                "TLS support not compiled in".to_string(),
            )),
            None => {
                let writer = BufWriter::with_capacity(16 * 1024, stream.try_clone()?);
                let reader = BufReader::with_capacity(16 * 1024, stream);
                Ok(Transport::Tcp { writer, reader })
            }
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(
        &self,
        endpoint: &str,
        kind: ChannelKind,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let location: ServerLocation =
            endpoint
                .parse()
                .map_err(|reason: String| ConnectionError::HandshakeFailed {
                    endpoint: endpoint.to_string(),
                    reason,
                })?;
        let transport = self.open_transport(endpoint, &location, timeout)?;

        let mut conn = TcpConnection {
            endpoint: endpoint.to_string(),
            transport,
            handshake: Handshake::default(),
            closed: false,
        };

        let request = codec::encode_handshake_request(kind, &self.client_id);
        let reply = conn.exchange(&request, timeout)?;
        conn.handshake = codec::decode_handshake_reply(&reply).map_err(|e| {
            ConnectionError::HandshakeFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        })?;

        debug!(
            "Connected to {} as {} (queue {:?})",
            endpoint,
            kind.as_str(),
            conn.handshake.queue_status
        );
        Ok(Box::new(conn))
    }
}

#[cfg(feature = "native-tls-backend")]
fn tls_handshake(
    stream: TcpStream,
    host: &str,
    tls_config: &TlsConfig,
) -> Result<native_tls::TlsStream<TcpStream>, ConnectionError> {
    use native_tls::{Certificate, Identity, TlsConnector};

    let mut builder = TlsConnector::builder();

    if tls_config.skip_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    if let Some(ref ca_path) = tls_config.ca_cert {
        let ca_data = std::fs::read(ca_path)
            .map_err(|e| ConnectionError::TlsFailed(format!("Failed to read CA cert: {}", e)))?;
        let cert = Certificate::from_pem(&ca_data)
            .map_err(|e| ConnectionError::TlsFailed(format!("Invalid CA cert: {}", e)))?;
        builder.add_root_certificate(cert);
    }

    if let (Some(ref cert_path), Some(ref key_path)) =
        (&tls_config.client_cert, &tls_config.client_key)
    {
        let cert_data = std::fs::read(cert_path)
            .map_err(|e| ConnectionError::TlsFailed(format!("Failed to read client cert: {}", e)))?;
        let key_data = std::fs::read(key_path)
            .map_err(|e| ConnectionError::TlsFailed(format!("Failed to read client key: {}", e)))?;
        let identity = Identity::from_pkcs8(&cert_data, &key_data)
            .map_err(|e| ConnectionError::TlsFailed(format!("Invalid client identity: {}", e)))?;
        builder.identity(identity);
    }

    let connector = builder
        .build()
        .map_err(|e| ConnectionError::TlsFailed(format!("Failed to build TLS connector: {}", e)))?;

    let sni_host = tls_config.sni.as_deref().unwrap_or(host);
    connector
        .connect(sni_host, stream)
        .map_err(|e| ConnectionError::TlsFailed(format!("TLS handshake failed: {}", e)))
}
