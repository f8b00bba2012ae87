//! Byte pipes to a radio. TCP uses tokio sockets; serial is blocking `serialport` I/O run on
//! the blocking pool. Both drive one [`ConfigSession`] to completion or fail as a whole.

use std::time::Duration;

use chrono::Utc;
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use super::{ConfigSession, LinkError, NodeTable};
use crate::devices::DeviceKind;

/// Timeouts and defaults for one poll.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    /// Upper bound for the whole node-table dump.
    pub config_timeout: Duration,
    pub serial_baud: u32,
    /// Port used when a TCP address carries none.
    pub tcp_port: u16,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            config_timeout: Duration::from_secs(60),
            serial_baud: 115_200,
            tcp_port: 4403,
        }
    }
}

impl LinkOptions {
    pub fn from_config(devices: &crate::config::DevicesConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(devices.connect_timeout_secs),
            config_timeout: Duration::from_secs(devices.config_timeout_secs),
            serial_baud: devices.serial_baud,
            tcp_port: devices.tcp_port,
        }
    }
}

/// `host` or `host:port` to a socket address string.
pub fn tcp_target(address: &str, default_port: u16) -> Result<String, LinkError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(LinkError::BadAddress(address.to_string()));
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            port.parse::<u16>()
                .map_err(|_| LinkError::BadAddress(address.to_string()))?;
            Ok(address.to_string())
        }
        Some(_) => Err(LinkError::BadAddress(address.to_string())),
        None => Ok(format!("{}:{}", address, default_port)),
    }
}

/// Connect, download the node table, disconnect.
pub async fn fetch_node_table(
    kind: DeviceKind,
    address: &str,
    opts: &LinkOptions,
) -> Result<NodeTable, LinkError> {
    match kind {
        DeviceKind::Tcp => fetch_tcp(address, opts).await,
        DeviceKind::Serial => fetch_serial(address.to_string(), opts.clone()).await,
    }
}

async fn fetch_tcp(address: &str, opts: &LinkOptions) -> Result<NodeTable, LinkError> {
    let target = tcp_target(address, opts.tcp_port)?;
    let mut stream = timeout(opts.connect_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| LinkError::Timeout(opts.connect_timeout, "connect"))?
        .map_err(|source| LinkError::Connect {
            address: target.clone(),
            source,
        })?;
    let _ = stream.set_nodelay(true);

    let mut session = ConfigSession::new();
    debug!(
        "{}: requesting node table (want_config_id=0x{:08x})",
        target,
        session.request_id()
    );
    stream.write_all(&session.request_frame()?).await?;

    let deadline = Instant::now() + opts.config_timeout;
    let mut buf = [0u8; 2048];
    loop {
        let n = timeout_at(deadline, stream.read(&mut buf))
            .await
            .map_err(|_| LinkError::Timeout(opts.config_timeout, "node table"))??;
        if n == 0 {
            return Err(LinkError::Closed);
        }
        if session.feed(&buf[..n], Utc::now()) {
            break;
        }
    }
    if let Ok(bye) = ConfigSession::disconnect_frame() {
        let _ = stream.write_all(&bye).await;
    }
    let (frames, bad) = session.frame_counts();
    trace!("{}: {} frames ({} undecodable)", target, frames, bad);
    session.finish().ok_or(LinkError::Closed)
}

#[cfg(feature = "serial")]
async fn fetch_serial(port: String, opts: LinkOptions) -> Result<NodeTable, LinkError> {
    tokio::task::spawn_blocking(move || serial::fetch_blocking(&port, &opts))
        .await
        .map_err(|e| LinkError::Task(e.to_string()))?
}

#[cfg(not(feature = "serial"))]
async fn fetch_serial(_port: String, _opts: LinkOptions) -> Result<NodeTable, LinkError> {
    Err(LinkError::SerialUnsupported)
}

#[cfg(feature = "serial")]
mod serial {
    use std::io::{ErrorKind, Read, Write};
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use log::debug;

    use super::{ConfigSession, LinkError, LinkOptions, NodeTable};

    /// Run of START2 bytes that wakes a sleeping serial API before the first frame.
    const WAKE: [u8; 32] = [super::super::framer::START2; 32];

    pub(super) fn fetch_blocking(port_name: &str, opts: &LinkOptions) -> Result<NodeTable, LinkError> {
        debug!("Opening serial port {} at {} baud", port_name, opts.serial_baud);
        let mut builder =
            serialport::new(port_name, opts.serial_baud).timeout(Duration::from_millis(500));
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open()?;

        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(Duration::from_millis(150));
        // boot chatter already buffered is of no use
        let _ = port.clear(serialport::ClearBuffer::Input);

        port.write_all(&WAKE)?;
        std::thread::sleep(Duration::from_millis(100));

        let mut session = ConfigSession::new();
        port.write_all(&session.request_frame()?)?;
        port.flush()?;

        let deadline = Instant::now() + opts.config_timeout;
        let mut buf = [0u8; 1024];
        loop {
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout(opts.config_timeout, "node table"));
            }
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    if session.feed(&buf[..n], Utc::now()) {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if let Ok(bye) = ConfigSession::disconnect_frame() {
            let _ = port.write_all(&bye);
        }
        session.finish().ok_or(LinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_target_defaults_port() {
        assert_eq!(tcp_target("10.0.0.5", 4403).unwrap(), "10.0.0.5:4403");
        assert_eq!(tcp_target("10.0.0.5:4000", 4403).unwrap(), "10.0.0.5:4000");
        assert!(tcp_target("10.0.0.5:x", 4403).is_err());
        assert!(tcp_target(":4403", 4403).is_err());
        assert!(tcp_target("", 4403).is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_a_link_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let opts = LinkOptions {
            connect_timeout: Duration::from_secs(2),
            ..LinkOptions::default()
        };
        let err = fetch_node_table(DeviceKind::Tcp, &addr.to_string(), &opts)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Connect { .. } | LinkError::Timeout(..)
        ));
    }
}
