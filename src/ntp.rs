use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::configuration::NtpConfig;

const NTP_PORT: u16 = 123;
const PACKET_SIZE: usize = 48;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;
/// LI = 0, VN = 4, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x23;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Timeout,
    InvalidResponse(String),
    ClockSkew { offset: f64, max: u64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "NTP I/O error: {err}"),
            Error::Timeout => write!(f, "NTP query timed out"),
            Error::InvalidResponse(err) => write!(f, "Invalid NTP response: {err}"),
            Error::ClockSkew { offset, max } => write!(
                f,
                "Clock skew of {offset:.3}s exceeds the maximum of {max}s"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// 64 bit NTP timestamp: seconds since 1900 in the high word, fraction in the low word.
fn to_ntp_timestamp(time: SystemTime) -> u64 {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs() + NTP_EPOCH_OFFSET;
    let fraction = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

#[allow(clippy::cast_precision_loss)]
fn timestamp_seconds(timestamp: u64) -> f64 {
    (timestamp >> 32) as f64 + (timestamp & 0xffff_ffff) as f64 / 4_294_967_296.0
}

fn read_timestamp(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

pub fn encode_request(transmit: u64) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[0] = CLIENT_HEADER;
    packet[40..48].copy_from_slice(&transmit.to_be_bytes());
    packet
}

/// Validates a server reply to a request sent at `t0` and received at `t3`,
/// and returns the local clock offset in seconds (positive when the local
/// clock is behind).
pub fn decode_response(buf: &[u8], t0: u64, t3: u64) -> Result<f64, Error> {
    if buf.len() < PACKET_SIZE {
        return Err(Error::InvalidResponse(format!(
            "packet too short ({} bytes)",
            buf.len()
        )));
    }

    let mode = buf[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(Error::InvalidResponse(format!("unexpected mode {mode}")));
    }
    if buf[1] == 0 {
        return Err(Error::InvalidResponse("kiss-of-death packet".to_string()));
    }
    if read_timestamp(buf, 24) != t0 {
        return Err(Error::InvalidResponse(
            "originate timestamp does not match request".to_string(),
        ));
    }

    let t0 = timestamp_seconds(t0);
    let t1 = timestamp_seconds(read_timestamp(buf, 32));
    let t2 = timestamp_seconds(read_timestamp(buf, 40));
    let t3 = timestamp_seconds(t3);

    Ok(((t1 - t0) + (t2 - t3)) / 2.0)
}

async fn resolve(server: &str) -> Result<SocketAddr, Error> {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, NTP_PORT));
    }

    let has_port = server
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let target = if has_port {
        server.to_string()
    } else {
        format!("{server}:{NTP_PORT}")
    };

    let address = lookup_host(target.as_str())
        .await?
        .next()
        .ok_or_else(|| Error::InvalidResponse(format!("no address found for {server}")));
    address
}

/// Sends one SNTP query and returns the local clock offset in seconds.
pub async fn query_offset(server: &str) -> Result<f64, Error> {
    let address = resolve(server).await?;
    let bind: SocketAddr = if address.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };

    let socket = UdpSocket::bind(bind).await?;
    socket.connect(address).await?;

    let t0 = to_ntp_timestamp(SystemTime::now());
    socket.send(&encode_request(t0)).await?;

    let mut buf = [0u8; 64];
    let len = timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Timeout)??;
    let t3 = to_ntp_timestamp(SystemTime::now());

    decode_response(&buf[..len], t0, t3)
}

pub async fn check_skew(server: &str, max_clock_skew: u64) -> Result<f64, Error> {
    let offset = query_offset(server).await?;
    #[allow(clippy::cast_precision_loss)]
    let max = max_clock_skew as f64;
    if offset.abs() > max {
        return Err(Error::ClockSkew {
            offset,
            max: max_clock_skew,
        });
    }
    Ok(offset)
}

/// Background task comparing the system clock against an NTP server.
pub struct ClockSkewMonitor {
    _handle: JoinHandle<()>,
}

impl ClockSkewMonitor {
    pub fn spawn(config: &NtpConfig) -> Option<Self> {
        if !config.enabled() {
            info!("Clock skew monitor disabled");
            return None;
        }

        let server = config.server.clone();
        let max_clock_skew = config.max_clock_skew;
        let period = Duration::from_secs(config.interval);
        info!("Checking clock skew against {server} every {period:?}");

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match check_skew(&server, max_clock_skew).await {
                    Ok(offset) => debug!("Clock offset against {server}: {offset:.3}s"),
                    Err(error @ Error::ClockSkew { .. }) => {
                        error!("{error}, terminating");
                        std::process::exit(1);
                    }
                    Err(error) => {
                        warn!("Clock skew check against {server} failed, monitor stopped: {error}");
                        return;
                    }
                }
            }
        });

        Some(Self { _handle: handle })
    }
}
