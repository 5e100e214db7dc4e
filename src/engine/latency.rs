use super::control::ControlClient;
use super::direction::CONNECT_TIMEOUT;
use super::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct PingOptions {
    /// Number of recorded samples.
    pub count: usize,
    /// Pause between consecutive probes.
    pub spacing: Duration,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            count: 10,
            spacing: Duration::from_millis(100),
            timeout: CONNECT_TIMEOUT,
        }
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// HTTP latency probe: `count + 1` GETs against the server's latency.txt,
/// the first response discarded as connection warm-up. Gives up once more
/// than `count` consecutive requests fail.
pub async fn http_ping(
    http: &reqwest::Client,
    latency_url: &str,
    opts: PingOptions,
    cancel: Option<watch::Receiver<bool>>,
    mut callback: impl FnMut(i64),
) -> Result<Vec<i64>, Error> {
    let mut samples = Vec::with_capacity(opts.count);
    let mut consecutive_failures = 0usize;

    for i in 0..=opts.count {
        if is_cancelled(&cancel) {
            break;
        }
        let started = Instant::now();
        let result = http
            .get(latency_url)
            .timeout(opts.timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(resp) => {
                let _ = resp.bytes().await;
                consecutive_failures = 0;
                if i > 0 {
                    let rtt = started.elapsed().as_nanos() as i64;
                    samples.push(rtt);
                    callback(rtt);
                }
            }
            Err(_) => {
                consecutive_failures += 1;
                if consecutive_failures > opts.count {
                    return Err(Error::ConnectTimeout);
                }
            }
        }
        if i < opts.count {
            tokio::time::sleep(opts.spacing).await;
        }
    }
    Ok(samples)
}

/// TCP latency probe over the control protocol; every sample is one
/// two-round-trip exchange (see [`ControlClient::ping`]).
pub async fn tcp_ping(
    host: &str,
    opts: PingOptions,
    local: Option<SocketAddr>,
    cancel: Option<watch::Receiver<bool>>,
    mut callback: impl FnMut(i64),
) -> Result<Vec<i64>, Error> {
    let mut client = ControlClient::connect(host, opts.timeout, local).await?;
    let mut samples = Vec::with_capacity(opts.count);

    for i in 0..opts.count {
        if is_cancelled(&cancel) {
            break;
        }
        match tokio::time::timeout(opts.timeout, client.ping()).await {
            Ok(Ok(ns)) => {
                samples.push(ns);
                callback(ns);
            }
            // a broken control channel will not recover mid-probe
            Ok(Err(_)) | Err(_) => break,
        }
        if i + 1 < opts.count {
            tokio::time::sleep(opts.spacing).await;
        }
    }
    client.quit().await;
    if samples.is_empty() {
        return Err(Error::ConnectTimeout);
    }
    Ok(samples)
}

const ICMP_PAYLOAD: &[u8] = "Hi! SpeedTest-Go \\(●'◡'●)/".as_bytes();

/// Build the echo request: 8-byte header (type 8, code 0, id 0x0001,
/// seq 0x0001) plus a 32-byte payload, with the 16-bit one's-complement
/// checksum over the whole frame.
fn icmp_echo_packet() -> [u8; 40] {
    let mut packet = [0u8; 40];
    packet[0] = 0x08;
    packet[5] = 0x01;
    packet[7] = 0x01;
    let n = ICMP_PAYLOAD.len().min(32);
    packet[8..8 + n].copy_from_slice(&ICMP_PAYLOAD[..n]);
    let sum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Raw ICMP echo probe. Needs a raw socket (CAP_NET_RAW); runs blocking
/// writes/reads with per-attempt deadlines off the async runtime.
pub async fn icmp_ping(
    host: &str,
    opts: PingOptions,
    source: Option<IpAddr>,
    cancel: Option<watch::Receiver<bool>>,
    mut callback: impl FnMut(i64) + Send + 'static,
) -> Result<Vec<i64>, Error> {
    let hostname = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    let addr = tokio::net::lookup_host((hostname, 0))
        .await?
        .find(|a| a.is_ipv4())
        .ok_or(Error::Unsupported)?;

    let samples = tokio::task::spawn_blocking(move || -> Result<Vec<i64>, Error> {
        use socket2::{Domain, Protocol, Socket, Type};
        use std::io::{Read, Write};

        let mut socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        if let Some(src) = source {
            socket.bind(&SocketAddr::new(src, 0).into())?;
        }
        socket.connect(&SocketAddr::new(addr.ip(), 0).into())?;
        socket.set_read_timeout(Some(opts.timeout))?;

        let packet = icmp_echo_packet();
        let mut samples = Vec::with_capacity(opts.count);
        for i in 0..opts.count {
            if is_cancelled(&cancel) {
                break;
            }
            let started = Instant::now();
            socket.write_all(&packet)?;
            // reply carries the 20-byte IP header in front of the echo
            let mut reply = [0u8; 60];
            match socket.read(&mut reply) {
                Ok(n) if n > 20 && reply[20] == 0x00 => {
                    let rtt = started.elapsed().as_nanos() as i64;
                    samples.push(rtt);
                    callback(rtt);
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if i + 1 < opts.count {
                std::thread::sleep(opts.spacing);
            }
        }
        Ok(samples)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn echo_packet_layout() {
        let p = icmp_echo_packet();
        assert_eq!(p.len(), 40);
        assert_eq!(p[0], 0x08); // echo request
        assert_eq!(p[1], 0x00);
        assert_eq!(&p[4..8], &[0x00, 0x01, 0x00, 0x01]); // id, seq
        // payload fills the 32 bytes exactly
        assert_eq!(&p[8..], ICMP_PAYLOAD);
    }

    #[test]
    fn checksum_verifies_to_zero() {
        // summing a frame over its own checksum yields the all-ones word
        let p = icmp_echo_packet();
        assert_eq!(icmp_checksum(&p), 0);
    }

    #[tokio::test]
    async fn http_ping_discards_warmup_and_records_count() {
        // tiny HTTP server answering every GET with a 200 and a short body
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::AsyncReadExt;
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            return;
                        }
                        let _ = stream
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\ntest\n",
                            )
                            .await;
                    }
                });
            }
        });

        let http = reqwest::Client::new();
        let url = format!("http://{addr}/speedtest/latency.txt");
        let opts = PingOptions {
            count: 4,
            spacing: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
        };
        let mut seen = 0;
        let samples = http_ping(&http, &url, opts, None, |_| seen += 1)
            .await
            .unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(seen, 4);
        assert!(samples.iter().all(|&s| s > 0));
    }

    #[tokio::test]
    async fn http_ping_gives_up_after_consecutive_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = reqwest::Client::new();
        let url = format!("http://{addr}/speedtest/latency.txt");
        let opts = PingOptions {
            count: 2,
            spacing: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        };
        let err = http_ping(&http, &url, opts, None, |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout));
    }
}
