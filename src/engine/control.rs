use super::ploss::PLoss;
use super::Error;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;

/// Client for the speedtest TCP control protocol. Line-oriented, one command
/// per line: `HI`, `PING <nanos>`, `HI <uuid>` + `INITPLOSS`, `PLOSS`,
/// `QUIT`.
#[derive(Debug)]
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    version: Option<String>,
}

impl ControlClient {
    /// Open a control connection. `local` binds the socket's source address;
    /// exceeding `timeout` during the handshake is the connect-timeout
    /// failure.
    pub async fn connect(
        host: &str,
        timeout: Duration,
        local: Option<SocketAddr>,
    ) -> Result<Self, Error> {
        let addr = tokio::net::lookup_host(host)
            .await?
            .next()
            .ok_or(Error::Unsupported)?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = local {
            socket.bind(local)?;
        }
        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            version: None,
        })
    }

    async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Unsupported);
        }
        Ok(line)
    }

    /// Server software version, fetched once with `HI` and cached.
    pub async fn version(&mut self) -> Result<String, Error> {
        if let Some(v) = &self.version {
            return Ok(v.clone());
        }
        self.write_line("HI").await?;
        let reply = self.read_line().await?;
        let version = reply
            .strip_prefix("HELLO ")
            .map(|rest| rest.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.version = Some(version.clone());
        Ok(version)
    }

    /// Measure latency with the two-round-trip method: three intervals from
    /// two echo exchanges (t2−t0, t4−t2 client-side; t3−t1 server-side in
    /// milliseconds), the server interval weighted lower.
    ///
    /// latency = 0.4·(t2−t0) + 0.4·(t4−t2) + 0.2·(t3−t1)
    ///
    /// Returns the accumulated delay in nanoseconds.
    pub async fn ping(&mut self) -> Result<i64, Error> {
        let mut accumulated: i64 = 0;
        let mut first_server_ms: i64 = 0;
        for i in 0..2 {
            let wall = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as i64;
            let sent = Instant::now();
            self.write_line(&format!("PING {wall}")).await?;
            let reply = self.read_line().await?;
            let rtt = sent.elapsed().as_nanos() as i64;

            let server_ms: i64 = reply
                .strip_prefix("PING ")
                .and_then(|rest| rest.trim().parse().ok())
                .ok_or(Error::EchoData)?;

            accumulated += rtt * 4 / 10;
            if i == 0 {
                first_server_ms = server_ms;
            } else {
                accumulated += (server_ms - first_server_ms) * 1_000_000 * 2 / 10;
            }
        }
        Ok(accumulated)
    }

    /// Register this session for packet-loss tracking.
    pub async fn init_packet_loss(&mut self, uuid: &str) -> Result<(), Error> {
        self.write_line(&format!("HI {uuid}")).await?;
        self.write_line("INITPLOSS").await
    }

    /// Poll the server's packet-loss tally. `Ok(None)` when the reply does
    /// not carry a tally (some servers answer PLOSS with chatter first).
    pub async fn packet_loss(&mut self) -> Result<Option<PLoss>, Error> {
        self.write_line("PLOSS").await?;
        let reply = self.read_line().await?;
        let mut fields = reply.split_ascii_whitespace();
        if fields.next() != Some("PLOSS") {
            return Ok(None);
        }
        let parse = |f: Option<&str>| -> Result<i64, Error> {
            f.and_then(|v| v.parse().ok()).ok_or(Error::EchoData)
        };
        let sent = parse(fields.next())?;
        let dup = parse(fields.next())?;
        let max = parse(fields.next())?;
        Ok(Some(PLoss { sent, dup, max }))
    }

    /// Tell the server we are done and drop the connection.
    pub async fn quit(mut self) {
        let _ = self.write_line("QUIT").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal control-protocol peer: replies HELLO to HI, echoes PING with a
    /// fixed server timestamp delta, and serves one PLOSS tally.
    async fn spawn_mock(reply_ms: &'static [i64], ploss: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut pings = 0usize;
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let line = String::from_utf8_lossy(&buf[..n]);
                for cmd in line.lines() {
                    let reply = if cmd == "HI" {
                        Some("HELLO 2.1 (mock)\n".to_string())
                    } else if cmd.starts_with("PING ") {
                        let ms = reply_ms[pings.min(reply_ms.len() - 1)];
                        pings += 1;
                        Some(format!("PING {ms}\n"))
                    } else if cmd == "PLOSS" {
                        Some(format!("{ploss}\n"))
                    } else if cmd == "QUIT" {
                        return;
                    } else {
                        None
                    };
                    if let Some(reply) = reply {
                        stream.write_all(reply.as_bytes()).await.unwrap();
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn version_handshake() {
        let addr = spawn_mock(&[0], "PLOSS 0 0 0").await;
        let mut client =
            ControlClient::connect(&addr.to_string(), Duration::from_secs(2), None)
                .await
                .unwrap();
        assert_eq!(client.version().await.unwrap(), "2.1 (mock)");
        // cached on the second call
        assert_eq!(client.version().await.unwrap(), "2.1 (mock)");
    }

    #[tokio::test]
    async fn ping_weights_server_interval() {
        // server clock advances 5ms between the two echoes; the weighted sum
        // gains 0.2 * 5ms from the server-side interval
        let addr = spawn_mock(&[1_000, 1_005], "PLOSS 0 0 0").await;
        let mut client =
            ControlClient::connect(&addr.to_string(), Duration::from_secs(2), None)
                .await
                .unwrap();
        let ns = client.ping().await.unwrap();
        // 0.2 * 5ms = 1ms from the server, plus two small loopback RTTs
        assert!(ns >= 1_000_000, "latency {ns}ns");
        assert!(ns < 100_000_000, "latency {ns}ns");
    }

    #[tokio::test]
    async fn packet_loss_parses_tally() {
        let addr = spawn_mock(&[0], "PLOSS 135 0 149").await;
        let mut client =
            ControlClient::connect(&addr.to_string(), Duration::from_secs(2), None)
                .await
                .unwrap();
        let pl = client.packet_loss().await.unwrap().unwrap();
        assert_eq!((pl.sent, pl.dup, pl.max), (135, 0, 149));
    }

    #[tokio::test]
    async fn connect_to_dead_port_fails() {
        // bind-then-drop gives us a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = ControlClient::connect(&addr.to_string(), Duration::from_millis(500), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout | Error::Io(_)));
    }
}
