use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::watch,
    time::timeout,
};
use tracing::{debug, info};

/// RelayCounters are live per-direction byte counters of one session
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub client_to_upstream: AtomicU64,
    pub upstream_to_client: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            client_to_upstream: self.client_to_upstream.load(Ordering::Relaxed),
            upstream_to_client: self.upstream_to_client.load(Ordering::Relaxed),
        }
    }
}

/// RelayStats is the number of bytes relayed in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relay splices two established sockets in both directions
#[derive(Debug, Clone)]
pub struct Relay {
    buffer_size: usize,
    idle_timeout: Duration,
    counters: Arc<RelayCounters>,
}

/// Relay implementation block
impl Relay {
    /// new is a constructor for the Relay type
    pub fn new(buffer_size: usize, idle_timeout: Duration) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            idle_timeout,
            counters: Arc::new(RelayCounters::default()),
        }
    }

    /// counters can be polled while the relay runs
    pub fn counters(&self) -> Arc<RelayCounters> {
        Arc::clone(&self.counters)
    }

    /// run copies client -> upstream and upstream -> client on two tasks.
    ///
    /// The first direction to hit EOF, an error or the idle timeout
    /// half-closes its destination and tells the other direction to stop.
    /// A write already in progress is finished first, bounded by the idle
    /// timeout like every read. Both sockets are closed once both tasks
    /// have exited.
    pub async fn run(self, client: TcpStream, upstream: TcpStream) -> RelayStats {
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let (stop_tx, _) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let outbound = tokio::spawn(pipe(
            "client->upstream",
            client_read,
            upstream_write,
            Arc::clone(&self.counters),
            Direction::ClientToUpstream,
            Arc::clone(&stop_tx),
            self.buffer_size,
            self.idle_timeout,
        ));
        let inbound = tokio::spawn(pipe(
            "upstream->client",
            upstream_read,
            client_write,
            Arc::clone(&self.counters),
            Direction::UpstreamToClient,
            Arc::clone(&stop_tx),
            self.buffer_size,
            self.idle_timeout,
        ));

        // Each loop hands its halves back, so both sockets close here and
        // not before the slower direction is done
        let (outbound, inbound) = tokio::join!(outbound, inbound);
        drop((outbound, inbound));

        let stats = self.counters.snapshot();

        info!(
            "connection closed: {} bytes from client, {} bytes from upstream",
            stats.client_to_upstream, stats.upstream_to_client
        );

        stats
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// pipe is one copy loop of the relay
#[allow(clippy::too_many_arguments)]
async fn pipe(
    name: &'static str,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    counters: Arc<RelayCounters>,
    direction: Direction,
    stop: Arc<watch::Sender<bool>>,
    buffer_size: usize,
    idle_timeout: Duration,
) -> (OwnedReadHalf, OwnedWriteHalf) {
    let counter = match direction {
        Direction::ClientToUpstream => &counters.client_to_upstream,
        Direction::UpstreamToClient => &counters.upstream_to_client,
    };

    let mut stop_rx = stop.subscribe();
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                debug!("{name}: peer direction finished, stopping");
                break;
            }
            read = timeout(idle_timeout, reader.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(Ok(0)) => {
                debug!("{name}: end of stream");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("{name}: read error: {e}");
                break;
            }
            Err(_) => {
                debug!("{name}: idle for {idle_timeout:?}, closing");
                break;
            }
        };

        // Not raced against the stop signal so bytes already read still
        // reach the peer, but a peer that stops reading cannot pin us
        match timeout(idle_timeout, writer.write_all(&buf[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("{name}: write error: {e}");
                break;
            }
            Err(_) => {
                debug!("{name}: peer not reading for {idle_timeout:?}, closing");
                break;
            }
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    // Half-close so the far end sees a clean EOF. Either side may already
    // be gone, which is not worth more than a debug line
    if let Err(e) = writer.shutdown().await {
        log_close_error(name, &e);
    }
    stop.send_replace(true);

    (reader, writer)
}

fn log_close_error(name: &str, e: &io::Error) {
    match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {}
        _ => debug!("{name}: shutdown error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// socket_pair returns two ends of one loopback TCP connection
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_and_close_propagates() {
        // client <-> [a | relay | b] <-> upstream
        let (mut client, a) = socket_pair().await;
        let (b, mut upstream) = socket_pair().await;

        let relay = Relay::new(1024, Duration::from_secs(5));
        let counters = relay.counters();
        let relay_task = tokio::spawn(relay.run(a, b));

        let request: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&request).await.unwrap();
        let mut seen = vec![0u8; request.len()];
        upstream.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, request);

        upstream.write_all(b"250 OK\r\n").await.unwrap();
        let mut answer = [0u8; 8];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"250 OK\r\n");

        assert_eq!(counters.snapshot().client_to_upstream, 10_000);

        // Client goes away, the upstream end must observe EOF
        drop(client);
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(2), upstream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_upstream: 10_000,
                upstream_to_client: 8,
            }
        );
    }

    #[tokio::test]
    async fn upstream_close_tears_down_client_side() {
        let (mut client, a) = socket_pair().await;
        let (b, mut upstream) = socket_pair().await;

        let relay_task = tokio::spawn(Relay::new(64, Duration::from_secs(5)).run(a, b));

        upstream.write_all(b"221 bye\r\n").await.unwrap();
        drop(upstream);

        let mut received = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"221 bye\r\n");

        timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn idle_relay_is_closed() {
        let (mut client, a) = socket_pair().await;
        let (b, mut upstream) = socket_pair().await;

        let relay_task = tokio::spawn(Relay::new(64, Duration::from_millis(100)).run(a, b));

        timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn client_that_stops_reading_does_not_pin_the_relay() {
        let (_client, a) = socket_pair().await;
        let (b, mut upstream) = socket_pair().await;

        // Upstream keeps talking, the client never reads a byte
        let flood = tokio::spawn(async move {
            let chunk = vec![0x42u8; 64 * 1024];
            while upstream.write_all(&chunk).await.is_ok() {}
        });

        let relay_task = tokio::spawn(Relay::new(16 * 1024, Duration::from_millis(200)).run(a, b));

        let stats = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay stayed blocked on a peer that never reads")
            .unwrap();
        assert!(stats.upstream_to_client > 0);

        flood.abort();
    }
}
