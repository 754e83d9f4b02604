//! Multi-client load simulator.
//!
//! Starts a batch of clients against a running server. Each one sends its
//! encrypted handshake in four chunks (the last chunk holding only the
//! delimiter), answers every ping, acks every server event, and optionally
//! sends periodic client events. A summary is printed when the run ends.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

use crate::client::ProtocolClient;
use crate::crypto::CipherKey;
use crate::protocol::Message;

/// Options for `event-courier simulate`.
#[derive(Debug, Clone, clap::Args)]
pub struct SimulateArgs {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:9300")]
    pub addr: String,

    /// Number of clients to start.
    #[arg(long, env = "CLIENT_COUNT", default_value_t = 2)]
    pub clients: u32,

    /// Client id of the first client; the rest count up from it.
    #[arg(long, default_value_t = 1)]
    pub first_id: u64,

    /// How long each client stays connected, in seconds.
    #[arg(long, default_value_t = 30)]
    pub duration: u64,

    /// Pause between handshake chunks, in milliseconds.
    #[arg(long, default_value_t = 800)]
    pub chunk_delay_ms: u64,

    /// Delay between client launches, in milliseconds.
    #[arg(long, default_value_t = 30)]
    pub stagger_ms: u64,

    /// Send a client event this often, in milliseconds. Off when absent.
    #[arg(long)]
    pub client_event_ms: Option<u64>,
}

/// Counters from one simulated client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Distinct server events received.
    pub events: u64,
    /// Server events received again after they were already acked.
    pub duplicates: u64,
    /// Pings answered.
    pub pings: u64,
    /// Client events sent.
    pub client_events: u64,
    /// Whether the server closed the connection before the run ended.
    pub closed_by_server: bool,
}

/// Totals across all clients of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationSummary {
    /// Clients that completed the handshake.
    pub connected: u32,
    /// Clients that failed to connect or errored.
    pub failed: u32,
    /// Clients the server disconnected early.
    pub closed_by_server: u32,
    /// Distinct server events received.
    pub events: u64,
    /// Duplicate server events received.
    pub duplicates: u64,
    /// Pings answered.
    pub pings: u64,
    /// Client events sent.
    pub client_events: u64,
}

impl SimulationSummary {
    fn add(&mut self, stats: ClientStats) {
        self.connected += 1;
        self.events += stats.events;
        self.duplicates += stats.duplicates;
        self.pings += stats.pings;
        self.client_events += stats.client_events;
        if stats.closed_by_server {
            self.closed_by_server += 1;
        }
    }
}

impl std::fmt::Display for SimulationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} connected, {} failed, {} closed by server; {} events ({} duplicates), {} pings, {} client events",
            self.connected,
            self.failed,
            self.closed_by_server,
            self.events,
            self.duplicates,
            self.pings,
            self.client_events
        )
    }
}

/// Per-client behavior, shared by every client of a run.
#[derive(Debug, Clone, Copy)]
struct ClientPlan {
    lifetime: Duration,
    chunk_delay: Duration,
    client_event_every: Option<Duration>,
}

/// Run the simulation described by `args` and return its totals.
pub async fn run(args: SimulateArgs, key: CipherKey) -> Result<SimulationSummary> {
    let plan = ClientPlan {
        lifetime: Duration::from_secs(args.duration),
        chunk_delay: Duration::from_millis(args.chunk_delay_ms),
        client_event_every: args.client_event_ms.map(Duration::from_millis),
    };

    println!(
        "Simulating {} clients against {} for {}s",
        args.clients, args.addr, args.duration
    );

    let mut tasks = JoinSet::new();
    for offset in 0..args.clients {
        let client_id = (args.first_id + u64::from(offset)).to_string();
        let addr = args.addr.clone();
        let key = key.clone();
        let launch_delay = Duration::from_millis(args.stagger_ms * u64::from(offset));

        tasks.spawn(async move {
            tokio::time::sleep(launch_delay).await;
            let client = ProtocolClient::connect(addr.as_str(), key)
                .await
                .with_context(|| format!("Client {client_id} could not connect to {addr}"))?;
            run_client(client, &client_id, plan).await
        });
    }

    let mut summary = SimulationSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(stats)) => summary.add(stats),
            Ok(Err(e)) => {
                log::warn!("[Simulate] {e:#}");
                summary.failed += 1;
            }
            Err(e) => {
                log::error!("[Simulate] Client task panicked: {e}");
                summary.failed += 1;
            }
        }
    }

    log::info!("[Simulate] Finished: {summary}");
    println!("{summary}");
    Ok(summary)
}

/// Cut a frame into the four pieces the legacy simulator sent: two short
/// prefixes, the rest of the body, and the delimiter on its own.
fn handshake_chunks(frame: &[u8]) -> Vec<&[u8]> {
    let body_end = frame.len().saturating_sub(1);
    let first = 15.min(body_end);
    let second = 32.min(body_end);
    [
        &frame[..first],
        &frame[first..second],
        &frame[second..body_end],
        &frame[body_end..],
    ]
    .into_iter()
    .filter(|chunk| !chunk.is_empty())
    .collect()
}

async fn run_client<S>(
    mut client: ProtocolClient<S>,
    client_id: &str,
    plan: ClientPlan,
) -> Result<ClientStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = Message::handshake(client_id).seal(client.key())?;
    for chunk in handshake_chunks(&frame) {
        client.send_raw(chunk).await?;
        tokio::time::sleep(plan.chunk_delay).await;
    }
    log::info!("[Simulate] Client {client_id} sent handshake");

    let mut stats = ClientStats::default();
    let mut acked = HashSet::new();
    let deadline = tokio::time::sleep(plan.lifetime);
    tokio::pin!(deadline);

    let send_events = plan.client_event_every.is_some();
    let mut event_timer =
        tokio::time::interval(plan.client_event_every.unwrap_or(Duration::from_secs(3600)));
    event_timer.tick().await;

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = event_timer.tick(), if send_events => {
                let mut fields = Map::new();
                fields.insert("usage".into(), json!(stats.client_events + 1));
                fields.insert("sentAt".into(), json!(chrono::Utc::now().timestamp_millis()));
                client.send(&Message::ClientEvent(fields)).await?;
                stats.client_events += 1;
            }
            received = client.recv() => match received? {
                None => {
                    log::warn!("[Simulate] Client {client_id} disconnected by server");
                    stats.closed_by_server = true;
                    break;
                }
                Some(Message::Ping { .. }) => {
                    client.send(&Message::Pong {}).await?;
                    stats.pings += 1;
                }
                Some(Message::ServerEvent { event_id, .. }) => {
                    if acked.insert(event_id.clone()) {
                        stats.events += 1;
                    } else {
                        stats.duplicates += 1;
                    }
                    log::debug!("[Simulate] Client {client_id} acking {event_id}");
                    client.send(&Message::ack(event_id)).await?;
                }
                Some(other) => {
                    log::warn!("[Simulate] Client {client_id} got unexpected {}", other.kind());
                }
            },
        }
    }

    Ok(stats)
}
