//! Dispatch server
//!
//! Listens for master connections. Each connection carries exactly one
//! framed batch: the handler decodes it, hands the entries to the
//! executor through the shared state, waits for the drain condition,
//! and replies with everything the batch produced before closing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use loopsim_model::{DataEntry, DataPacket, SignalKind};

use crate::error::Result;
use crate::registry::ModuleRegistry;
use crate::state::NodeState;

/// Accepts connections and spawns one handler task per connection.
pub struct DispatchServer {
    state: Arc<NodeState>,
    registry: Arc<Mutex<ModuleRegistry>>,
    read_timeout: Duration,
}

impl DispatchServer {
    pub fn new(
        state: Arc<NodeState>,
        registry: Arc<Mutex<ModuleRegistry>>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            read_timeout,
        }
    }

    /// Bind the listening socket with address reuse, so a restart does
    /// not trip over sockets lingering in TIME_WAIT.
    pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(16)?;
        info!("listening on {}", addr);
        Ok(listener)
    }

    /// Accept loop; exits when the shutdown flag flips.
    pub async fn run(self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("client connected: {}", peer);
                            let state = Arc::clone(&self.state);
                            let registry = Arc::clone(&self.registry);
                            let read_timeout = self.read_timeout;
                            tokio::spawn(async move {
                                handle_connection(state, registry, stream, peer, read_timeout)
                                    .await;
                            });
                        },
                        Err(e) => {
                            warn!("accept failed: {e}");
                        },
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                },
            }
        }
        info!("dispatch server stopped");
    }
}

/// Serve one connection: one request frame, one reply frame.
async fn handle_connection(
    state: Arc<NodeState>,
    registry: Arc<Mutex<ModuleRegistry>>,
    mut stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not disable Nagle for {}: {e}", peer);
    }

    let packet = match tokio::time::timeout(read_timeout, DataPacket::decode(&mut stream)).await {
        Ok(Ok(packet)) => packet,
        Ok(Err(e)) => {
            // Malformed frame: close without replying; the master
            // surfaces the failed exchange as a transport error.
            error!("failed to parse frame from {}: {e}; closing connection", peer);
            return;
        },
        Err(_) => {
            error!("read from {} timed out after {:?}", peer, read_timeout);
            return;
        },
    };

    let mut entries = packet.entries;
    if entries.is_empty() {
        // Both explicit write requests and empty data batches read as
        // "poll everything you have".
        entries = poll_entries(&registry).await;
        debug!(
            "empty batch from {}: polling {} registered inputs",
            peer,
            entries.len()
        );
    } else {
        debug!("placed {} entries on the command queue", entries.len());
    }

    if !entries.is_empty() {
        state.submit_batch(entries).await;
        state.wait_for_drain().await;
    }

    let (out_entries, errors) = state.take_reply().await;
    let reply = DataPacket::reply(out_entries, errors);
    match reply.encode() {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                warn!("failed to send reply to {}: {e}", peer);
            }
        },
        Err(e) => {
            error!("failed to encode reply for {}: {e}", peer);
        },
    }
    // Dropping the stream closes the connection and flushes the reply.
}

/// One synthetic poll entry per registered input module: a single-sample
/// read for AI, a plain level read for DI.
async fn poll_entries(registry: &Arc<Mutex<ModuleRegistry>>) -> Vec<DataEntry> {
    registry
        .lock()
        .await
        .registered_inputs()
        .into_iter()
        .map(|(pin, kind)| {
            let value = match kind {
                SignalKind::Ai => 1.0,
                _ => 0.0,
            };
            DataEntry::stamped_now(kind, pin, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::gpio::{GpioBackend, SimGpioBackend};
    use crate::spi::{SimSpiBus, SpiBus};
    use loopsim_model::EntryValue;

    struct TestNode {
        addr: SocketAddr,
        bus: Arc<SimSpiBus>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn spawn_node() -> TestNode {
        let bus = Arc::new(SimSpiBus::new());
        let gpio = Arc::new(SimGpioBackend::new());
        let registry = Arc::new(Mutex::new(ModuleRegistry::new(
            bus.clone() as Arc<dyn SpiBus>,
            gpio as Arc<dyn GpioBackend>,
        )));
        let state = Arc::new(NodeState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let executor = Executor::new(Arc::clone(&state), Arc::clone(&registry));
        tokio::spawn(executor.run(shutdown_rx.clone()));

        let listener =
            DispatchServer::bind("127.0.0.1:0".parse().unwrap()).expect("ephemeral bind");
        let addr = listener.local_addr().unwrap();
        let server = DispatchServer::new(state, registry, Duration::from_secs(2));
        tokio::spawn(server.run(listener, shutdown_rx));

        TestNode {
            addr,
            bus,
            shutdown_tx,
        }
    }

    async fn exchange(addr: SocketAddr, packet: DataPacket) -> DataPacket {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&packet.encode().unwrap()).await.unwrap();
        DataPacket::decode(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn single_batch_round_trip() {
        let node = spawn_node().await;
        node.bus.set_loop_ma(12.0);

        let request = DataPacket::data(vec![
            DataEntry::stamped_now(SignalKind::Ao, "GPIO13", 12.0),
            DataEntry::stamped_now(SignalKind::Ai, "GPIO5", 4.0),
        ]);
        let reply = exchange(node.addr, request).await;

        assert_eq!(reply.entries.len(), 2);
        assert!(reply.errors.is_empty());
        // Responses arrive in execution order.
        assert_eq!(reply.entries[0].kind, SignalKind::Ao);
        assert_eq!(reply.entries[1].kind, SignalKind::Ai);
        let mean = reply.entries[1].value.as_number().unwrap();
        assert!((mean - 12.0).abs() < 0.01);

        let _ = node.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn write_request_polls_registered_inputs() {
        let node = spawn_node().await;
        node.bus.set_loop_ma(8.0);

        // Register an AI module through a normal batch first.
        let _ = exchange(
            node.addr,
            DataPacket::data(vec![DataEntry::stamped_now(SignalKind::Ai, "GPIO5", 1.0)]),
        )
        .await;

        // A bare write request now polls that input.
        let reply = exchange(node.addr, DataPacket::write_request()).await;
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.entries[0].kind, SignalKind::Ai);
        assert!(reply.errors.is_empty());

        let _ = node.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn empty_data_batch_behaves_like_write_request() {
        let node = spawn_node().await;

        // No inputs registered yet: an empty batch replies empty.
        let reply = exchange(node.addr, DataPacket::data(Vec::new())).await;
        assert!(reply.entries.is_empty());
        assert!(reply.errors.is_empty());

        let _ = node.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn truncated_frame_closes_without_reply() {
        let node = spawn_node().await;

        let mut stream = TcpStream::connect(node.addr).await.unwrap();
        stream.write_all(b"d:5:{\"ti").await.unwrap();

        // The node times out the read and closes; the decode on our side
        // sees the EOF as an empty frame.
        let reply = DataPacket::decode(&mut stream).await.unwrap();
        assert!(reply.entries.is_empty());

        // The node is still serving afterwards.
        let reply = exchange(
            node.addr,
            DataPacket::data(vec![DataEntry::stamped_now(SignalKind::Do, "GPIO6", 1.0)]),
        )
        .await;
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.entries[0].value, EntryValue::Number(1.0));

        let _ = node.shutdown_tx.send(true);
    }
}
