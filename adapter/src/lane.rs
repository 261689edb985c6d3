//! Async platform adapter: one worker lane per connection.
//!
//! Each registered connection gets a tokio task fed by an unbounded channel.
//! The task owns the connection's [`ConnectionTap`] and handles commands
//! strictly in the order they were queued, so per-connection packet order
//! survives any amount of concurrency between connections. Callers get each
//! packet's [`Action`] back through a oneshot channel.

use engine::{Action, ConnectionId, ConnectionStats, ConnectionTap, Engine, PacketInterceptor};
use log::{debug, error, info};
use protocol::Direction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaneError {
    #[error("connection {0} has no lane")]
    UnknownConnection(ConnectionId),
    #[error("lane for connection {0} has shut down")]
    Closed(ConnectionId),
}

/// Work queued on a connection's lane.
#[derive(Debug)]
pub enum LaneCommand {
    Packet {
        direction: Direction,
        raw: Vec<u8>,
        reply: oneshot::Sender<Action>,
    },
    Probe {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
}

struct Lane {
    sender: mpsc::UnboundedSender<LaneCommand>,
    handle: JoinHandle<u64>,
}

pub struct LaneAdapter {
    engine: Arc<Engine>,
    lanes: Arc<RwLock<HashMap<ConnectionId, Lane>>>,
    ticks: Arc<AtomicU64>,
}

impl LaneAdapter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            lanes: Arc::new(RwLock::new(HashMap::new())),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Registers the connection with the engine and starts its lane.
    ///
    /// Connecting an id that already has a lane drains and replaces the old
    /// one.
    pub async fn connect(&self, id: ConnectionId, protocol_version: u32) -> ConnectionTap {
        let tap = self.engine.register_connection(id, protocol_version);
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_lane(tap.clone(), receiver));

        let previous = self
            .lanes
            .write()
            .await
            .insert(id, Lane { sender, handle });
        if let Some(previous) = previous {
            drop(previous.sender);
            if let Err(e) = previous.handle.await {
                error!("Lane for connection {} panicked: {}", id, e);
            }
        }

        debug!("Lane started for connection {}", id);
        tap
    }

    /// Queues a frame and returns the receiver its action will arrive on.
    pub async fn enqueue(
        &self,
        id: ConnectionId,
        direction: Direction,
        raw: Vec<u8>,
    ) -> Result<oneshot::Receiver<Action>, LaneError> {
        let (reply, receiver) = oneshot::channel();
        self.send(
            id,
            LaneCommand::Packet {
                direction,
                raw,
                reply,
            },
        )
        .await?;
        Ok(receiver)
    }

    /// Queues a frame and waits for its action.
    pub async fn submit(
        &self,
        id: ConnectionId,
        direction: Direction,
        raw: Vec<u8>,
    ) -> Result<Action, LaneError> {
        let receiver = self.enqueue(id, direction, raw).await?;
        receiver.await.map_err(|_| LaneError::Closed(id))
    }

    /// Asks the connection's lane for its next confirmation probe.
    pub async fn probe(&self, id: ConnectionId) -> Result<Option<Vec<u8>>, LaneError> {
        let (reply, receiver) = oneshot::channel();
        self.send(id, LaneCommand::Probe { reply }).await?;
        receiver.await.map_err(|_| LaneError::Closed(id))
    }

    async fn send(&self, id: ConnectionId, command: LaneCommand) -> Result<(), LaneError> {
        let lanes = self.lanes.read().await;
        let lane = lanes.get(&id).ok_or(LaneError::UnknownConnection(id))?;
        lane.sender
            .send(command)
            .map_err(|_| LaneError::Closed(id))
    }

    /// Stops the lane after everything already queued has been handled, then
    /// unregisters the connection.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<ConnectionStats> {
        let lane = self.lanes.write().await.remove(&id);
        if let Some(lane) = lane {
            drop(lane.sender);
            match lane.handle.await {
                Ok(handled) => debug!(
                    "Lane for connection {} drained after {} commands",
                    id, handled
                ),
                Err(e) => error!("Lane for connection {} panicked: {}", id, e),
            }
        }
        self.engine.unregister_connection(id)
    }

    pub async fn lane_count(&self) -> usize {
        self.lanes.read().await.len()
    }

    /// Ticks issued by [`spawn_ticker`](LaneAdapter::spawn_ticker) so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Spawns the task that drives the engine's TTL sweep once per `period`.
    pub fn spawn_ticker(&self, period: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let ticks = Arc::clone(&self.ticks);

        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // The first tick completes immediately.
            timer.tick().await;

            loop {
                timer.tick().await;
                let now = ticks.fetch_add(1, Ordering::AcqRel) + 1;
                let report = engine.tick(now);
                if report.expired > 0 {
                    debug!(
                        "Tick {}: {} tracked objects expired across {} connections",
                        now, report.expired, report.connections
                    );
                }
            }
        })
    }
}

/// Handles one connection's commands in order until every sender is gone.
async fn run_lane(tap: ConnectionTap, mut receiver: mpsc::UnboundedReceiver<LaneCommand>) -> u64 {
    let mut handled = 0;

    while let Some(command) = receiver.recv().await {
        handled += 1;
        match command {
            LaneCommand::Packet {
                direction,
                raw,
                reply,
            } => {
                let action = tap.intercept(direction, &raw);
                if reply.send(action).is_err() {
                    debug!(
                        "Connection {}: caller stopped waiting for a {} packet",
                        tap.id(),
                        direction.as_str()
                    );
                }
            }
            LaneCommand::Probe { reply } => {
                let _ = reply.send(tap.confirmation_probe());
            }
        }
    }

    info!("Lane for connection {} stopped", tap.id());
    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::EngineConfig;
    use protocol::{BlockChange, BlockPos, BlockState, PacketRecord, ProtocolRegistry};

    const VERSION: u32 = 763;

    fn adapter() -> LaneAdapter {
        let engine = Engine::new(
            Arc::new(ProtocolRegistry::standard()),
            EngineConfig::default(),
            None,
        )
        .unwrap();
        LaneAdapter::new(Arc::new(engine))
    }

    fn block_change(x: i32, state: u32) -> Vec<u8> {
        ProtocolRegistry::standard()
            .encode(
                &PacketRecord::BlockChange(BlockChange::new(
                    BlockPos::new(x, 64, 0),
                    BlockState(state),
                )),
                VERSION,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_through_lane() {
        let adapter = adapter();
        adapter.connect(1, VERSION).await;
        assert_eq!(adapter.lane_count().await, 1);

        let action = adapter
            .submit(1, Direction::Outbound, block_change(0, 1))
            .await
            .unwrap();
        assert_eq!(action, Action::PassThrough);

        let stats = adapter.disconnect(1).await.unwrap();
        assert_eq!(stats.packets_out, 1);
        assert_eq!(adapter.lane_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let adapter = adapter();
        assert_eq!(
            adapter.submit(5, Direction::Inbound, vec![0]).await,
            Err(LaneError::UnknownConnection(5))
        );
        assert_eq!(adapter.probe(5).await, Err(LaneError::UnknownConnection(5)));
        assert!(adapter.disconnect(5).await.is_none());
    }

    #[tokio::test]
    async fn test_queued_packets_are_handled_before_disconnect() {
        let adapter = adapter();
        adapter.connect(1, VERSION).await;

        let mut receivers = Vec::new();
        for x in 0..10 {
            receivers.push(
                adapter
                    .enqueue(1, Direction::Outbound, block_change(x, 1))
                    .await
                    .unwrap(),
            );
        }

        let stats = adapter.disconnect(1).await.unwrap();
        assert_eq!(stats.packets_out, 10);
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap(), Action::PassThrough);
        }
    }

    #[tokio::test]
    async fn test_probe_through_lane() {
        let adapter = adapter();
        adapter.connect(1, VERSION).await;
        let probe = adapter.probe(1).await.unwrap().unwrap();

        let registry = ProtocolRegistry::standard();
        match registry.decode(&probe, VERSION, Direction::Outbound) {
            Ok(Some(PacketRecord::ConfirmProbe(confirmation))) => {
                assert_eq!(confirmation.id(), -1)
            }
            other => panic!("Unexpected probe: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ticker_advances_engine() {
        let adapter = adapter();
        let ticker = adapter.spawn_ticker(Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        ticker.abort();

        assert!(adapter.ticks() >= 1);
        assert_eq!(adapter.engine().now(), adapter.ticks());
    }

    #[test]
    fn test_lane_error_messages() {
        assert_eq!(
            LaneError::UnknownConnection(3).to_string(),
            "connection 3 has no lane"
        );
        assert_eq!(
            LaneError::Closed(3).to_string(),
            "lane for connection 3 has shut down"
        );
    }
}
