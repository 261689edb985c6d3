//! Synthetic sessions for exercising the engine end to end.
//!
//! A [`Simulation`] owns a small server world and a set of simulated clients.
//! Each tick, clients interact with predictable objects (predicting the
//! result locally), the server sends the resulting block changes, and now and
//! then a stale update for the same position slips out after them, the
//! classic shape of a duplication window. At the end of each tick the
//! clients' views are compared against the world.
//!
//! With the guard on, every frame goes through a [`LaneAdapter`]; with it off
//! the frames reach the clients unmodified, which shows what the engine
//! prevents.

use engine::{
    Action, ConnectionId, Engine, EngineConfig, EngineError, ObjectKind, QueryError, StateQuery,
    Tick,
};
use log::{debug, info};
use protocol::{
    BlockChange, BlockPos, BlockState, Confirmation, Direction, PacketRecord, ProtocolError,
    ProtocolRegistry,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};

use crate::lane::{LaneAdapter, LaneError};

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Lane(#[from] LaneError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("engine config has no predictable kind with at least two states")]
    NoPredictableStates,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub connections: usize,
    pub ticks: Tick,
    pub protocol_version: u32,
    pub objects_per_connection: usize,
    /// Chance per object per tick that its client interacts with it.
    pub interaction_rate: f64,
    /// Chance that an interaction is followed by a stale update.
    pub stale_rate: f64,
    /// Ticks between a probe reaching a client and its reply arriving.
    pub reply_delay: Tick,
    /// Route frames through the engine.
    pub guard: bool,
    pub seed: u64,
    /// Real time per tick; `None` runs as fast as possible.
    pub tick_interval: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            connections: 4,
            ticks: 200,
            protocol_version: 763,
            objects_per_connection: 8,
            interaction_rate: 0.05,
            stale_rate: 0.3,
            reply_delay: 2,
            guard: true,
            seed: 0,
            tick_interval: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimReport {
    pub ticks: Tick,
    pub interactions: u64,
    pub stale_updates: u64,
    pub packets: u64,
    pub replaced: u64,
    pub cancelled: u64,
    pub resolved: u64,
    pub expired: u64,
    /// Sum over ticks of positions where a client disagreed with the world.
    pub desynced_ticks: u64,
    /// Positions still disagreeing when the run ended.
    pub final_desyncs: u64,
}

/// Authoritative block states, shared with the engine as its state query.
#[derive(Debug, Default)]
pub struct World {
    states: RwLock<HashMap<BlockPos, BlockState>>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: BlockPos) -> Option<BlockState> {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&position)
            .copied()
    }

    pub fn set(&self, position: BlockPos, state: BlockState) {
        self.states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(position, state);
    }
}

impl StateQuery for World {
    fn query_state(&self, position: BlockPos, _kind: ObjectKind) -> Result<BlockState, QueryError> {
        self.get(position).ok_or(QueryError::Unloaded(position))
    }
}

struct SimClient {
    id: ConnectionId,
    positions: Vec<BlockPos>,
    view: HashMap<BlockPos, BlockState>,
    replies: VecDeque<(Tick, Vec<u8>)>,
}

pub struct Simulation {
    config: SimConfig,
    registry: Arc<ProtocolRegistry>,
    world: Arc<World>,
    adapter: LaneAdapter,
    clients: Vec<SimClient>,
    states: (u32, u32),
    rng: StdRng,
    now: Tick,
    report: SimReport,
}

impl Simulation {
    pub fn new(config: SimConfig, engine_config: EngineConfig) -> Result<Self, SimError> {
        let states = engine_config
            .kinds
            .iter()
            .flat_map(|rule| rule.states.iter())
            .find(|range| range.last > range.first)
            .map(|range| (range.first, range.last))
            .ok_or(SimError::NoPredictableStates)?;

        let registry = Arc::new(ProtocolRegistry::standard());
        let world = Arc::new(World::new());
        let query: Arc<dyn StateQuery> = world.clone();
        let engine = Engine::new(Arc::clone(&registry), engine_config, Some(query))?;

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            registry,
            world,
            adapter: LaneAdapter::new(Arc::new(engine)),
            clients: Vec::new(),
            states,
            now: 0,
            report: SimReport::default(),
        })
    }

    pub fn adapter(&self) -> &LaneAdapter {
        &self.adapter
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub async fn run(mut self) -> Result<SimReport, SimError> {
        self.connect_all().await;

        let mut timer = self.config.tick_interval.map(|period| {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        for now in 1..=self.config.ticks {
            if let Some(timer) = timer.as_mut() {
                timer.tick().await;
            }
            self.step(now).await?;
        }

        self.report.final_desyncs = self.desyncs();
        self.report.ticks = self.config.ticks;
        self.disconnect_all().await;

        info!(
            "Simulation finished: {} interactions, {} stale updates, {} desynced position-ticks",
            self.report.interactions, self.report.stale_updates, self.report.desynced_ticks
        );
        Ok(self.report)
    }

    async fn connect_all(&mut self) {
        let initial = BlockState(self.states.0);
        for index in 0..self.config.connections {
            let id = index as ConnectionId + 1;
            let positions: Vec<BlockPos> = (0..self.config.objects_per_connection)
                .map(|k| BlockPos::new(index as i32 * 64 + k as i32, 64, 0))
                .collect();

            for position in &positions {
                self.world.set(*position, initial);
            }
            if self.config.guard {
                self.adapter
                    .connect(id, self.config.protocol_version)
                    .await;
            }

            self.clients.push(SimClient {
                id,
                view: positions.iter().map(|p| (*p, initial)).collect(),
                positions,
                replies: VecDeque::new(),
            });
        }
    }

    async fn disconnect_all(&mut self) {
        if !self.config.guard {
            return;
        }
        for client in &self.clients {
            if let Some(stats) = self.adapter.disconnect(client.id).await {
                self.report.replaced += stats.replaced;
                self.report.cancelled += stats.cancelled;
                self.report.resolved += stats.resolved;
                self.report.expired += stats.expired;
            }
        }
    }

    async fn step(&mut self, now: Tick) -> Result<(), SimError> {
        self.now = now;
        if self.config.guard {
            self.adapter.engine().tick(now);
        }

        for index in 0..self.clients.len() {
            self.deliver_replies(index, now).await?;

            for slot in 0..self.clients[index].positions.len() {
                if self.rng.gen_bool(self.config.interaction_rate) {
                    self.interact(index, slot).await?;
                }
            }

            self.send_probe(index).await?;
        }

        self.report.desynced_ticks += self.desyncs();
        Ok(())
    }

    /// Client predicts a new state, the server accepts it and tells the
    /// client, and maybe a stale update follows.
    async fn interact(&mut self, index: usize, slot: usize) -> Result<(), SimError> {
        let position = self.clients[index].positions[slot];
        let previous = self.world.get(position).unwrap_or(BlockState(self.states.0));
        let mut next = previous;
        while next == previous {
            next = BlockState(self.rng.gen_range(self.states.0..=self.states.1));
        }

        self.clients[index].view.insert(position, next);
        self.world.set(position, next);
        self.report.interactions += 1;
        self.send_block_change(index, BlockChange::new(position, next))
            .await?;

        if self.rng.gen_bool(self.config.stale_rate) {
            self.report.stale_updates += 1;
            debug!(
                "Client {}: stale update {:?} at {} after {:?}",
                self.clients[index].id, previous, position, next
            );
            self.send_block_change(index, BlockChange::new(position, previous))
                .await?;
        }
        Ok(())
    }

    async fn send_block_change(
        &mut self,
        index: usize,
        change: BlockChange,
    ) -> Result<(), SimError> {
        let raw = self.registry.encode(
            &PacketRecord::BlockChange(change),
            self.config.protocol_version,
        )?;
        self.deliver(index, raw).await
    }

    /// Closes the client's tick with a confirmation probe.
    async fn send_probe(&mut self, index: usize) -> Result<(), SimError> {
        if !self.config.guard {
            return Ok(());
        }
        let id = self.clients[index].id;
        if let Some(probe) = self.adapter.probe(id).await? {
            self.deliver(index, probe).await?;
        }
        Ok(())
    }

    async fn deliver_replies(&mut self, index: usize, now: Tick) -> Result<(), SimError> {
        let id = self.clients[index].id;
        loop {
            let replies = &mut self.clients[index].replies;
            if !matches!(replies.front(), Some((due, _)) if *due <= now) {
                break;
            }
            if let Some((_, reply)) = replies.pop_front() {
                self.report.packets += 1;
                self.adapter.submit(id, Direction::Inbound, reply).await?;
            }
        }
        Ok(())
    }

    /// Sends one outbound frame to a client, through the engine when guarded.
    async fn deliver(&mut self, index: usize, raw: Vec<u8>) -> Result<(), SimError> {
        self.report.packets += 1;
        let forwarded = if self.config.guard {
            let id = self.clients[index].id;
            match self
                .adapter
                .submit(id, Direction::Outbound, raw.clone())
                .await?
            {
                Action::PassThrough => Some(raw),
                Action::Replace(bytes) => Some(bytes),
                Action::Cancel => None,
            }
        } else {
            Some(raw)
        };

        if let Some(bytes) = forwarded {
            self.receive(index, &bytes)?;
        }
        Ok(())
    }

    /// Client side handling of a frame that made it through.
    fn receive(&mut self, index: usize, raw: &[u8]) -> Result<(), SimError> {
        let version = self.config.protocol_version;
        let due = self.now + self.config.reply_delay;
        let record = self.registry.decode(raw, version, Direction::Outbound)?;
        let client = &mut self.clients[index];

        match record {
            Some(PacketRecord::BlockChange(change)) => {
                client.view.insert(change.position, change.state);
            }
            Some(PacketRecord::ConfirmProbe(probe)) => {
                let reply = match probe {
                    Confirmation::Ping { id } => Confirmation::Ping { id },
                    Confirmation::Transaction {
                        window_id, action, ..
                    } => Confirmation::Transaction {
                        window_id,
                        action,
                        accepted: true,
                    },
                };
                let bytes = self
                    .registry
                    .encode(&PacketRecord::ConfirmReply(reply), version)?;
                client.replies.push_back((due, bytes));
            }
            _ => {}
        }
        Ok(())
    }

    fn desyncs(&self) -> u64 {
        self.clients
            .iter()
            .flat_map(|client| client.view.iter())
            .filter(|(position, state)| self.world.get(**position) != Some(**state))
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{KindRule, StateRange};

    fn busy() -> SimConfig {
        SimConfig {
            connections: 3,
            ticks: 60,
            objects_per_connection: 6,
            interaction_rate: 0.2,
            stale_rate: 1.0,
            seed: 7,
            ..SimConfig::default()
        }
    }

    #[tokio::test]
    async fn test_guarded_run_never_desyncs() {
        let simulation = Simulation::new(busy(), EngineConfig::default()).unwrap();
        let report = simulation.run().await.unwrap();

        assert!(report.interactions > 0);
        assert_eq!(report.stale_updates, report.interactions);
        assert!(report.replaced > 0);
        assert!(report.resolved > 0);
        assert_eq!(report.desynced_ticks, 0);
        assert_eq!(report.final_desyncs, 0);
    }

    #[tokio::test]
    async fn test_unguarded_run_desyncs() {
        let config = SimConfig {
            guard: false,
            ..busy()
        };
        let report = Simulation::new(config, EngineConfig::default())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert!(report.desynced_ticks > 0);
        assert_eq!(report.replaced, 0);
        assert_eq!(report.resolved, 0);
    }

    #[tokio::test]
    async fn test_legacy_transactions() {
        let config = SimConfig {
            protocol_version: 340,
            ..busy()
        };
        let report = Simulation::new(config, EngineConfig::default())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert!(report.resolved > 0);
        assert_eq!(report.desynced_ticks, 0);
    }

    #[tokio::test]
    async fn test_slow_replies_expire() {
        let engine_config = EngineConfig::with_kinds(vec![KindRule::new(
            ObjectKind::Anvil,
            vec![StateRange::new(100, 111)],
            3,
        )]);
        let config = SimConfig {
            reply_delay: 10,
            ..busy()
        };
        let report = Simulation::new(config, engine_config)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert!(report.expired > 0);
    }

    #[test]
    fn test_needs_predictable_states() {
        let engine_config = EngineConfig::with_kinds(vec![KindRule::new(
            ObjectKind::Lever,
            vec![StateRange::new(5, 5)],
            3,
        )]);
        match Simulation::new(SimConfig::default(), engine_config) {
            Err(SimError::NoPredictableStates) => {}
            Err(e) => panic!("Unexpected error: {}", e),
            Ok(_) => panic!("Unexpected success"),
        }
    }

    #[test]
    fn test_world_answers_queries() {
        let world = World::new();
        let position = BlockPos::new(1, 2, 3);
        assert_eq!(
            world.query_state(position, ObjectKind::Door),
            Err(QueryError::Unloaded(position))
        );

        world.set(position, BlockState(9));
        assert_eq!(
            world.query_state(position, ObjectKind::Door),
            Ok(BlockState(9))
        );
    }

    #[test]
    fn test_run_with_block_on() {
        let config = SimConfig {
            connections: 1,
            ticks: 5,
            ..SimConfig::default()
        };
        let simulation = Simulation::new(config, EngineConfig::default()).unwrap();
        let report = tokio_test::block_on(simulation.run()).unwrap();
        assert_eq!(report.ticks, 5);
    }
}
