//! Engine configuration and the catalogue of predictable object kinds.
//!
//! Which block states the client predicts, and for how long, depends on the
//! game version the host runs. None of it is baked into the engine: the host
//! supplies an [`EngineConfig`] at startup. The defaults are an example
//! catalogue, not tuning data for any particular version.

use protocol::{BlockState, ConfirmationStyle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::tracker::Tick;

/// Interactive objects the client renders before the server confirms them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Anvil,
    Trapdoor,
    Door,
    FenceGate,
    Container,
    Lever,
    Button,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::Anvil,
        ObjectKind::Trapdoor,
        ObjectKind::Door,
        ObjectKind::FenceGate,
        ObjectKind::Container,
        ObjectKind::Lever,
        ObjectKind::Button,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Anvil => "anvil",
            ObjectKind::Trapdoor => "trapdoor",
            ObjectKind::Door => "door",
            ObjectKind::FenceGate => "fence_gate",
            ObjectKind::Container => "container",
            ObjectKind::Lever => "lever",
            ObjectKind::Button => "button",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive range of raw block-state ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRange {
    pub first: u32,
    pub last: u32,
}

impl StateRange {
    pub const fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }

    pub fn contains(&self, state: BlockState) -> bool {
        self.first <= state.id() && state.id() <= self.last
    }

    pub fn overlaps(&self, other: &StateRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

impl fmt::Display for StateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}

/// Block states belonging to one kind, and how long the client's prediction
/// of them stays suspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindRule {
    pub kind: ObjectKind,
    pub states: Vec<StateRange>,
    pub ttl_ticks: Tick,
}

impl KindRule {
    pub fn new(kind: ObjectKind, states: Vec<StateRange>, ttl_ticks: Tick) -> Self {
        Self {
            kind,
            states,
            ttl_ticks,
        }
    }
}

/// Confirmation ids reserved for the engine's own probes. `start` may be
/// greater than `end`; ids are handed out from `start` towards `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: i32,
    pub end: i32,
}

impl IdRange {
    pub const fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn low(&self) -> i32 {
        self.start.min(self.end)
    }

    pub fn high(&self) -> i32 {
        self.start.max(self.end)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.low() <= id && id <= self.high()
    }

    /// Clamps both ends into what `style` can carry.
    pub fn clamp_to(&self, style: ConfirmationStyle) -> IdRange {
        let (lower, upper) = style.id_bounds();
        IdRange {
            start: self.start.clamp(lower, upper),
            end: self.end.clamp(lower, upper),
        }
    }

    /// Id following `current`, wrapping back to `start` after `end`.
    pub fn step(&self, current: i32) -> i32 {
        if current == self.end || !self.contains(current) {
            self.start
        } else if self.start <= self.end {
            current + 1
        } else {
            current - 1
        }
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} has a zero tick TTL")]
    ZeroTtl(ObjectKind),
    #[error("default TTL must be at least one tick")]
    ZeroDefaultTtl,
    #[error("{kind} lists empty state range {range}")]
    EmptyStateRange { kind: ObjectKind, range: StateRange },
    #[error("{0} has more than one rule")]
    DuplicateKind(ObjectKind),
    #[error("state range {range} of {second} overlaps a range of {first}")]
    OverlappingStates {
        first: ObjectKind,
        second: ObjectKind,
        range: StateRange,
    },
    #[error("max_tracked must be at least 1")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Predictable kinds, their block states, and TTLs.
    pub kinds: Vec<KindRule>,
    /// TTL for a kind with no rule of its own.
    pub default_ttl_ticks: Tick,
    /// Ids the engine may use for its confirmation probes.
    pub confirmation_range: IdRange,
    /// Cancel replies to the engine's own probes instead of letting the host
    /// see them.
    pub consume_confirmations: bool,
    /// Upper bound on tracked objects per connection.
    pub max_tracked: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        use ObjectKind::*;

        Self {
            kinds: vec![
                KindRule::new(Anvil, vec![StateRange::new(9107, 9118)], 40),
                KindRule::new(Trapdoor, vec![StateRange::new(5891, 6402)], 20),
                KindRule::new(
                    Door,
                    vec![StateRange::new(4518, 4581), StateRange::new(11996, 12379)],
                    20,
                ),
                KindRule::new(
                    FenceGate,
                    vec![StateRange::new(6770, 6801), StateRange::new(11707, 11866)],
                    20,
                ),
                KindRule::new(
                    Container,
                    vec![
                        StateRange::new(2954, 2977),
                        StateRange::new(7516, 7539),
                        StateRange::new(11254, 11265),
                    ],
                    40,
                ),
                KindRule::new(Lever, vec![StateRange::new(5626, 5649)], 10),
                KindRule::new(Button, vec![StateRange::new(7847, 8094)], 10),
            ],
            default_ttl_ticks: 20,
            confirmation_range: IdRange::new(-1, i32::from(i16::MIN)),
            consume_confirmations: true,
            max_tracked: 1024,
        }
    }
}

impl EngineConfig {
    /// Config with the given kinds and default everything else.
    pub fn with_kinds(kinds: Vec<KindRule>) -> Self {
        Self {
            kinds,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tracked == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.default_ttl_ticks == 0 {
            return Err(ConfigError::ZeroDefaultTtl);
        }

        let mut claimed: Vec<(StateRange, ObjectKind)> = Vec::new();
        for (index, rule) in self.kinds.iter().enumerate() {
            if self.kinds[..index].iter().any(|r| r.kind == rule.kind) {
                return Err(ConfigError::DuplicateKind(rule.kind));
            }
            if rule.ttl_ticks == 0 {
                return Err(ConfigError::ZeroTtl(rule.kind));
            }
            for range in &rule.states {
                if range.is_empty() {
                    return Err(ConfigError::EmptyStateRange {
                        kind: rule.kind,
                        range: *range,
                    });
                }
                if let Some((_, owner)) = claimed.iter().find(|(r, _)| r.overlaps(range)) {
                    return Err(ConfigError::OverlappingStates {
                        first: *owner,
                        second: rule.kind,
                        range: *range,
                    });
                }
                claimed.push((*range, rule.kind));
            }
        }

        Ok(())
    }

    pub fn catalogue(&self) -> PredictionCatalogue {
        PredictionCatalogue::from_config(self)
    }
}

/// Lookup table built from a validated config: block state to kind, kind to TTL.
#[derive(Debug, Clone, Default)]
pub struct PredictionCatalogue {
    ranges: Vec<(StateRange, ObjectKind)>,
    ttls: HashMap<ObjectKind, Tick>,
    default_ttl: Tick,
}

impl PredictionCatalogue {
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut ranges: Vec<(StateRange, ObjectKind)> = config
            .kinds
            .iter()
            .flat_map(|rule| rule.states.iter().map(move |range| (*range, rule.kind)))
            .collect();
        ranges.sort_by_key(|(range, _)| range.first);

        let ttls = config
            .kinds
            .iter()
            .map(|rule| (rule.kind, rule.ttl_ticks))
            .collect();

        Self {
            ranges,
            ttls,
            default_ttl: config.default_ttl_ticks,
        }
    }

    /// Kind of object `state` belongs to, if the client predicts it.
    pub fn kind_of(&self, state: BlockState) -> Option<ObjectKind> {
        let index = self
            .ranges
            .partition_point(|(range, _)| range.last < state.id());
        self.ranges
            .get(index)
            .filter(|(range, _)| range.contains(state))
            .map(|(_, kind)| *kind)
    }

    pub fn ttl(&self, kind: ObjectKind) -> Tick {
        self.ttls.get(&kind).copied().unwrap_or(self.default_ttl)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
