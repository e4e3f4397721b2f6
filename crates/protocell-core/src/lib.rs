//! Core types and simulation engine for the protocell artificial-life world.
//!
//! Entities roam a bounded 2-D grid, draw energy from a diffusing field,
//! collide, bond into cooperating groups, divide under energetic stress, and
//! adapt behavioral patterns through delayed reward evaluation. Rendering and
//! telemetry layers consume read-only snapshots and inject [`ControlCommand`]s;
//! they never mutate simulation state directly.

use ordered_float::OrderedFloat;
use protocell_index::{NeighborhoodIndex, UniformGridIndex};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::cmp::Reverse;
use std::collections::{HashSet, VecDeque};
use std::f64::consts::TAU;
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for entities backed by a generational slot map.
    pub struct EntityId;
}

/// Convenience alias for associating side data with entities.
pub type EntityMap<T> = SecondaryMap<EntityId, T>;

/// Fixed energy budget shared between the field and all entities.
pub const TOTAL_SYSTEM_ENERGY: f64 = 100.0;

const COLLISION_IMPULSE: f64 = 0.05;
const COLLISION_ENERGY_LOSS: f64 = 0.001;
const COLLISION_CANDIDATE_RADIUS_SQ: f64 = 4.0;
const COLLISION_WINDOW: u64 = 30;
const COLLISION_WINDOW_LIMIT: u32 = 8;

const PROXIMITY_BASE_RANGE: f64 = 3.0;
const PROXIMITY_THICKNESS_RANGE: f64 = 2.0;
const PROXIMITY_INTERFERENCE_RATE: f64 = 0.03;
const PROXIMITY_RESONANCE_FLOOR: f64 = 0.7;

const MEMORY_SHARE_IMPACT: f64 = 0.2;
const MEMORY_SHARE_ENERGY_FLOOR: f64 = 0.4;
const MEMORY_SHARE_RESONANCE: f64 = 0.7;
const MEMORY_SHARE_MUTUAL_RESONANCE: f64 = 0.85;
const MEMORY_SHARE_RELEVANCE: f64 = 0.6;

const MERGE_PERMEABILITY_FLOOR: f64 = 0.4;
const MERGE_RESONANCE_FLOOR: f64 = 0.6;
const MERGE_ENERGY_FLOOR: f64 = 0.3;
const MERGE_GROUP_LIMIT: usize = 5;

const DEATH_INTEGRITY_FLOOR: f64 = 0.05;
const DEATH_DEPOSIT_RADIUS: f64 = 5.0;
const DEATH_DEPOSIT_LIMIT: usize = 3;
const RING_RETURN_STEPS: usize = 5;

const PATTERN_SHARE_SUCCESS: f64 = 0.7;
const PATTERN_INHERIT_SUCCESS: f64 = 0.6;
const PATTERN_DEPOSIT_SUCCESS: f64 = 0.8;
const PATTERN_SYNTHESIS_PROBABILITY: f64 = 0.01;
const ABSTRACTION_TOLERANCE: f64 = 0.15;

const CHEMOTAXIS_RADIUS: f64 = 3.0;
const CHEMOTAXIS_MARGIN: f64 = 0.05;

const OSCILLATION_FLOOR: f64 = 0.1;
const OSCILLATION_CEIL: f64 = 0.9;
const OSCILLATION_HISTORY_CAPACITY: usize = 50;
const VIBRATION_LOG_CAPACITY: usize = 30;
const RECENT_GAIN_CAPACITY: usize = 10;

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn grid_cell(position: Position) -> (i64, i64) {
    (position.x.floor() as i64, position.y.floor() as i64)
}

/// Per-entity time dilation applied to decay and movement magnitudes.
///
/// Derived from energy plus a sinusoidal ambient factor so low-energy
/// entities experience a slower metabolic clock.
fn subjective_time(energy: f64, tick: Tick, simulation_speed: f64) -> f64 {
    (0.5 + 0.5 * energy) * (1.0 + 0.2 * (tick.0 as f64 * 0.1).sin()) * simulation_speed
}

fn blend_angle(a: f64, b: f64) -> f64 {
    let x = a.cos() + b.cos();
    let y = a.sin() + b.sin();
    if x.abs() < 1e-12 && y.abs() < 1e-12 {
        a
    } else {
        y.atan2(x)
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Continuous 2D position in grid space.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Velocity vector in grid units per tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f64, vy: f64) -> Self {
        Self { vx, vy }
    }

    /// Scalar speed.
    #[must_use]
    pub fn speed(self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

/// Errors raised when validating simulation configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a protocell world.
///
/// The many hand-tuned cadence and threshold values are deliberate empirical
/// tuning carried over from long-running colonies; they are exposed here as
/// named fields rather than being rederived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Grid width in cells.
    pub grid_width: u32,
    /// Grid height in cells.
    pub grid_height: u32,
    /// Fixed total energy shared between field, entities, and return queues.
    pub total_energy: f64,
    /// Fraction of a cell's energy redistributed to neighbors per diffusion pass.
    pub diffusion_rate: f64,
    /// Ticks between diffusion passes.
    pub diffusion_interval: u32,
    /// Ticks between conservation checks; 0 disables the diagnostic.
    pub conservation_interval: u32,
    /// Ticks between memory compression/integration passes.
    pub memory_interval: u32,
    /// Ticks between pattern abstraction passes; 0 disables abstraction.
    pub abstraction_interval: u32,
    /// Ticks between optimal-resonance searches.
    pub resonance_search_interval: u32,
    /// Delay in ticks before a pattern application is scored.
    pub pattern_eval_delay: u32,
    /// Ticks a peer-shared memory survives before expiry.
    pub shared_memory_ttl: u64,
    /// Baseline per-tick energy decay before membrane/time scaling.
    pub base_energy_decay: f64,
    /// Baseline per-tick field extraction before permeability scaling.
    pub energy_intake_rate: f64,
    /// Minimum energy required before division can trigger.
    pub division_energy_threshold: f64,
    /// Probability an eligible collision actually bonds the pair.
    pub merge_attempt_probability: f64,
    /// Hard population cap.
    pub max_entities: usize,
    /// Entities seeded at the grid center on construction.
    pub initial_entities: usize,
    /// Energy assigned to each seeded entity.
    pub initial_entity_energy: f64,
    /// Energy requested from the field for command-spawned entities.
    pub default_entity_energy: f64,
    /// Speed clamp applied after every velocity mutation.
    pub max_speed: f64,
    /// Soft boundary band width in cells.
    pub boundary_margin: f64,
    /// Restoring force applied inside the boundary band.
    pub boundary_force: f64,
    /// Maximum learned patterns retained per entity.
    pub memory_capacity: usize,
    /// Maximum queued energy refunds drained back into the field per tick.
    pub return_drain_limit: usize,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Global time multiplier applied through subjective time.
    pub simulation_speed: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            grid_width: 180,
            grid_height: 100,
            total_energy: TOTAL_SYSTEM_ENERGY,
            diffusion_rate: 0.05,
            diffusion_interval: 3,
            conservation_interval: 50,
            memory_interval: 20,
            abstraction_interval: 100,
            resonance_search_interval: 30,
            pattern_eval_delay: 30,
            shared_memory_ttl: 500,
            base_energy_decay: 0.0001,
            energy_intake_rate: 0.01,
            division_energy_threshold: 0.7,
            merge_attempt_probability: 0.5,
            max_entities: 4000,
            initial_entities: 3,
            initial_entity_energy: 0.8,
            default_entity_energy: 0.7,
            max_speed: 0.5,
            boundary_margin: 5.0,
            boundary_force: 0.05,
            memory_capacity: 10,
            return_drain_limit: 5,
            history_capacity: 512,
            simulation_speed: 1.0,
            rng_seed: None,
        }
    }
}

impl SimulationConfig {
    /// Validate the configuration before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(ConfigError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if !(0.0..1.0).contains(&self.diffusion_rate) {
            return Err(ConfigError::InvalidConfig(
                "diffusion_rate must be in [0, 1)",
            ));
        }
        if self.diffusion_interval == 0
            || self.memory_interval == 0
            || self.resonance_search_interval == 0
        {
            return Err(ConfigError::InvalidConfig(
                "diffusion, memory, and resonance intervals must be non-zero",
            ));
        }
        if self.total_energy <= 0.0 {
            return Err(ConfigError::InvalidConfig("total_energy must be positive"));
        }
        if !(0.0..=1.0).contains(&self.initial_entity_energy)
            || !(0.0..=1.0).contains(&self.default_entity_energy)
        {
            return Err(ConfigError::InvalidConfig(
                "entity energies must be in [0, 1]",
            ));
        }
        if self.initial_entities as f64 * self.initial_entity_energy > self.total_energy {
            return Err(ConfigError::InvalidConfig(
                "initial colony energy exceeds total_energy",
            ));
        }
        if self.max_entities == 0 || self.initial_entities > self.max_entities {
            return Err(ConfigError::InvalidConfig(
                "max_entities must be non-zero and cover the initial colony",
            ));
        }
        if self.division_energy_threshold <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "division_energy_threshold must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.merge_attempt_probability) {
            return Err(ConfigError::InvalidConfig(
                "merge_attempt_probability must be in [0, 1]",
            ));
        }
        if self.max_speed <= 0.0 || self.simulation_speed <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "max_speed and simulation_speed must be positive",
            ));
        }
        if self.boundary_margin < 0.0
            || self.boundary_force < 0.0
            || 2.0 * self.boundary_margin >= f64::from(self.grid_width.min(self.grid_height))
        {
            return Err(ConfigError::InvalidConfig(
                "boundary band must be non-negative and fit inside the grid",
            ));
        }
        if self.base_energy_decay < 0.0 || self.energy_intake_rate < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "decay and intake rates must be non-negative",
            ));
        }
        if self.memory_capacity == 0 || self.return_drain_limit == 0 || self.history_capacity == 0
        {
            return Err(ConfigError::InvalidConfig(
                "memory_capacity, return_drain_limit, and history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed was given.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Fixed-capacity ring buffer with an overwrite cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    cursor: usize,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` values.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            cursor: 0,
            capacity,
        }
    }

    /// Append a value, overwriting the oldest entry once full.
    pub fn push(&mut self, value: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
        } else {
            self.slots[self.cursor] = value;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of retained values.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over stored values in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

impl RingBuffer<f64> {
    /// Arithmetic mean of the stored values, zero when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        self.slots.iter().sum::<f64>() / self.slots.len() as f64
    }
}

/// 2D grid of energy cells with diffusion and strict conservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyField {
    width: u32,
    height: u32,
    cells: Vec<f64>,
    weights: Vec<f64>,
    scratch: Vec<f64>,
    diffusion_rate: f64,
}

impl EnergyField {
    /// Construct an empty field with procedural initialization weights.
    ///
    /// `noise_seed` offsets the sinusoidal weight pattern so different runs
    /// start from different spatial distributions.
    pub fn new(
        width: u32,
        height: u32,
        diffusion_rate: f64,
        noise_seed: (f64, f64),
    ) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidConfig(
                "field dimensions must be non-zero",
            ));
        }
        if !(0.0..1.0).contains(&diffusion_rate) {
            return Err(ConfigError::InvalidConfig(
                "diffusion_rate must be in [0, 1)",
            ));
        }
        let len = (width as usize) * (height as usize);
        let mut weights = vec![0.0; len];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let nx = x as f64 * 0.1 + noise_seed.0;
                let ny = y as f64 * 0.1 + noise_seed.1;
                let value =
                    (nx.sin() * ny.sin() + (nx * 0.5).sin() * (ny * 0.5).sin() + 1.0) / 3.0;
                weights[y * width as usize + x] = value.max(0.0);
            }
        }
        Ok(Self {
            width,
            height,
            cells: vec![0.0; len],
            weights,
            scratch: vec![0.0; len],
            diffusion_rate,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Flat read-only view over all cells, row-major.
    #[must_use]
    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    fn cell_index(&self, position: Position) -> Option<usize> {
        let x = position.x.floor();
        let y = position.y.floor();
        if x < 0.0 || y < 0.0 || x >= f64::from(self.width) || y >= f64::from(self.height) {
            return None;
        }
        Some(self.offset(x as u32, y as u32))
    }

    fn clamped_index(&self, position: Position) -> usize {
        let x = position
            .x
            .floor()
            .clamp(0.0, f64::from(self.width - 1)) as u32;
        let y = position
            .y
            .floor()
            .clamp(0.0, f64::from(self.height - 1)) as u32;
        self.offset(x, y)
    }

    /// Read accessor for a single cell; out-of-bounds coordinates read as zero.
    #[must_use]
    pub fn cell_energy(&self, x: u32, y: u32) -> f64 {
        if x < self.width && y < self.height {
            self.cells[self.offset(x, y)]
        } else {
            0.0
        }
    }

    /// Energy at the cell containing `position`; zero when out of bounds.
    #[must_use]
    pub fn sample(&self, position: Position) -> f64 {
        self.cell_index(position)
            .map_or(0.0, |idx| self.cells[idx])
    }

    /// Withdraw up to `requested` energy from the cell under `position`.
    ///
    /// Returns the amount actually granted; out-of-bounds positions grant zero.
    pub fn extract(&mut self, position: Position, requested: f64) -> f64 {
        let Some(idx) = self.cell_index(position) else {
            return 0.0;
        };
        let granted = requested.max(0.0).min(self.cells[idx]);
        self.cells[idx] -= granted;
        granted
    }

    /// Deposit `amount` into the cell nearest `position`.
    ///
    /// The position is clamped into bounds so no energy is ever discarded.
    pub fn inject(&mut self, position: Position, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        let idx = self.clamped_index(position);
        self.cells[idx] += amount;
    }

    /// Distribute `total` across the grid proportionally to the noise weights.
    pub fn seed_energy(&mut self, total: f64) {
        if total <= 0.0 {
            return;
        }
        let weight_sum: f64 = self.weights.iter().sum();
        if weight_sum <= 0.0 {
            let share = total / self.cells.len() as f64;
            for cell in &mut self.cells {
                *cell += share;
            }
            return;
        }
        for (cell, weight) in self.cells.iter_mut().zip(&self.weights) {
            *cell += total * weight / weight_sum;
        }
    }

    /// One diffusion pass over a snapshot of the previous state.
    ///
    /// Each cell sends `energy * rate / 8` to every in-bounds 8-neighbor; the
    /// share belonging to out-of-bounds neighbors stays put, so a pass
    /// redistributes but never creates or destroys energy.
    pub fn diffuse(&mut self) {
        let rate = self.diffusion_rate;
        if rate <= 0.0 {
            return;
        }
        let width = self.width as usize;
        let height = self.height as usize;
        self.scratch.copy_from_slice(&self.cells);
        let previous = &self.scratch;
        self.cells
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, cell)| {
                let x = (idx % width) as isize;
                let y = (idx / width) as isize;
                let share = previous[idx] * rate / 8.0;
                let mut value = previous[idx];
                for dy in -1_isize..=1 {
                    for dx in -1_isize..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = x + dx;
                        let ny = y + dy;
                        if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                            continue;
                        }
                        let nidx = ny as usize * width + nx as usize;
                        value -= share;
                        value += previous[nidx] * rate / 8.0;
                    }
                }
                *cell = value.max(0.0);
            });
    }

    /// Sum of all cell energies.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.cells.iter().sum()
    }
}

/// Discriminant for learned behavior patterns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Vibration,
    Membrane,
    Movement,
    VibrationMovement,
    Maintain,
}

/// A learned, typed parameter set an entity can apply to bias its behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum BehaviorPattern {
    /// Pull oscillation toward a target frequency with a small motion kick.
    Vibration { frequency: f64, amplitude: f64 },
    /// Nudge membrane transport properties toward remembered values.
    Membrane { permeability: f64, elasticity: f64 },
    /// Directed thrust, optionally coupled back into oscillation.
    Movement {
        speed: f64,
        direction: f64,
        oscillation_based: bool,
    },
    /// Phase-locked spiral motion driven by an oscillation carrier.
    VibrationMovement {
        frequency: f64,
        amplitude: f64,
        phase_shift: f64,
        direction_bias: f64,
    },
    /// Hold steady; success means energy was preserved.
    Maintain,
}

impl BehaviorPattern {
    /// Variant discriminant.
    #[must_use]
    pub const fn kind(&self) -> PatternKind {
        match self {
            Self::Vibration { .. } => PatternKind::Vibration,
            Self::Membrane { .. } => PatternKind::Membrane,
            Self::Movement { .. } => PatternKind::Movement,
            Self::VibrationMovement { .. } => PatternKind::VibrationMovement,
            Self::Maintain => PatternKind::Maintain,
        }
    }

    /// Dominant tunable parameter, used when clustering similar patterns.
    #[must_use]
    pub fn primary_parameter(&self) -> f64 {
        match self {
            Self::Vibration { frequency, .. } | Self::VibrationMovement { frequency, .. } => {
                *frequency
            }
            Self::Membrane { permeability, .. } => *permeability,
            Self::Movement { speed, .. } => *speed,
            Self::Maintain => 0.0,
        }
    }

    /// Average two same-kind patterns; mismatched kinds keep `self`.
    #[must_use]
    pub fn blend(&self, other: &Self) -> Self {
        match (*self, *other) {
            (
                Self::Vibration {
                    frequency: f1,
                    amplitude: a1,
                },
                Self::Vibration {
                    frequency: f2,
                    amplitude: a2,
                },
            ) => Self::Vibration {
                frequency: (f1 + f2) * 0.5,
                amplitude: (a1 + a2) * 0.5,
            },
            (
                Self::Membrane {
                    permeability: p1,
                    elasticity: e1,
                },
                Self::Membrane {
                    permeability: p2,
                    elasticity: e2,
                },
            ) => Self::Membrane {
                permeability: (p1 + p2) * 0.5,
                elasticity: (e1 + e2) * 0.5,
            },
            (
                Self::Movement {
                    speed: s1,
                    direction: d1,
                    oscillation_based,
                },
                Self::Movement {
                    speed: s2,
                    direction: d2,
                    ..
                },
            ) => Self::Movement {
                speed: (s1 + s2) * 0.5,
                direction: blend_angle(d1, d2),
                oscillation_based,
            },
            (
                Self::VibrationMovement {
                    frequency: f1,
                    amplitude: a1,
                    phase_shift: p1,
                    direction_bias: b1,
                },
                Self::VibrationMovement {
                    frequency: f2,
                    amplitude: a2,
                    phase_shift: p2,
                    direction_bias: b2,
                },
            ) => Self::VibrationMovement {
                frequency: (f1 + f2) * 0.5,
                amplitude: (a1 + a2) * 0.5,
                phase_shift: blend_angle(p1, p2),
                direction_bias: if b1 + b2 >= 0.0 { 1.0 } else { -1.0 },
            },
            (first, _) => first,
        }
    }
}

/// Entity state captured when a pattern is created, used for relevance scoring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PatternConditions {
    pub energy: f64,
    pub oscillation: f64,
    pub stability: f64,
}

impl PatternConditions {
    /// Similarity in [0, 1] between two condition snapshots.
    #[must_use]
    pub fn similarity(&self, other: &Self) -> f64 {
        let energy = 1.0 - (self.energy - other.energy).abs();
        let oscillation = 1.0 - (self.oscillation - other.oscillation).abs();
        let stability = 1.0 - (self.stability - other.stability).abs();
        clamp01((energy + oscillation + stability) / 3.0)
    }
}

/// A behavior pattern plus its learning bookkeeping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PatternRecord {
    /// Identifier unique within the owning entity's memory.
    pub id: u64,
    pub pattern: BehaviorPattern,
    pub conditions: PatternConditions,
    pub success_rate: f64,
    pub strength: f64,
    pub usage_count: u64,
    pub last_used: Tick,
    /// True when the record arrived via inheritance, sharing, or dispersal.
    pub inherited: bool,
}

impl PatternRecord {
    /// Composite score used to rank records during memory compression.
    #[must_use]
    pub fn importance(&self, now: Tick) -> f64 {
        let usage = (self.usage_count as f64 / 10.0).min(1.0);
        let age = now.0.saturating_sub(self.last_used.0) as f64;
        self.success_rate * 0.4 + usage * 0.3 + self.strength * 0.3 - age * 0.0001
    }

    /// Fold one delayed reward observation into the record.
    pub fn record_outcome(&mut self, success: bool) {
        self.success_rate = clamp01(self.success_rate * 0.9 + if success { 0.1 } else { 0.0 });
        if success {
            self.strength = (self.strength * 1.05).min(1.0);
        } else {
            self.strength = (self.strength * 0.98).max(0.1);
        }
    }
}

/// A pattern copy received from a peer, pending integration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SharedMemory {
    pub record: PatternRecord,
    pub relevance: f64,
    pub received_at: Tick,
}

/// Bounded store of learned and peer-shared behavior patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptiveMemory {
    pub patterns: Vec<PatternRecord>,
    pub shared: Vec<SharedMemory>,
}

impl AdaptiveMemory {
    /// Drop the least important records once over capacity.
    pub fn compress(&mut self, now: Tick, capacity: usize) {
        if self.patterns.len() > capacity {
            self.patterns
                .sort_by_key(|rec| Reverse(OrderedFloat(rec.importance(now))));
            self.patterns.truncate(capacity);
        }
        if self.shared.len() > capacity {
            self.shared
                .sort_by_key(|mem| Reverse(OrderedFloat(mem.relevance)));
            self.shared.truncate(capacity);
        }
    }

    /// Remove shared memories older than `ttl` ticks.
    pub fn expire_shared(&mut self, now: Tick, ttl: u64) {
        self.shared
            .retain(|mem| now.0.saturating_sub(mem.received_at.0) <= ttl);
    }

    /// Collapse clusters of near-identical same-kind patterns into one
    /// generalized record.
    pub fn abstract_similar(&mut self, now: Tick, next_id: &mut u64) {
        for kind in [
            PatternKind::Vibration,
            PatternKind::Membrane,
            PatternKind::Movement,
            PatternKind::VibrationMovement,
        ] {
            let indices: Vec<usize> = self
                .patterns
                .iter()
                .enumerate()
                .filter(|(_, rec)| rec.pattern.kind() == kind)
                .map(|(idx, _)| idx)
                .collect();
            if indices.len() < 3 {
                continue;
            }
            let mean: f64 = indices
                .iter()
                .map(|&idx| self.patterns[idx].pattern.primary_parameter())
                .sum::<f64>()
                / indices.len() as f64;
            let tight = indices.iter().all(|&idx| {
                (self.patterns[idx].pattern.primary_parameter() - mean).abs()
                    < ABSTRACTION_TOLERANCE
            });
            if !tight {
                continue;
            }

            let mut blended = self.patterns[indices[0]].pattern;
            let mut success = 0.0;
            let mut strength: f64 = 0.0;
            let mut usage = 0_u64;
            let mut conditions = PatternConditions::default();
            for &idx in &indices {
                let rec = &self.patterns[idx];
                blended = blended.blend(&rec.pattern);
                success += rec.success_rate;
                strength = strength.max(rec.strength);
                usage += rec.usage_count;
                conditions.energy += rec.conditions.energy;
                conditions.oscillation += rec.conditions.oscillation;
                conditions.stability += rec.conditions.stability;
            }
            let count = indices.len() as f64;
            let merged = PatternRecord {
                id: {
                    let id = *next_id;
                    *next_id += 1;
                    id
                },
                pattern: blended,
                conditions: PatternConditions {
                    energy: conditions.energy / count,
                    oscillation: conditions.oscillation / count,
                    stability: conditions.stability / count,
                },
                success_rate: clamp01(success / count),
                strength,
                usage_count: usage,
                last_used: now,
                inherited: false,
            };
            let drop: HashSet<usize> = indices.into_iter().collect();
            let old = std::mem::take(&mut self.patterns);
            self.patterns = old
                .into_iter()
                .enumerate()
                .filter(|(idx, _)| !drop.contains(idx))
                .map(|(_, rec)| rec)
                .collect();
            self.patterns.push(merged);
        }
    }
}

/// Structural health state degraded by vibration stress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissueState {
    pub integrity: f64,
    pub repair_capacity: f64,
    pub cumulative_stress: f64,
    pub oscillation_history: RingBuffer<f64>,
}

/// Oscillation and stability scalars driving locomotion and division.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InternalState {
    pub oscillation: f64,
    pub stability: f64,
}

/// Membrane transport properties.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Membrane {
    pub elasticity: f64,
    pub permeability: f64,
    pub thickness: f64,
}

/// Learned resonance targets for the vibration subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResonanceState {
    pub frequency: f64,
    pub optimal_oscillation: f64,
}

/// Mutual bond bookkeeping; partner sets are kept symmetric by [`Population`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeState {
    pub partners: HashSet<EntityId>,
    pub strength: f64,
    pub transfer_rate: f64,
    pub timer: u64,
}

impl MergeState {
    /// True while at least one partner is bonded.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        !self.partners.is_empty()
    }

    fn reset(&mut self) {
        self.strength = 0.0;
        self.transfer_rate = 0.0;
        self.timer = 0;
    }
}

/// A pending obligation to return energy to the field at a recorded position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EnergyReturn {
    pub position: Position,
    pub amount: f64,
}

/// One sample of the vibration/outcome log used for resonance search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VibrationSample {
    pub oscillation: f64,
    pub energy_delta: f64,
    pub movement: f64,
}

/// One organism-like unit of simulated life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub position: Position,
    pub velocity: Velocity,
    pub energy: f64,
    pub age: u64,
    pub active: bool,
    pub tissue: TissueState,
    pub internal: InternalState,
    pub membrane: Membrane,
    pub resonance: ResonanceState,
    pub merge: MergeState,
    pub return_queue: VecDeque<EnergyReturn>,
    pub recent_gains: RingBuffer<f64>,
    pub vibration_log: RingBuffer<VibrationSample>,
    pub memory: AdaptiveMemory,
    pub recent_collisions: u32,
    tick_start_energy: f64,
}

impl Entity {
    /// Construct a fresh entity with randomized membrane traits.
    #[must_use]
    pub fn new(rng: &mut SmallRng, position: Position, energy: f64) -> Self {
        let energy = clamp01(energy);
        Self {
            position,
            velocity: Velocity::new(
                rng.random_range(-0.25..0.25),
                rng.random_range(-0.25..0.25),
            ),
            energy,
            age: 0,
            active: true,
            tissue: TissueState {
                integrity: 1.0,
                repair_capacity: 1.2,
                cumulative_stress: 0.0,
                oscillation_history: RingBuffer::new(OSCILLATION_HISTORY_CAPACITY),
            },
            internal: InternalState {
                oscillation: 0.3,
                stability: 0.7,
            },
            membrane: Membrane {
                elasticity: 0.5 + rng.random::<f64>() * 0.3,
                permeability: 0.3 + rng.random::<f64>() * 0.4,
                thickness: 0.4 + rng.random::<f64>() * 0.3,
            },
            resonance: ResonanceState {
                frequency: 0.3,
                optimal_oscillation: 0.3,
            },
            merge: MergeState::default(),
            return_queue: VecDeque::new(),
            recent_gains: RingBuffer::new(RECENT_GAIN_CAPACITY),
            vibration_log: RingBuffer::new(VIBRATION_LOG_CAPACITY),
            memory: AdaptiveMemory::default(),
            recent_collisions: 0,
            tick_start_energy: energy,
        }
    }

    fn begin_tick(&mut self) {
        self.age = self.age.saturating_add(1);
        self.tick_start_energy = self.energy;
    }

    fn current_conditions(&self) -> PatternConditions {
        PatternConditions {
            energy: self.energy,
            oscillation: self.internal.oscillation,
            stability: self.internal.stability,
        }
    }

    /// Rescale velocity so speed never exceeds `max_speed`.
    pub fn clamp_speed(&mut self, max_speed: f64) {
        let speed = self.velocity.speed();
        if speed > max_speed && speed > 0.0 {
            let scale = max_speed / speed;
            self.velocity.vx *= scale;
            self.velocity.vy *= scale;
        }
    }

    /// Tissue degeneration: vibration stress accumulates, repair is funded by
    /// energy, and weakened tissue degrades the membrane.
    pub fn update_tissue(&mut self) {
        self.tissue
            .oscillation_history
            .push(self.internal.oscillation);
        let stress = self.internal.oscillation * (1.2 - self.energy);
        self.tissue.cumulative_stress += stress;
        self.tissue.repair_capacity = (self.tissue.repair_capacity - 0.00005).max(0.3);
        let repair = 0.0015 * self.energy * self.tissue.repair_capacity;
        let degeneration = 0.001 * (self.tissue.cumulative_stress / 100.0);
        self.tissue.integrity = clamp01(self.tissue.integrity + repair - degeneration);
        if self.tissue.integrity < 0.7 {
            let factor = 1.0 - (0.7 - self.tissue.integrity) * 0.3;
            self.membrane.permeability = clamp01(self.membrane.permeability * factor);
            self.membrane.elasticity = clamp01(self.membrane.elasticity * factor);
        }
    }

    /// Vibration-driven locomotion: bend the heading with an oscillation
    /// sinusoid while preserving speed, with chaotic turns at high oscillation
    /// and reinforcement near the learned optimum.
    pub fn apply_vibration(&mut self, tick: Tick, rng: &mut SmallRng, max_speed: f64) {
        let speed = self.velocity.speed();
        if speed > 1e-9 {
            let phase = (tick.0 as f64 * self.internal.oscillation) % TAU;
            let strength = self.internal.oscillation * 0.2;
            let mut vx = self.velocity.vx + phase.cos() * strength;
            let mut vy = self.velocity.vy + phase.sin() * strength;
            let bent = (vx * vx + vy * vy).sqrt();
            if bent > 1e-9 {
                vx = vx / bent * speed;
                vy = vy / bent * speed;
            }
            self.velocity = Velocity::new(vx, vy);
        }
        if self.internal.oscillation > 0.7
            && rng.random::<f64>() < self.internal.oscillation * 0.3
        {
            let turn = (rng.random::<f64>() - 0.5) * self.internal.oscillation * 0.1;
            let (sin, cos) = turn.sin_cos();
            let vx = self.velocity.vx * cos - self.velocity.vy * sin;
            let vy = self.velocity.vx * sin + self.velocity.vy * cos;
            self.velocity = Velocity::new(vx, vy);
        }
        let diff = (self.internal.oscillation - self.resonance.optimal_oscillation).abs();
        if diff < 0.1 {
            let gain = 1.0 + (0.1 - diff);
            self.velocity.vx *= gain;
            self.velocity.vy *= gain;
        }
        self.clamp_speed(max_speed);
    }

    /// Integrate position, add scarcity-scaled Brownian jitter, and apply the
    /// soft boundary restoring force.
    pub fn integrate_kinematics(&mut self, rng: &mut SmallRng, config: &SimulationConfig) {
        self.position.x += self.velocity.vx;
        self.position.y += self.velocity.vy;

        let jitter = 0.01 * (1.0 - self.energy * 0.5) * (1.0 + self.internal.oscillation);
        let angle = rng.random::<f64>() * TAU;
        self.velocity.vx += angle.cos() * jitter;
        self.velocity.vy += angle.sin() * jitter;

        let width = f64::from(config.grid_width);
        let height = f64::from(config.grid_height);
        let margin = config.boundary_margin;
        let force = config.boundary_force;
        if margin > 0.0 {
            if self.position.x < margin {
                self.velocity.vx += force * (margin - self.position.x) / margin;
            } else if self.position.x > width - margin {
                self.velocity.vx -= force * (self.position.x - (width - margin)) / margin;
            }
            if self.position.y < margin {
                self.velocity.vy += force * (margin - self.position.y) / margin;
            } else if self.position.y > height - margin {
                self.velocity.vy -= force * (self.position.y - (height - margin)) / margin;
            }
        }
        self.position.x = self.position.x.clamp(0.0, width - 1e-6);
        self.position.y = self.position.y.clamp(0.0, height - 1e-6);
        self.clamp_speed(config.max_speed);
    }

    /// Metabolic decay, field extraction, overflow return, and refund drain.
    pub fn exchange_energy(
        &mut self,
        field: &mut EnergyField,
        subjective: f64,
        config: &SimulationConfig,
    ) {
        let decay = config.base_energy_decay * subjective * (0.8 + self.membrane.thickness * 0.4);
        let decay = decay.min(self.energy).max(0.0);
        if decay > 0.0 {
            self.energy -= decay;
            self.return_queue.push_back(EnergyReturn {
                position: self.position,
                amount: decay,
            });
        }

        let requested = config.energy_intake_rate * (0.5 + self.membrane.permeability);
        let granted = field.extract(self.position, requested);
        if granted > 0.0 {
            self.energy += granted;
            self.recent_gains.push(granted);
        }
        if self.energy > 1.0 {
            let excess = self.energy - 1.0;
            self.energy = 1.0;
            field.inject(self.position, excess);
        }

        let mut drained = 0;
        while drained < config.return_drain_limit {
            let Some(refund) = self.return_queue.pop_front() else {
                break;
            };
            field.inject(refund.position, refund.amount);
            drained += 1;
        }
    }

    /// Steer toward the richest of eight sampled directions when the gradient
    /// is worth following; hungrier entities react more strongly.
    pub fn chemotaxis(&mut self, field: &EnergyField) {
        let here = field.sample(self.position);
        let mut best = here;
        let mut best_angle = None;
        for step in 0..8 {
            let angle = step as f64 * TAU / 8.0;
            let probe = Position::new(
                self.position.x + angle.cos() * CHEMOTAXIS_RADIUS,
                self.position.y + angle.sin() * CHEMOTAXIS_RADIUS,
            );
            let sampled = field.sample(probe);
            if sampled > best {
                best = sampled;
                best_angle = Some(angle);
            }
        }
        if let Some(angle) = best_angle
            && best - here > CHEMOTAXIS_MARGIN
        {
            let response = 0.05
                * (0.5 + self.membrane.permeability)
                * (0.5 + (1.0 - self.energy.min(1.0)) * 0.5);
            self.velocity.vx += angle.cos() * response;
            self.velocity.vy += angle.sin() * response;
        }
    }

    /// Pull oscillation toward the learned optimum, recover stability, and let
    /// oscillation bleed off faster when energy is low.
    pub fn adapt_resonance(&mut self) {
        let rate = if self.energy < 0.3 { 0.03 } else { 0.01 };
        self.internal.oscillation +=
            (self.resonance.optimal_oscillation - self.internal.oscillation) * rate;
        self.internal.stability =
            clamp01(self.internal.stability + 0.000005 / (1.0 + self.internal.oscillation));
        self.internal.oscillation = (self.internal.oscillation
            * (0.999 - self.energy * 0.001))
            .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
    }

    /// Slow homeostatic membrane drift: open up when starving, thicken when
    /// sated.
    pub fn adjust_membrane(&mut self) {
        if self.energy < 0.3 {
            self.membrane.permeability = (self.membrane.permeability + 0.001).min(0.95);
            self.membrane.thickness = (self.membrane.thickness - 0.0005).max(0.05);
        } else if self.energy > 0.8 {
            self.membrane.thickness = (self.membrane.thickness + 0.0005).min(0.95);
            self.membrane.permeability = (self.membrane.permeability - 0.0005).max(0.05);
        }
    }

    fn log_vibration(&mut self) {
        self.vibration_log.push(VibrationSample {
            oscillation: self.internal.oscillation,
            energy_delta: self.energy - self.tick_start_energy,
            movement: self.velocity.speed(),
        });
    }

    /// Re-estimate the optimal oscillation from the recent vibration log,
    /// weighting energy outcomes over movement outcomes.
    pub fn search_optimal_frequency(&mut self) {
        if self.vibration_log.is_empty() {
            return;
        }
        let mut weighted = 0.0;
        let mut total = 0.0;
        for sample in self.vibration_log.iter() {
            let score = (sample.energy_delta.max(0.0) * 50.0).min(1.0) * 0.6
                + (sample.movement / 0.5).min(1.0) * 0.4;
            weighted += sample.oscillation * score;
            total += score;
        }
        if total > 1e-9 {
            let target = weighted / total;
            self.resonance.optimal_oscillation = (self.resonance.optimal_oscillation * 0.8
                + target * 0.2)
                .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
        }
    }

    /// Synthesize a candidate pattern matched to the current need.
    pub fn synthesize_pattern(&mut self, id: u64, now: Tick, rng: &mut SmallRng) {
        let pattern = if self.energy < 0.4 {
            if rng.random_bool(0.5) {
                BehaviorPattern::Membrane {
                    permeability: (self.membrane.permeability + 0.2).min(0.95),
                    elasticity: self.membrane.elasticity,
                }
            } else {
                BehaviorPattern::Movement {
                    speed: 0.2 + rng.random::<f64>() * 0.3,
                    direction: rng.random::<f64>() * TAU,
                    oscillation_based: rng.random_bool(0.3),
                }
            }
        } else if (self.internal.oscillation - self.resonance.optimal_oscillation).abs() > 0.2 {
            BehaviorPattern::Vibration {
                frequency: self.resonance.optimal_oscillation,
                amplitude: 0.1 + rng.random::<f64>() * 0.2,
            }
        } else if rng.random_bool(0.3) {
            BehaviorPattern::VibrationMovement {
                frequency: self.resonance.frequency.max(0.05),
                amplitude: 0.05 + rng.random::<f64>() * 0.1,
                phase_shift: rng.random::<f64>() * TAU,
                direction_bias: if rng.random_bool(0.5) { 1.0 } else { -1.0 },
            }
        } else {
            BehaviorPattern::Maintain
        };
        self.memory.patterns.push(PatternRecord {
            id,
            pattern,
            conditions: self.current_conditions(),
            success_rate: 0.5,
            strength: 0.5,
            usage_count: 0,
            last_used: now,
            inherited: false,
        });
    }

    /// Apply the stored pattern's behavioral bias.
    pub fn apply_pattern(&mut self, pattern: BehaviorPattern, tick: Tick, max_speed: f64) {
        match pattern {
            BehaviorPattern::Vibration {
                frequency,
                amplitude,
            } => {
                self.internal.oscillation =
                    clamp01(self.internal.oscillation * 0.7 + frequency * 0.3);
                self.resonance.frequency = self.resonance.frequency * 0.9 + frequency * 0.1;
                let phase = (tick.0 as f64 * frequency) % TAU;
                self.velocity.vx += phase.cos() * amplitude * 0.1;
                self.velocity.vy += phase.sin() * amplitude * 0.1;
            }
            BehaviorPattern::Membrane {
                permeability,
                elasticity,
            } => {
                self.membrane.permeability =
                    clamp01(self.membrane.permeability * 0.8 + permeability * 0.2);
                self.membrane.elasticity =
                    clamp01(self.membrane.elasticity * 0.8 + elasticity * 0.2);
            }
            BehaviorPattern::Movement {
                speed,
                direction,
                oscillation_based,
            } => {
                self.velocity.vx += direction.cos() * speed * 0.1;
                self.velocity.vy += direction.sin() * speed * 0.1;
                if oscillation_based {
                    self.internal.oscillation =
                        clamp01(self.internal.oscillation * 0.8 + speed * 0.2);
                }
            }
            BehaviorPattern::VibrationMovement {
                frequency,
                amplitude,
                phase_shift,
                direction_bias,
            } => {
                let phase = (tick.0 as f64 * frequency + phase_shift) % TAU;
                self.internal.oscillation =
                    clamp01(self.internal.oscillation + phase.sin() * 0.1);
                self.velocity.vx += phase.cos() * amplitude * direction_bias;
                self.velocity.vy += phase.sin() * amplitude * direction_bias;
            }
            BehaviorPattern::Maintain => {}
        }
        self.clamp_speed(max_speed);
    }

    fn apply_best_pattern(&mut self, now: Tick, max_speed: f64) -> Option<PatternApplication> {
        let conditions = self.current_conditions();
        let mut best: Option<(usize, f64)> = None;
        for (idx, rec) in self.memory.patterns.iter().enumerate() {
            let score =
                rec.importance(now) * (0.5 + 0.5 * rec.conditions.similarity(&conditions));
            if best.is_none_or(|(_, prev)| score > prev) {
                best = Some((idx, score));
            }
        }
        let (idx, _) = best?;
        let energy_before = self.energy;
        let position_before = self.position;
        let (pattern_id, pattern) = {
            let rec = &mut self.memory.patterns[idx];
            rec.usage_count += 1;
            rec.last_used = now;
            (rec.id, rec.pattern)
        };
        self.apply_pattern(pattern, now, max_speed);
        Some(PatternApplication {
            pattern: pattern_id,
            energy_before,
            position_before,
        })
    }

    /// Fold eligible peer-shared memories into the owned pattern list.
    pub fn integrate_shared(&mut self, now: Tick, next_id: &mut u64) {
        if self.memory.shared.is_empty() {
            return;
        }
        let starving = self.energy < 0.4 && self.recent_gains.mean() < 0.03;
        let osc_gap =
            (self.internal.oscillation - self.resonance.optimal_oscillation).abs() > 0.2;
        let shared = std::mem::take(&mut self.memory.shared);
        let mut kept = Vec::new();
        for mem in shared {
            if mem.relevance <= MEMORY_SHARE_RELEVANCE {
                kept.push(mem);
                continue;
            }
            let kind = mem.record.pattern.kind();
            let existing = self
                .memory
                .patterns
                .iter()
                .position(|rec| rec.pattern.kind() == kind);
            let improves = existing
                .is_none_or(|idx| self.memory.patterns[idx].success_rate < mem.record.success_rate);
            if !(starving || osc_gap || improves) {
                kept.push(mem);
                continue;
            }
            match existing {
                Some(idx) => {
                    let rec = &mut self.memory.patterns[idx];
                    rec.success_rate = clamp01(
                        rec.success_rate * 0.7 + mem.record.success_rate * mem.relevance * 0.3,
                    );
                    rec.strength = rec
                        .strength
                        .max(mem.record.strength * mem.relevance)
                        .min(1.0);
                }
                None => {
                    let mut rec = mem.record;
                    rec.id = *next_id;
                    *next_id += 1;
                    rec.strength = (rec.strength * mem.relevance).clamp(0.1, 1.0);
                    rec.inherited = true;
                    rec.last_used = now;
                    self.memory.patterns.push(rec);
                }
            }
        }
        self.memory.shared = kept;
    }

    fn update_division_stress(&mut self) {
        self.internal.stability = clamp01(self.internal.stability - 0.015 * (self.energy / 0.7));
        let speed = self.velocity.speed();
        self.internal.oscillation = clamp01(self.internal.oscillation + speed * 0.15);
    }

    /// Split off a child carrying 40% of the parent's energy and mutated
    /// copies of membrane, resonance, and high-success patterns.
    pub fn divide(&mut self, rng: &mut SmallRng) -> Entity {
        let child_energy = self.energy * 0.4;
        self.energy -= child_energy;

        let child_position = Position::new(
            self.position.x + rng.random_range(-0.5..0.5),
            self.position.y + rng.random_range(-0.5..0.5),
        );
        let mut child = Entity::new(rng, child_position, child_energy);

        let mutate = |rng: &mut SmallRng| 0.9 + rng.random::<f64>() * 0.2;
        child.membrane.elasticity = clamp01(self.membrane.elasticity * mutate(rng));
        child.membrane.permeability = clamp01(self.membrane.permeability * mutate(rng));
        child.membrane.thickness = clamp01(self.membrane.thickness * mutate(rng));
        child.resonance.frequency = (self.resonance.frequency * mutate(rng)).clamp(0.05, 1.0);
        child.resonance.optimal_oscillation = (self.resonance.optimal_oscillation
            * mutate(rng))
        .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
        child.tissue.integrity =
            clamp01(self.tissue.integrity * (0.8 + self.tissue.integrity * 0.2));
        child.tissue.repair_capacity =
            (self.tissue.repair_capacity * mutate(rng)).clamp(0.3, 1.5);
        child.internal.oscillation = self
            .internal
            .oscillation
            .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);

        for rec in self
            .memory
            .patterns
            .iter()
            .filter(|rec| rec.success_rate > PATTERN_INHERIT_SUCCESS)
        {
            let mut inherited = *rec;
            inherited.strength = (inherited.strength * 0.8).max(0.1);
            inherited.inherited = true;
            inherited.usage_count = 0;
            child.memory.patterns.push(inherited);
        }

        self.internal.stability = 0.8;
        self.internal.oscillation =
            (self.internal.oscillation * 0.3).max(OSCILLATION_FLOOR);
        child
    }
}

#[derive(Debug, Clone, Copy)]
struct PatternApplication {
    pattern: u64,
    energy_before: f64,
    position_before: Position,
}

/// Read-only view of a single entity for rendering and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityView {
    pub id: EntityId,
    pub position: Position,
    pub velocity: Velocity,
    pub energy: f64,
    pub age: u64,
    pub tissue_integrity: f64,
    pub oscillation: f64,
    pub stability: f64,
    pub membrane: Membrane,
    pub is_merged: bool,
    pub merged_with: Vec<EntityId>,
    pub active: bool,
}

/// The mutable collection of live entities, with deferred spawn/death commits
/// and the single authority over merge-graph symmetry.
#[derive(Debug)]
pub struct Population {
    entities: SlotMap<EntityId, Entity>,
    order: Vec<EntityId>,
    pending_spawns: Vec<Entity>,
    pending_deaths: Vec<EntityId>,
    max_entities: usize,
}

impl Population {
    fn new(max_entities: usize) -> Self {
        Self {
            entities: SlotMap::with_key(),
            order: Vec::new(),
            pending_spawns: Vec::new(),
            pending_deaths: Vec::new(),
            max_entities,
        }
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true when no entities are alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns true if `id` refers to a live entity.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Iterate over live entity ids in stable insertion order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.order.iter().copied()
    }

    /// Borrow an entity.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Mutably borrow an entity.
    #[must_use]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    /// Mutably borrow two distinct entities at once.
    #[must_use]
    pub fn pair_mut(&mut self, a: EntityId, b: EntityId) -> Option<(&mut Entity, &mut Entity)> {
        if a == b {
            return None;
        }
        self.entities
            .get_disjoint_mut([a, b])
            .map(|[first, second]| (first, second))
    }

    /// Insert an entity immediately, respecting the population cap.
    pub fn insert(&mut self, entity: Entity) -> Option<EntityId> {
        if self.order.len() >= self.max_entities {
            return None;
        }
        let id = self.entities.insert(entity);
        self.order.push(id);
        Some(id)
    }

    /// Whether another spawn (queued or direct) still fits under the cap.
    #[must_use]
    pub fn can_spawn(&self) -> bool {
        self.order.len() + self.pending_spawns.len() < self.max_entities
    }

    /// Queue a spawn for commit at the tick boundary.
    pub fn queue_spawn(&mut self, entity: Entity) -> bool {
        if !self.can_spawn() {
            return false;
        }
        self.pending_spawns.push(entity);
        true
    }

    /// Mark an entity for removal at the tick boundary.
    pub fn mark_dead(&mut self, id: EntityId) {
        self.pending_deaths.push(id);
    }

    fn commit_spawns(&mut self) -> usize {
        let mut births = 0;
        for entity in self.pending_spawns.drain(..) {
            let id = self.entities.insert(entity);
            self.order.push(id);
            births += 1;
        }
        births
    }

    fn remove_dead(&mut self) -> usize {
        if self.pending_deaths.is_empty() {
            return 0;
        }
        let dead: HashSet<EntityId> = self.pending_deaths.drain(..).collect();
        let mut sorted: Vec<EntityId> = dead.iter().copied().collect();
        sorted.sort_unstable();
        let mut removed = 0;
        for id in sorted {
            self.unlink_all(id);
            if self.entities.remove(id).is_some() {
                removed += 1;
            }
        }
        self.order.retain(|id| !dead.contains(id));
        removed
    }

    /// Bond two entities; symmetry is enforced here and nowhere else.
    pub fn link(&mut self, a: EntityId, b: EntityId) -> bool {
        if a == b {
            return false;
        }
        let Some([ea, eb]) = self.entities.get_disjoint_mut([a, b]) else {
            return false;
        };
        let fresh = ea.merge.partners.insert(b);
        eb.merge.partners.insert(a);
        fresh
    }

    /// Sever the bond between two entities, resetting emptied merge state.
    pub fn unlink(&mut self, a: EntityId, b: EntityId) {
        if let Some([ea, eb]) = self.entities.get_disjoint_mut([a, b]) {
            ea.merge.partners.remove(&b);
            eb.merge.partners.remove(&a);
            if ea.merge.partners.is_empty() {
                ea.merge.reset();
            }
            if eb.merge.partners.is_empty() {
                eb.merge.reset();
            }
        }
    }

    /// Sever every bond held by `id`.
    pub fn unlink_all(&mut self, id: EntityId) {
        let mut partners: Vec<EntityId> = match self.entities.get(id) {
            Some(entity) => entity.merge.partners.iter().copied().collect(),
            None => return,
        };
        partners.sort_unstable();
        for partner in partners {
            self.unlink(id, partner);
        }
    }

    /// The entity plus its direct partners, sorted for stable iteration.
    #[must_use]
    pub fn group_of(&self, id: EntityId) -> Vec<EntityId> {
        let mut group = vec![id];
        if let Some(entity) = self.entities.get(id) {
            group.extend(entity.merge.partners.iter().copied());
        }
        group.sort_unstable();
        group
    }

    /// Owned, read-only views of every live entity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EntityView> {
        self.order
            .iter()
            .filter_map(|&id| {
                let entity = self.entities.get(id)?;
                let mut merged_with: Vec<EntityId> =
                    entity.merge.partners.iter().copied().collect();
                merged_with.sort_unstable();
                Some(EntityView {
                    id,
                    position: entity.position,
                    velocity: entity.velocity,
                    energy: entity.energy,
                    age: entity.age,
                    tissue_integrity: entity.tissue.integrity,
                    oscillation: entity.internal.oscillation,
                    stability: entity.internal.stability,
                    membrane: entity.membrane,
                    is_merged: entity.merge.is_merged(),
                    merged_with,
                    active: entity.active,
                })
            })
            .collect()
    }

    /// Sum of live entity energies.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.order
            .iter()
            .filter_map(|&id| self.entities.get(id))
            .map(|entity| entity.energy)
            .sum()
    }

    /// Sum of energy still queued for return to the field.
    #[must_use]
    pub fn queued_energy(&self) -> f64 {
        self.order
            .iter()
            .filter_map(|&id| self.entities.get(id))
            .flat_map(|entity| entity.return_queue.iter())
            .map(|refund| refund.amount)
            .sum()
    }
}

/// Aggregate statistics emitted after each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub population: usize,
    pub births: usize,
    pub deaths: usize,
    pub collisions: usize,
    pub merges: usize,
    pub separations: usize,
    pub mean_energy: f64,
    pub field_energy: f64,
    pub queued_energy: f64,
    /// Signed deviation from the configured energy budget; recorded only on
    /// conservation-check ticks.
    pub conservation_drift: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TickCounters {
    births: usize,
    deaths: usize,
    collisions: usize,
    merges: usize,
    separations: usize,
}

/// A deferred pattern-reward evaluation keyed by its due tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PendingEvaluation {
    pub due: Tick,
    pub entity: EntityId,
    pub pattern: u64,
    pub energy_before: f64,
    pub position_before: Position,
}

/// Commands injected by UI or control layers between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Toggle the pause switch; a paused engine skips `tick()` bodies.
    SetPaused(bool),
    /// Replace the global time multiplier; non-positive values are ignored.
    SetSpeed(f64),
    /// Spawn a field-funded entity, at a random interior position if
    /// coordinates are omitted.
    SpawnEntity { x: Option<f64>, y: Option<f64> },
}

/// Apply an externally injected command to the engine.
pub fn apply_control_command(engine: &mut Engine, command: ControlCommand) {
    match command {
        ControlCommand::SetPaused(paused) => engine.paused = paused,
        ControlCommand::SetSpeed(speed) => {
            if speed > 0.0 && speed.is_finite() {
                engine.config.simulation_speed = speed;
            }
        }
        ControlCommand::SpawnEntity { x, y } => engine.spawn_entity(x, y),
    }
}

/// Orchestrates one simulation tick over the population and energy field.
pub struct Engine {
    config: SimulationConfig,
    tick: Tick,
    paused: bool,
    rng: SmallRng,
    field: EnergyField,
    population: Population,
    index: UniformGridIndex,
    index_handles: Vec<EntityId>,
    pending_evaluations: VecDeque<PendingEvaluation>,
    next_pattern_id: u64,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("tick", &self.tick)
            .field("paused", &self.paused)
            .field("population", &self.population.len())
            .field("pending_evaluations", &self.pending_evaluations.len())
            .finish()
    }
}

impl Engine {
    /// Instantiate a new world: validate configuration, seed the initial
    /// colony at the grid center, and distribute the remaining energy budget
    /// across the field.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let noise_seed = (rng.random::<f64>() * 100.0, rng.random::<f64>() * 100.0);
        let mut field = EnergyField::new(
            config.grid_width,
            config.grid_height,
            config.diffusion_rate,
            noise_seed,
        )?;
        let mut population = Population::new(config.max_entities);
        let center = Position::new(
            f64::from(config.grid_width) * 0.5,
            f64::from(config.grid_height) * 0.5,
        );
        for _ in 0..config.initial_entities {
            let position = Position::new(
                center.x + rng.random_range(-1.0..1.0),
                center.y + rng.random_range(-1.0..1.0),
            );
            let entity = Entity::new(&mut rng, position, config.initial_entity_energy);
            let _ = population.insert(entity);
        }
        let reserve = (config.total_energy - population.total_energy()).max(0.0);
        field.seed_energy(reserve);

        let index = UniformGridIndex::new(
            1.0,
            f64::from(config.grid_width),
            f64::from(config.grid_height),
        );
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            paused: false,
            rng,
            field,
            population,
            index,
            index_handles: Vec::new(),
            pending_evaluations: VecDeque::new(),
            next_pattern_id: 0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Advance the simulation by one step; a no-op while paused.
    pub fn tick(&mut self) {
        if self.paused {
            return;
        }
        let next_tick = self.tick.next();
        let mut counters = TickCounters::default();

        self.resolve_due_evaluations(next_tick);
        self.stage_entities(next_tick, &mut counters);
        counters.deaths = self.population.remove_dead();
        counters.births = self.population.commit_spawns();

        if next_tick
            .0
            .is_multiple_of(u64::from(self.config.diffusion_interval))
        {
            self.field.diffuse();
        }

        let drift = if self.config.conservation_interval > 0
            && next_tick
                .0
                .is_multiple_of(u64::from(self.config.conservation_interval))
        {
            Some(self.total_system_energy() - self.config.total_energy)
        } else {
            None
        };

        let population = self.population.len();
        let entity_energy = self.population.total_energy();
        let summary = TickSummary {
            tick: next_tick,
            population,
            births: counters.births,
            deaths: counters.deaths,
            collisions: counters.collisions,
            merges: counters.merges,
            separations: counters.separations,
            mean_energy: if population > 0 {
                entity_energy / population as f64
            } else {
                0.0
            },
            field_energy: self.field.total_energy(),
            queued_energy: self.population.queued_energy(),
            conservation_drift: drift,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.tick = next_tick;
    }

    fn stage_entities(&mut self, next_tick: Tick, counters: &mut TickCounters) {
        self.index_handles.clear();
        self.index_handles.extend(self.population.ids());
        let positions: Vec<(f64, f64)> = self
            .index_handles
            .iter()
            .map(|&id| {
                self.population
                    .get(id)
                    .map_or((0.0, 0.0), |entity| (entity.position.x, entity.position.y))
            })
            .collect();
        let rebuilt = self.index.rebuild(&positions);
        debug_assert!(rebuilt.is_ok(), "spatial index rebuild failed");

        let order = self.index_handles.clone();
        for id in order {
            self.update_entity(id, next_tick, counters);
        }
    }

    fn update_entity(&mut self, id: EntityId, next_tick: Tick, counters: &mut TickCounters) {
        if !self.population.get(id).is_some_and(|entity| entity.active) {
            return;
        }

        if let Some(entity) = self.population.get_mut(id) {
            entity.begin_tick();
            entity.update_tissue();
        }
        self.update_merge(id, next_tick, counters);
        if let Some(entity) = self.population.get_mut(id) {
            entity.apply_vibration(next_tick, &mut self.rng, self.config.max_speed);
            entity.integrate_kinematics(&mut self.rng, &self.config);
        }
        if let Some(entity) = self.population.get_mut(id) {
            let subjective =
                subjective_time(entity.energy, next_tick, self.config.simulation_speed);
            entity.exchange_energy(&mut self.field, subjective, &self.config);
        }
        self.handle_collisions(id, next_tick, counters);
        self.proximity_interference(id);
        if let Some(entity) = self.population.get_mut(id) {
            entity.chemotaxis(&self.field);
        }
        self.update_learning(id, next_tick);
        if let Some(entity) = self.population.get_mut(id) {
            entity.clamp_speed(self.config.max_speed);
        }
        self.check_vitality(id, next_tick);
        self.try_division(id);
    }

    fn resolve_due_evaluations(&mut self, next_tick: Tick) {
        loop {
            match self.pending_evaluations.front() {
                Some(pending) if pending.due.0 <= next_tick.0 => {}
                _ => break,
            }
            let Some(eval) = self.pending_evaluations.pop_front() else {
                break;
            };
            let Some(entity) = self.population.get_mut(eval.entity) else {
                continue;
            };
            if !entity.active {
                continue;
            }
            let kind = entity
                .memory
                .patterns
                .iter()
                .find(|rec| rec.id == eval.pattern)
                .map(|rec| rec.pattern.kind());
            let Some(kind) = kind else {
                continue;
            };
            let success = match kind {
                PatternKind::Vibration => entity.energy > eval.energy_before,
                PatternKind::Membrane | PatternKind::Maintain => {
                    entity.energy >= eval.energy_before * 0.95
                }
                PatternKind::Movement | PatternKind::VibrationMovement => {
                    entity.position.distance_to(eval.position_before) > 0.5
                }
            };
            if let Some(rec) = entity
                .memory
                .patterns
                .iter_mut()
                .find(|rec| rec.id == eval.pattern)
            {
                rec.record_outcome(success);
            }
        }
    }

    fn update_merge(&mut self, id: EntityId, next_tick: Tick, counters: &mut TickCounters) {
        let partners: Vec<EntityId> = match self.population.get(id) {
            Some(entity) if entity.active && entity.merge.is_merged() => {
                let mut partners: Vec<EntityId> =
                    entity.merge.partners.iter().copied().collect();
                partners.sort_unstable();
                partners
            }
            _ => return,
        };
        if let Some(entity) = self.population.get_mut(id) {
            entity.merge.timer += 1;
        }

        // Cohesion toward the group centroid.
        let mut cx = 0.0;
        let mut cy = 0.0;
        let mut count = 0.0;
        for member in std::iter::once(id).chain(partners.iter().copied()) {
            if let Some(entity) = self.population.get(member)
                && entity.active
            {
                cx += entity.position.x;
                cy += entity.position.y;
                count += 1.0;
            }
        }
        if count > 1.0
            && let Some(entity) = self.population.get_mut(id)
        {
            let pull = 0.001 * entity.merge.strength;
            entity.velocity.vx += (cx / count - entity.position.x) * pull;
            entity.velocity.vy += (cy / count - entity.position.y) * pull;
        }

        for partner in partners {
            let probability = match (self.population.get(id), self.population.get(partner)) {
                (Some(entity), Some(peer)) if entity.active && peer.active => {
                    let resonance =
                        1.0 - (entity.internal.oscillation - peer.internal.oscillation).abs();
                    let timer = entity.merge.timer as f64;
                    let energy_gap = (entity.energy - peer.energy).abs();
                    Some(
                        ((timer / 1200.0).min(1.0) * 0.2
                            + (1.0 - (energy_gap / 0.9).min(1.0)) * 0.15
                            + (1.0 - resonance) * 0.15)
                            * 0.005,
                    )
                }
                _ => None,
            };
            let Some(probability) = probability else {
                self.population.unlink(id, partner);
                continue;
            };
            if self.rng.random::<f64>() < probability {
                self.separate_pair(id, partner, counters);
                continue;
            }
            if let Some((entity, peer)) = self.population.pair_mut(id, partner) {
                Self::share_partner_energy(entity, peer);
                Self::maintain_merge_distance(entity, peer, self.config.max_speed);
                Self::synchronize_partner(entity, peer);
            }
        }

        // Cadenced whole-group synchronization.
        let movement_due = next_tick.0.is_multiple_of(10);
        let vibration_due = next_tick.0.is_multiple_of(15);
        if movement_due || vibration_due {
            let group = self.population.group_of(id);
            if group.len() > 1 {
                let mut vx = 0.0;
                let mut vy = 0.0;
                let mut oscillation = 0.0;
                let mut count = 0.0;
                for &member in &group {
                    if let Some(entity) = self.population.get(member)
                        && entity.active
                    {
                        vx += entity.velocity.vx;
                        vy += entity.velocity.vy;
                        oscillation += entity.internal.oscillation;
                        count += 1.0;
                    }
                }
                if count > 1.0
                    && let Some(entity) = self.population.get_mut(id)
                {
                    if movement_due {
                        let factor = (entity.merge.timer as f64 / 200.0).min(0.8);
                        entity.velocity.vx += (vx / count - entity.velocity.vx) * factor;
                        entity.velocity.vy += (vy / count - entity.velocity.vy) * factor;
                    }
                    if vibration_due {
                        let factor = (entity.merge.timer as f64 / 300.0).min(0.7)
                            * entity.merge.strength.min(1.0);
                        entity.internal.oscillation = clamp01(
                            entity.internal.oscillation
                                + (oscillation / count - entity.internal.oscillation) * factor,
                        );
                    }
                }
            }
        }
    }

    /// Bidirectional equalization of a fraction of the energy difference.
    fn share_partner_energy(entity: &mut Entity, peer: &mut Entity) {
        let transfer = (entity.energy - peer.energy) * entity.merge.transfer_rate;
        if transfer > 0.0 {
            let moved = transfer.min(entity.energy).min(1.0 - peer.energy).max(0.0);
            entity.energy -= moved;
            peer.energy += moved;
        } else if transfer < 0.0 {
            let moved = (-transfer).min(peer.energy).min(1.0 - entity.energy).max(0.0);
            peer.energy -= moved;
            entity.energy += moved;
        }
    }

    /// Spring-like band keeping bonded entities near their ideal spacing.
    fn maintain_merge_distance(entity: &mut Entity, peer: &mut Entity, max_speed: f64) {
        let dx = peer.position.x - entity.position.x;
        let dy = peer.position.y - entity.position.y;
        let dist = (dx * dx + dy * dy).sqrt();
        let ideal = (entity.membrane.thickness + peer.membrane.thickness) * 1.8;
        if dist > ideal * 1.3 && dist > 1e-9 {
            let pull = 0.015 * entity.merge.strength;
            entity.velocity.vx += dx / dist * pull;
            entity.velocity.vy += dy / dist * pull;
            peer.velocity.vx -= dx / dist * pull;
            peer.velocity.vy -= dy / dist * pull;
        } else if dist < ideal * 0.7 && dist > 1e-9 {
            let push = 0.012 * entity.merge.strength;
            entity.velocity.vx -= dx / dist * push;
            entity.velocity.vy -= dy / dist * push;
            peer.velocity.vx += dx / dist * push;
            peer.velocity.vy += dy / dist * push;
        } else {
            entity.velocity.vx *= 0.98;
            entity.velocity.vy *= 0.98;
            peer.velocity.vx *= 0.98;
            peer.velocity.vy *= 0.98;
        }
        entity.clamp_speed(max_speed);
        peer.clamp_speed(max_speed);
    }

    /// Mix oscillation and resonance targets toward the partner's values.
    fn synchronize_partner(entity: &mut Entity, peer: &mut Entity) {
        let sync = entity.merge.strength * 0.05;
        entity.internal.oscillation = clamp01(
            entity.internal.oscillation
                + (peer.internal.oscillation - entity.internal.oscillation) * sync,
        );
        entity.resonance.frequency +=
            (peer.resonance.frequency - entity.resonance.frequency) * sync;
        entity.resonance.optimal_oscillation = (entity.resonance.optimal_oscillation
            + (peer.resonance.optimal_oscillation - entity.resonance.optimal_oscillation) * sync)
            .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
    }

    fn separate_pair(&mut self, a: EntityId, b: EntityId, counters: &mut TickCounters) {
        self.population.unlink(a, b);
        if let Some((ea, eb)) = self.population.pair_mut(a, b) {
            let dx = ea.position.x - eb.position.x;
            let dy = ea.position.y - eb.position.y;
            let dist = (dx * dx + dy * dy).sqrt();
            let (nx, ny) = if dist > 1e-9 {
                (dx / dist, dy / dist)
            } else {
                (1.0, 0.0)
            };
            ea.velocity.vx += nx * 0.05;
            ea.velocity.vy += ny * 0.05;
            eb.velocity.vx -= nx * 0.05;
            eb.velocity.vy -= ny * 0.05;
            ea.clamp_speed(self.config.max_speed);
            eb.clamp_speed(self.config.max_speed);
        }
        counters.separations += 1;
    }

    fn handle_collisions(&mut self, id: EntityId, next_tick: Tick, counters: &mut TickCounters) {
        let origin = match self.population.get(id) {
            Some(entity) if entity.active => {
                if entity.recent_collisions >= COLLISION_WINDOW_LIMIT {
                    return;
                }
                entity.position
            }
            _ => return,
        };

        let mut candidates: Vec<EntityId> = Vec::new();
        self.index.neighbors_of_point(
            (origin.x, origin.y),
            COLLISION_CANDIDATE_RADIUS_SQ,
            &mut |idx, _dist: OrderedFloat<f64>| {
                if let Some(&other) = self.index_handles.get(idx) {
                    candidates.push(other);
                }
            },
        );

        for other in candidates {
            if other == id {
                continue;
            }
            let same_cell = match (self.population.get(id), self.population.get(other)) {
                (Some(a), Some(b)) if a.active && b.active => {
                    grid_cell(a.position) == grid_cell(b.position)
                }
                _ => false,
            };
            if !same_cell {
                continue;
            }
            self.collide_pair(id, other, next_tick, counters);
        }
    }

    /// Weak vibration coupling with non-bonded neighbors inside the membrane's
    /// sensing range. Near-resonant pairs entrain each other's oscillation,
    /// dissonant pairs push apart, and resonance frequencies drift together.
    fn proximity_interference(&mut self, id: EntityId) {
        let (origin, range) = match self.population.get(id) {
            Some(entity) if entity.active => (
                entity.position,
                PROXIMITY_BASE_RANGE + entity.membrane.thickness * PROXIMITY_THICKNESS_RANGE,
            ),
            _ => return,
        };

        let mut candidates: Vec<EntityId> = Vec::new();
        self.index.neighbors_of_point(
            (origin.x, origin.y),
            range * range,
            &mut |idx, _dist: OrderedFloat<f64>| {
                if let Some(&other) = self.index_handles.get(idx) {
                    candidates.push(other);
                }
            },
        );

        for other in candidates {
            if other == id {
                continue;
            }
            let bonded = self
                .population
                .get(id)
                .is_some_and(|entity| entity.merge.partners.contains(&other));
            if bonded {
                // Merged partners synchronize through the bond instead.
                continue;
            }
            let Some((ea, eb)) = self.population.pair_mut(id, other) else {
                continue;
            };
            if !ea.active || !eb.active {
                continue;
            }
            // The index holds positions from the start of the stage; re-check
            // against live coordinates.
            let distance = ea.position.distance_to(eb.position);
            if distance >= range {
                continue;
            }
            let distance_factor = 1.0 - distance / range;
            let permeability = (ea.membrane.permeability + eb.membrane.permeability) * 0.5;
            let strength = distance_factor * permeability * PROXIMITY_INTERFERENCE_RATE;

            if self.rng.random::<f64>() < strength * 5.0 {
                let diff = eb.internal.oscillation - ea.internal.oscillation;
                if 1.0 - diff.abs() > PROXIMITY_RESONANCE_FLOOR {
                    ea.internal.oscillation = (ea.internal.oscillation + diff * strength)
                        .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
                    eb.internal.oscillation = (eb.internal.oscillation - diff * strength)
                        .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
                } else {
                    let push = diff.signum() * strength * 0.5;
                    ea.internal.oscillation = (ea.internal.oscillation - push)
                        .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
                    eb.internal.oscillation = (eb.internal.oscillation + push)
                        .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);
                }
                ea.log_vibration();
            }
            if self.rng.random::<f64>() < strength * 3.0 {
                let freq_diff = eb.resonance.frequency - ea.resonance.frequency;
                ea.resonance.frequency += freq_diff * strength * 0.5;
                eb.resonance.frequency -= freq_diff * strength * 0.5;
            }
        }
    }

    fn collide_pair(
        &mut self,
        a: EntityId,
        b: EntityId,
        next_tick: Tick,
        counters: &mut TickCounters,
    ) {
        let group_a = self.population.group_of(a).len();
        let group_b = self.population.group_of(b).len();
        let already_linked = self
            .population
            .get(a)
            .is_some_and(|entity| entity.merge.partners.contains(&b));

        let (resonance, merge_eligible, share_eligible) = {
            let Some((ea, eb)) = self.population.pair_mut(a, b) else {
                return;
            };
            counters.collisions += 1;
            ea.recent_collisions += 1;
            eb.recent_collisions += 1;

            let resonance = 1.0 - (ea.internal.oscillation - eb.internal.oscillation).abs();
            let impact = ea.velocity.speed() * 0.8;

            // Repulsive impulse along the separation axis.
            let dx = ea.position.x - eb.position.x;
            let dy = ea.position.y - eb.position.y;
            let dist = (dx * dx + dy * dy).sqrt();
            let (nx, ny) = if dist > 1e-9 {
                (dx / dist, dy / dist)
            } else {
                let angle = self.rng.random::<f64>() * TAU;
                (angle.cos(), angle.sin())
            };
            ea.velocity.vx += nx * COLLISION_IMPULSE;
            ea.velocity.vy += ny * COLLISION_IMPULSE;
            eb.velocity.vx -= nx * COLLISION_IMPULSE * 0.7;
            eb.velocity.vy -= ny * COLLISION_IMPULSE * 0.7;
            ea.clamp_speed(self.config.max_speed);
            eb.clamp_speed(self.config.max_speed);

            // Mutual energy loss queued for return to the field.
            let loss = COLLISION_ENERGY_LOSS * ea.energy.min(eb.energy);
            let loss_a = loss.min(ea.energy);
            if loss_a > 0.0 {
                ea.energy -= loss_a;
                ea.return_queue.push_back(EnergyReturn {
                    position: ea.position,
                    amount: loss_a,
                });
            }
            let loss_b = loss.min(eb.energy);
            if loss_b > 0.0 {
                eb.energy -= loss_b;
                eb.return_queue.push_back(EnergyReturn {
                    position: eb.position,
                    amount: loss_b,
                });
            }

            // Vibration transfer is asymmetric: the mover absorbs more.
            ea.internal.oscillation = clamp01(ea.internal.oscillation + impact);
            eb.internal.oscillation = clamp01(eb.internal.oscillation + impact * 0.7);
            ea.internal.stability = clamp01(ea.internal.stability - impact * 0.2);
            eb.internal.stability = clamp01(eb.internal.stability - impact * 0.15);
            ea.tissue.integrity = clamp01(
                ea.tissue.integrity - impact * (1.0 - ea.membrane.elasticity) * 0.025,
            );
            eb.tissue.integrity = clamp01(
                eb.tissue.integrity - impact * (1.0 - eb.membrane.elasticity) * 0.015,
            );

            // Resonance interference: near-resonant pairs pull each other's
            // frequencies together, dissonant pairs drift apart.
            let interference = impact * resonance * 0.5;
            if resonance > MEMORY_SHARE_RESONANCE {
                ea.resonance.frequency +=
                    (eb.resonance.frequency - ea.resonance.frequency) * interference * 0.2;
                eb.resonance.frequency +=
                    (ea.resonance.frequency - eb.resonance.frequency) * interference * 0.1;
            } else {
                ea.resonance.frequency -=
                    (eb.resonance.frequency - ea.resonance.frequency) * interference * 0.1;
            }
            ea.resonance.optimal_oscillation = (ea.resonance.optimal_oscillation
                + (eb.resonance.optimal_oscillation - ea.resonance.optimal_oscillation)
                    * interference
                    * 0.1)
                .clamp(OSCILLATION_FLOOR, OSCILLATION_CEIL);

            let merge_eligible = ea.membrane.permeability > MERGE_PERMEABILITY_FLOOR
                && eb.membrane.permeability > MERGE_PERMEABILITY_FLOOR
                && resonance > MERGE_RESONANCE_FLOOR
                && ea.energy > MERGE_ENERGY_FLOOR
                && eb.energy > MERGE_ENERGY_FLOOR
                && !already_linked
                && group_a < MERGE_GROUP_LIMIT
                && group_b < MERGE_GROUP_LIMIT;
            let share_eligible = impact > MEMORY_SHARE_IMPACT
                && ea.energy > MEMORY_SHARE_ENERGY_FLOOR
                && eb.energy > MEMORY_SHARE_ENERGY_FLOOR
                && resonance > MEMORY_SHARE_RESONANCE;
            (resonance, merge_eligible, share_eligible)
        };

        if share_eligible {
            self.share_memories(a, b, next_tick);
            if resonance > MEMORY_SHARE_MUTUAL_RESONANCE {
                self.share_memories(b, a, next_tick);
            }
        }
        if merge_eligible && self.rng.random_bool(self.config.merge_attempt_probability) {
            self.perform_merge(a, b, counters);
        }
    }

    fn share_memories(&mut self, from: EntityId, to: EntityId, now: Tick) {
        let peer = match self.population.get(to) {
            Some(entity) if entity.active => PeerProfile {
                energy: entity.energy,
                oscillation: entity.internal.oscillation,
                permeability: entity.membrane.permeability,
                speed: entity.velocity.speed(),
            },
            _ => return,
        };
        let max_speed = self.config.max_speed;
        let mut offers: Vec<(PatternRecord, f64)> = {
            let Some(sender) = self.population.get(from) else {
                return;
            };
            sender
                .memory
                .patterns
                .iter()
                .filter(|rec| rec.success_rate > PATTERN_SHARE_SUCCESS)
                .map(|rec| {
                    let relevance = Self::pattern_relevance(rec, sender, &peer, max_speed);
                    (*rec, relevance)
                })
                .filter(|(_, relevance)| *relevance > MEMORY_SHARE_RELEVANCE)
                .collect()
        };
        offers.sort_by_key(|(_, relevance)| Reverse(OrderedFloat(*relevance)));
        offers.truncate(2);

        for (mut record, relevance) in offers {
            record.id = self.next_pattern_id;
            self.next_pattern_id += 1;
            record.strength =
                (record.strength * (1.0 - (1.0 - relevance) * 0.3)).clamp(0.1, 1.0);
            record.usage_count = 0;
            if let Some(receiver) = self.population.get_mut(to) {
                receiver.memory.shared.push(SharedMemory {
                    record,
                    relevance,
                    received_at: now,
                });
            }
        }
    }

    /// How useful a sender's pattern is likely to be for the peer, from
    /// similarity of their energetic and kinetic situations.
    fn pattern_relevance(
        record: &PatternRecord,
        sender: &Entity,
        peer: &PeerProfile,
        max_speed: f64,
    ) -> f64 {
        let energy_sim = 1.0 - (sender.energy - peer.energy).abs();
        let osc_sim = 1.0 - (sender.internal.oscillation - peer.oscillation).abs();
        let mut relevance = 0.5 + energy_sim * 0.3 + osc_sim * 0.2;
        match record.pattern.kind() {
            PatternKind::Membrane => {
                relevance +=
                    (1.0 - (sender.membrane.permeability - peer.permeability).abs()) * 0.2;
            }
            PatternKind::Movement | PatternKind::VibrationMovement => {
                let speed_gap =
                    ((sender.velocity.speed() - peer.speed).abs() / max_speed).min(1.0);
                relevance += (1.0 - speed_gap) * 0.2;
            }
            PatternKind::Vibration | PatternKind::Maintain => {}
        }
        relevance.min(1.0)
    }

    fn perform_merge(&mut self, a: EntityId, b: EntityId, counters: &mut TickCounters) {
        let group_a = self.population.group_of(a);
        let group_b = self.population.group_of(b);
        let merged = {
            let (Some(ea), Some(eb)) = (self.population.get(a), self.population.get(b)) else {
                return;
            };
            let strength = 0.3
                + (ea.membrane.permeability + eb.membrane.permeability) * 0.5
                + (ea.membrane.elasticity + eb.membrane.elasticity) * 0.125;
            let na = group_a.len() as f64;
            let nb = group_b.len() as f64;
            let velocity = Velocity::new(
                (ea.velocity.vx * na + eb.velocity.vx * nb) / (na + nb),
                (ea.velocity.vy * na + eb.velocity.vy * nb) / (na + nb),
            );
            (strength, velocity)
        };
        let (strength, velocity) = merged;
        let transfer_rate = strength * 0.2;

        // Group union: every member of one group bonds with every member of
        // the other, applied explicitly at merge time.
        for &x in &group_a {
            for &y in &group_b {
                self.population.link(x, y);
            }
        }

        if let Some((ea, eb)) = self.population.pair_mut(a, b) {
            ea.merge.strength = ea.merge.strength.max(strength);
            eb.merge.strength = eb.merge.strength.max(strength);
            ea.merge.transfer_rate = ea.merge.transfer_rate.max(transfer_rate);
            eb.merge.transfer_rate = eb.merge.transfer_rate.max(transfer_rate);
            ea.merge.timer = 0;
            eb.merge.timer = 0;
            ea.velocity = velocity;
            eb.velocity = velocity;

            // Equilibrate a share of the energy gap, high to low.
            let diff = ea.energy - eb.energy;
            let transfer = diff.abs() * 0.3;
            if diff > 0.0 {
                let moved = transfer.min(ea.energy).min(1.0 - eb.energy).max(0.0);
                ea.energy -= moved;
                eb.energy += moved;
            } else if diff < 0.0 {
                let moved = transfer.min(eb.energy).min(1.0 - ea.energy).max(0.0);
                eb.energy -= moved;
                ea.energy += moved;
            }
        }
        counters.merges += 1;
    }

    fn update_learning(&mut self, id: EntityId, next_tick: Tick) {
        let memory_due = next_tick
            .0
            .is_multiple_of(u64::from(self.config.memory_interval));
        let abstraction_due = self.config.abstraction_interval > 0
            && next_tick
                .0
                .is_multiple_of(u64::from(self.config.abstraction_interval));
        let search_due = next_tick
            .0
            .is_multiple_of(u64::from(self.config.resonance_search_interval));
        let synthesize = self.rng.random::<f64>() < PATTERN_SYNTHESIS_PROBABILITY;
        let ttl = self.config.shared_memory_ttl;
        let capacity = self.config.memory_capacity;
        let max_speed = self.config.max_speed;
        let eval_delay = u64::from(self.config.pattern_eval_delay);

        let Some(entity) = self.population.get_mut(id) else {
            return;
        };
        if !entity.active {
            return;
        }
        entity.adapt_resonance();
        entity.adjust_membrane();
        entity.log_vibration();
        if next_tick.0.is_multiple_of(COLLISION_WINDOW) {
            entity.recent_collisions = 0;
        }
        if synthesize {
            let pattern_id = self.next_pattern_id;
            self.next_pattern_id += 1;
            entity.synthesize_pattern(pattern_id, next_tick, &mut self.rng);
        }
        if search_due {
            entity.search_optimal_frequency();
        }
        if abstraction_due {
            entity
                .memory
                .abstract_similar(next_tick, &mut self.next_pattern_id);
        }
        if memory_due {
            entity.memory.expire_shared(next_tick, ttl);
            entity.integrate_shared(next_tick, &mut self.next_pattern_id);
            entity.memory.compress(next_tick, capacity);
            if let Some(application) = entity.apply_best_pattern(next_tick, max_speed) {
                self.pending_evaluations.push_back(PendingEvaluation {
                    due: Tick(next_tick.0 + eval_delay),
                    entity: id,
                    pattern: application.pattern,
                    energy_before: application.energy_before,
                    position_before: application.position_before,
                });
            }
        }
    }

    fn check_vitality(&mut self, id: EntityId, next_tick: Tick) {
        let dying = self.population.get(id).is_some_and(|entity| {
            entity.active
                && (entity.energy <= 0.0 || entity.tissue.integrity <= DEATH_INTEGRITY_FLOOR)
        });
        if dying {
            self.entity_death(id, next_tick);
        }
    }

    /// Death: the full return queue and all remaining energy go back to the
    /// field, high-value patterns disperse to nearby survivors, and the
    /// entity leaves the population at the tick boundary.
    fn entity_death(&mut self, id: EntityId, now: Tick) {
        let (position, remaining, refunds, deposits) = {
            let Some(entity) = self.population.get_mut(id) else {
                return;
            };
            entity.active = false;
            let remaining = std::mem::take(&mut entity.energy);
            let refunds: Vec<EnergyReturn> = entity.return_queue.drain(..).collect();
            let mut deposits: Vec<PatternRecord> = entity
                .memory
                .patterns
                .iter()
                .filter(|rec| rec.success_rate > PATTERN_DEPOSIT_SUCCESS)
                .copied()
                .collect();
            deposits.sort_by_key(|rec| Reverse(OrderedFloat(rec.success_rate)));
            deposits.truncate(DEATH_DEPOSIT_LIMIT);
            (entity.position, remaining, refunds, deposits)
        };

        for refund in refunds {
            self.field.inject(refund.position, refund.amount);
        }
        if remaining > 0.0 {
            let share = remaining / RING_RETURN_STEPS as f64;
            for step in 0..RING_RETURN_STEPS {
                let angle = TAU * step as f64 / RING_RETURN_STEPS as f64;
                let radius = step as f64 * 0.5;
                let target = Position::new(
                    position.x + angle.cos() * radius,
                    position.y + angle.sin() * radius,
                );
                self.field.inject(target, share);
            }
        }

        if !deposits.is_empty() {
            let mut recipients: Vec<(EntityId, f64)> = Vec::new();
            self.index.neighbors_of_point(
                (position.x, position.y),
                DEATH_DEPOSIT_RADIUS * DEATH_DEPOSIT_RADIUS,
                &mut |idx, dist_sq: OrderedFloat<f64>| {
                    if let Some(&other) = self.index_handles.get(idx)
                        && other != id
                    {
                        recipients.push((other, dist_sq.into_inner().sqrt()));
                    }
                },
            );
            for (other, dist) in recipients {
                let fade = (1.0 - dist / DEATH_DEPOSIT_RADIUS).max(0.0) * 0.7;
                if fade <= 0.0 {
                    continue;
                }
                if let Some(peer) = self.population.get_mut(other) {
                    if !peer.active {
                        continue;
                    }
                    for record in &deposits {
                        let mut copy = *record;
                        copy.id = self.next_pattern_id;
                        self.next_pattern_id += 1;
                        copy.strength = (copy.strength * fade).max(0.1);
                        copy.usage_count = 0;
                        peer.memory.shared.push(SharedMemory {
                            record: copy,
                            relevance: fade,
                            received_at: now,
                        });
                    }
                }
            }
        }

        self.population.unlink_all(id);
        self.population.mark_dead(id);
    }

    fn try_division(&mut self, id: EntityId) {
        let can_spawn = self.population.can_spawn();
        let child = {
            let Some(entity) = self.population.get_mut(id) else {
                return;
            };
            if !entity.active {
                return;
            }
            entity.update_division_stress();
            if !can_spawn
                || entity.internal.oscillation <= 0.5
                || entity.energy < self.config.division_energy_threshold
            {
                return;
            }
            let chance = (1.0 - entity.internal.stability) * 0.4
                + (entity.internal.oscillation - 0.5) * 0.3;
            if self.rng.random::<f64>() >= chance {
                return;
            }
            entity.divide(&mut self.rng)
        };
        let _ = self.population.queue_spawn(child);
    }

    fn spawn_entity(&mut self, x: Option<f64>, y: Option<f64>) {
        if self.population.len() >= self.config.max_entities {
            return;
        }
        let width = f64::from(self.config.grid_width);
        let height = f64::from(self.config.grid_height);
        let margin = self.config.boundary_margin;
        let position = Position::new(
            x.map_or_else(|| self.rng.random_range(margin..width - margin), |x| {
                x.clamp(0.0, width - 1e-6)
            }),
            y.map_or_else(|| self.rng.random_range(margin..height - margin), |y| {
                y.clamp(0.0, height - 1e-6)
            }),
        );
        // Newcomers are funded from the field so the energy budget holds.
        let granted = self
            .field
            .extract(position, self.config.default_entity_energy);
        let entity = Entity::new(&mut self.rng, position, granted);
        let _ = self.population.insert(entity);
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick_count(&self) -> Tick {
        self.tick
    }

    /// Whether the pause switch is set.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Read-only access to the population.
    #[must_use]
    pub fn population(&self) -> &Population {
        &self.population
    }

    /// Mutable access to the population (for scenario setup and tooling).
    #[must_use]
    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    /// Read-only access to the energy field.
    #[must_use]
    pub fn field(&self) -> &EnergyField {
        &self.field
    }

    /// Mutable access to the energy field.
    #[must_use]
    pub fn field_mut(&mut self) -> &mut EnergyField {
        &mut self.field
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// The most recent tick summary, if any tick has run.
    #[must_use]
    pub fn last_summary(&self) -> Option<&TickSummary> {
        self.history.back()
    }

    /// Entity energy + queued refunds + field energy.
    #[must_use]
    pub fn total_system_energy(&self) -> f64 {
        self.population.total_energy() + self.population.queued_energy() + self.field.total_energy()
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerProfile {
    energy: f64,
    oscillation: f64,
    permeability: f64,
    speed: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    fn test_config() -> SimulationConfig {
        SimulationConfig {
            rng_seed: Some(42),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn ring_buffer_overwrites_oldest() {
        let mut buffer = RingBuffer::new(3);
        for value in 0..5 {
            buffer.push(value);
        }
        assert_eq!(buffer.len(), 3);
        let mut stored: Vec<i32> = buffer.iter().copied().collect();
        stored.sort_unstable();
        assert_eq!(stored, vec![2, 3, 4]);
    }

    #[test]
    fn ring_buffer_mean() {
        let mut buffer = RingBuffer::new(4);
        assert_eq!(buffer.mean(), 0.0);
        buffer.push(1.0);
        buffer.push(3.0);
        assert!((buffer.mean() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn config_rejects_bad_diffusion_rate() {
        let config = SimulationConfig {
            diffusion_rate: 1.0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_zero_dimensions_and_speed() {
        let config = SimulationConfig {
            grid_width: 0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SimulationConfig {
            simulation_speed: 0.0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_oversized_colony() {
        let config = SimulationConfig {
            initial_entities: 200,
            initial_entity_energy: 1.0,
            total_energy: 100.0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn field_extract_clamps_to_cell_energy() {
        let mut field = EnergyField::new(8, 8, 0.05, (0.0, 0.0)).expect("field");
        field.inject(Position::new(2.5, 2.5), 0.4);
        let granted = field.extract(Position::new(2.5, 2.5), 1.0);
        assert!((granted - 0.4).abs() < 1e-12);
        assert!(field.cell_energy(2, 2).abs() < 1e-12);
    }

    #[test]
    fn field_extract_out_of_bounds_grants_nothing() {
        let mut field = EnergyField::new(8, 8, 0.05, (0.0, 0.0)).expect("field");
        field.seed_energy(10.0);
        let before = field.total_energy();
        assert_eq!(field.extract(Position::new(-1.0, 3.0), 1.0), 0.0);
        assert_eq!(field.extract(Position::new(3.0, 99.0), 1.0), 0.0);
        assert!((field.total_energy() - before).abs() < 1e-12);
    }

    #[test]
    fn field_inject_clamps_position_into_bounds() {
        let mut field = EnergyField::new(8, 8, 0.05, (0.0, 0.0)).expect("field");
        field.inject(Position::new(-5.0, -5.0), 1.0);
        assert!((field.cell_energy(0, 0) - 1.0).abs() < 1e-12);
        field.inject(Position::new(100.0, 100.0), 2.0);
        assert!((field.cell_energy(7, 7) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn field_seed_energy_distributes_requested_total() {
        let mut field = EnergyField::new(16, 16, 0.05, (1.3, 2.7)).expect("field");
        field.seed_energy(42.0);
        assert!((field.total_energy() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn diffusion_conserves_and_never_creates_energy() {
        let mut field = EnergyField::new(12, 9, 0.2, (0.4, 0.9)).expect("field");
        field.seed_energy(50.0);
        field.inject(Position::new(0.0, 0.0), 5.0);
        field.inject(Position::new(11.0, 8.0), 3.0);
        let before = field.total_energy();
        for _ in 0..10 {
            field.diffuse();
            let after = field.total_energy();
            assert!(after <= before + 1e-9);
            assert!((after - before).abs() < 1e-9);
        }
    }

    #[test]
    fn diffusion_spreads_a_point_source() {
        let mut field = EnergyField::new(9, 9, 0.4, (0.0, 0.0)).expect("field");
        field.inject(Position::new(4.5, 4.5), 8.0);
        field.diffuse();
        assert!(field.cell_energy(4, 4) < 8.0);
        assert!(field.cell_energy(3, 4) > 0.0);
        assert!(field.cell_energy(5, 5) > 0.0);
        assert!((field.total_energy() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_importance_prefers_success_and_recency() {
        let now = Tick(1000);
        let strong = PatternRecord {
            id: 0,
            pattern: BehaviorPattern::Maintain,
            conditions: PatternConditions::default(),
            success_rate: 0.9,
            strength: 0.8,
            usage_count: 12,
            last_used: Tick(990),
            inherited: false,
        };
        let weak = PatternRecord {
            id: 1,
            pattern: BehaviorPattern::Maintain,
            conditions: PatternConditions::default(),
            success_rate: 0.2,
            strength: 0.2,
            usage_count: 1,
            last_used: Tick(100),
            inherited: false,
        };
        assert!(strong.importance(now) > weak.importance(now));
    }

    #[test]
    fn record_outcome_caps_strength_and_rate() {
        let mut record = PatternRecord {
            id: 0,
            pattern: BehaviorPattern::Maintain,
            conditions: PatternConditions::default(),
            success_rate: 0.95,
            strength: 0.99,
            usage_count: 0,
            last_used: Tick::zero(),
            inherited: false,
        };
        for _ in 0..50 {
            record.record_outcome(true);
        }
        assert!(record.success_rate <= 1.0);
        assert!(record.strength <= 1.0);
        for _ in 0..500 {
            record.record_outcome(false);
        }
        assert!(record.strength >= 0.1);
        assert!(record.success_rate >= 0.0);
    }

    #[test]
    fn memory_compress_keeps_most_important() {
        let now = Tick(10);
        let mut memory = AdaptiveMemory::default();
        for idx in 0..6 {
            memory.patterns.push(PatternRecord {
                id: idx,
                pattern: BehaviorPattern::Maintain,
                conditions: PatternConditions::default(),
                success_rate: idx as f64 / 6.0,
                strength: 0.5,
                usage_count: idx,
                last_used: now,
                inherited: false,
            });
        }
        memory.compress(now, 3);
        assert_eq!(memory.patterns.len(), 3);
        assert!(memory.patterns.iter().any(|rec| rec.id == 5));
        assert!(!memory.patterns.iter().any(|rec| rec.id == 0));
    }

    #[test]
    fn abstraction_collapses_similar_patterns() {
        let now = Tick(100);
        let mut memory = AdaptiveMemory::default();
        for idx in 0..4 {
            memory.patterns.push(PatternRecord {
                id: idx,
                pattern: BehaviorPattern::Vibration {
                    frequency: 0.4 + idx as f64 * 0.01,
                    amplitude: 0.2,
                },
                conditions: PatternConditions::default(),
                success_rate: 0.6,
                strength: 0.5,
                usage_count: 2,
                last_used: now,
                inherited: false,
            });
        }
        let mut next_id = 100;
        memory.abstract_similar(now, &mut next_id);
        assert_eq!(memory.patterns.len(), 1);
        assert_eq!(memory.patterns[0].id, 100);
        assert_eq!(memory.patterns[0].usage_count, 8);
        match memory.patterns[0].pattern {
            BehaviorPattern::Vibration { frequency, .. } => {
                assert!(frequency > 0.35 && frequency < 0.5);
            }
            _ => panic!("expected vibration pattern"),
        }
    }

    #[test]
    fn division_splits_energy_exactly() {
        let mut rng = seeded_rng();
        let mut parent = Entity::new(&mut rng, Position::new(20.0, 20.0), 0.9);
        parent.internal.oscillation = 0.8;
        let before = parent.energy;
        let child = parent.divide(&mut rng);
        assert!((parent.energy + child.energy - before).abs() < 1e-12);
        assert_eq!(child.age, 0);
        assert!(child.active);
        assert!((parent.internal.stability - 0.8).abs() < 1e-12);
    }

    #[test]
    fn division_inherits_only_successful_patterns() {
        let mut rng = seeded_rng();
        let mut parent = Entity::new(&mut rng, Position::new(20.0, 20.0), 0.9);
        parent.memory.patterns.push(PatternRecord {
            id: 1,
            pattern: BehaviorPattern::Maintain,
            conditions: PatternConditions::default(),
            success_rate: 0.9,
            strength: 0.5,
            usage_count: 4,
            last_used: Tick(5),
            inherited: false,
        });
        parent.memory.patterns.push(PatternRecord {
            id: 2,
            pattern: BehaviorPattern::Maintain,
            conditions: PatternConditions::default(),
            success_rate: 0.2,
            strength: 0.5,
            usage_count: 4,
            last_used: Tick(5),
            inherited: false,
        });
        let child = parent.divide(&mut rng);
        assert_eq!(child.memory.patterns.len(), 1);
        assert_eq!(child.memory.patterns[0].id, 1);
        assert!(child.memory.patterns[0].inherited);
        assert!((child.memory.patterns[0].strength - 0.4).abs() < 1e-12);
    }

    #[test]
    fn population_link_is_symmetric_and_unlink_resets() {
        let mut engine = Engine::new(test_config()).expect("engine");
        let mut rng = seeded_rng();
        let a = engine
            .population_mut()
            .insert(Entity::new(&mut rng, Position::new(10.0, 10.0), 0.5))
            .expect("insert");
        let b = engine
            .population_mut()
            .insert(Entity::new(&mut rng, Position::new(11.0, 10.0), 0.5))
            .expect("insert");

        assert!(engine.population_mut().link(a, b));
        assert!(!engine.population_mut().link(a, b));
        let pop = engine.population();
        assert!(pop.get(a).expect("a").merge.partners.contains(&b));
        assert!(pop.get(b).expect("b").merge.partners.contains(&a));

        engine.population_mut().get_mut(a).expect("a").merge.strength = 0.9;
        engine.population_mut().unlink(a, b);
        let entity = engine.population().get(a).expect("a");
        assert!(entity.merge.partners.is_empty());
        assert_eq!(entity.merge.strength, 0.0);
    }

    #[test]
    fn engine_starts_on_budget() {
        let engine = Engine::new(test_config()).expect("engine");
        assert_eq!(engine.population().len(), 3);
        assert!((engine.total_system_energy() - TOTAL_SYSTEM_ENERGY).abs() < 1e-9);
    }

    #[test]
    fn pause_skips_tick_bodies() {
        let mut engine = Engine::new(test_config()).expect("engine");
        apply_control_command(&mut engine, ControlCommand::SetPaused(true));
        engine.tick();
        engine.tick();
        assert_eq!(engine.tick_count(), Tick::zero());
        apply_control_command(&mut engine, ControlCommand::SetPaused(false));
        engine.tick();
        assert_eq!(engine.tick_count(), Tick(1));
    }

    #[test]
    fn set_speed_rejects_non_positive_values() {
        let mut engine = Engine::new(test_config()).expect("engine");
        apply_control_command(&mut engine, ControlCommand::SetSpeed(-2.0));
        assert_eq!(engine.config().simulation_speed, 1.0);
        apply_control_command(&mut engine, ControlCommand::SetSpeed(0.0));
        assert_eq!(engine.config().simulation_speed, 1.0);
        apply_control_command(&mut engine, ControlCommand::SetSpeed(2.5));
        assert_eq!(engine.config().simulation_speed, 2.5);
    }

    #[test]
    fn spawn_command_is_funded_by_the_field() {
        let mut engine = Engine::new(test_config()).expect("engine");
        let before = engine.total_system_energy();
        apply_control_command(
            &mut engine,
            ControlCommand::SpawnEntity {
                x: Some(40.0),
                y: Some(40.0),
            },
        );
        assert_eq!(engine.population().len(), 4);
        assert!((engine.total_system_energy() - before).abs() < 1e-9);
    }

    #[test]
    fn spawn_command_respects_population_cap() {
        let config = SimulationConfig {
            max_entities: 3,
            ..test_config()
        };
        let mut engine = Engine::new(config).expect("engine");
        apply_control_command(&mut engine, ControlCommand::SpawnEntity { x: None, y: None });
        assert_eq!(engine.population().len(), 3);
    }

    #[test]
    fn snapshot_exposes_sorted_partner_lists() {
        let mut engine = Engine::new(test_config()).expect("engine");
        let ids: Vec<EntityId> = engine.population().ids().collect();
        engine.population_mut().link(ids[0], ids[1]);
        engine.population_mut().link(ids[0], ids[2]);
        let snapshot = engine.population().snapshot();
        let view = snapshot
            .iter()
            .find(|view| view.id == ids[0])
            .expect("view");
        assert!(view.is_merged);
        assert_eq!(view.merged_with.len(), 2);
        let mut sorted = view.merged_with.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, view.merged_with);
    }

    #[test]
    fn subjective_time_scales_with_energy_and_speed() {
        let slow = subjective_time(0.0, Tick(0), 1.0);
        let fast = subjective_time(1.0, Tick(0), 1.0);
        assert!(fast > slow);
        let doubled = subjective_time(0.5, Tick(0), 2.0);
        assert!((doubled - 2.0 * subjective_time(0.5, Tick(0), 1.0)).abs() < 1e-12);
    }

    #[test]
    fn exchange_energy_returns_overflow_to_field() {
        let mut rng = seeded_rng();
        let mut field = EnergyField::new(16, 16, 0.05, (0.0, 0.0)).expect("field");
        field.inject(Position::new(5.5, 5.5), 3.0);
        let mut entity = Entity::new(&mut rng, Position::new(5.5, 5.5), 0.999);
        entity.membrane.permeability = 0.9;
        let config = SimulationConfig::default();
        let total_before = field.total_energy() + entity.energy;
        entity.exchange_energy(&mut field, 1.0, &config);
        let queued: f64 = entity.return_queue.iter().map(|r| r.amount).sum();
        let total_after = field.total_energy() + entity.energy + queued;
        assert!(entity.energy <= 1.0);
        assert!((total_after - total_before).abs() < 1e-12);
    }

    #[test]
    fn clamp_speed_caps_velocity() {
        let mut rng = seeded_rng();
        let mut entity = Entity::new(&mut rng, Position::new(5.0, 5.0), 0.5);
        entity.velocity = Velocity::new(3.0, 4.0);
        entity.clamp_speed(0.5);
        assert!((entity.velocity.speed() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn kinematics_keeps_position_in_bounds() {
        let mut rng = seeded_rng();
        let config = SimulationConfig::default();
        let mut entity = Entity::new(&mut rng, Position::new(0.2, 0.2), 0.5);
        entity.velocity = Velocity::new(-0.5, -0.5);
        for _ in 0..50 {
            entity.integrate_kinematics(&mut rng, &config);
        }
        assert!(entity.position.x >= 0.0);
        assert!(entity.position.y >= 0.0);
        assert!(entity.position.x < f64::from(config.grid_width));
        assert!(entity.position.y < f64::from(config.grid_height));
    }
}
