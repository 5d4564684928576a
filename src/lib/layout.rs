//! # Signal Arena and Pool Layouts
//!
//! All signals of one build live in a single arena addressed by `EventId`.
//! The arena is split into contiguous logical-role slices by a fixed
//! `RoleTable`:
//!
//! ```text
//!  0            n/4        n/4+n/8      target   target+1          n
//!  |---- base ----|-- timing --|-- secondary --|hub|--- kernel-phase ---|
//! ```
//!
//! A `PoolLayout` decides how those signals map onto backend pools. The
//! mapping never changes which `EventId` a command refers to, so a graph built
//! once can be realized under either layout with identical edges.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::model::{ConfigError, ContextId, PoolId, PoolLayout, SignalId};

/// Stable handle of a signal inside the arena (its logical event index).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub usize);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "events[{}]", self.0)
    }
}

/// Logical role of a slice of the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRole {
    Base,
    Timing,
    SecondaryTiming,
    Hub,
    KernelPhase,
}

impl SignalRole {
    /// Roles in arena order.
    pub const ARENA_ORDER: [SignalRole; 5] = [
        SignalRole::Base,
        SignalRole::Timing,
        SignalRole::SecondaryTiming,
        SignalRole::Hub,
        SignalRole::KernelPhase,
    ];

    /// Roles in pool creation order under the partitioned layout.
    pub const POOL_ORDER: [SignalRole; 5] = [
        SignalRole::Base,
        SignalRole::Timing,
        SignalRole::SecondaryTiming,
        SignalRole::KernelPhase,
        SignalRole::Hub,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SignalRole::Base => "base",
            SignalRole::Timing => "timing",
            SignalRole::SecondaryTiming => "secondary-timing",
            SignalRole::Hub => "hub",
            SignalRole::KernelPhase => "kernel-phase",
        }
    }
}

/// Fixed partition of `event_count` signals into role slices.
///
/// `base = n/4`, `timing = n/8`, secondary-timing fills up to the target, the
/// hub is exactly the target event and kernel-phase takes the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    event_count: usize,
    ranges: [Range<usize>; 5],
}

impl RoleTable {
    pub fn new(event_count: usize, target: usize) -> Result<Self, ConfigError> {
        if u32::try_from(event_count).is_err() {
            return Err(ConfigError::TooManyEvents(event_count));
        }
        if target >= event_count {
            return Err(ConfigError::TargetOutOfRange {
                target,
                max: event_count.saturating_sub(1),
            });
        }

        let base = event_count / 4;
        let timing = event_count / 8;
        let secondary_start = base + timing;

        let ranges = [
            0..base,
            base..secondary_start,
            secondary_start.min(target)..target,
            target..target + 1,
            target + 1..event_count,
        ];

        for (role, range) in SignalRole::ARENA_ORDER.iter().zip(ranges.iter()) {
            if range.is_empty() {
                return Err(ConfigError::EmptyRole {
                    events: event_count,
                    target,
                    role: role.name(),
                });
            }
        }

        Ok(Self {
            event_count,
            ranges,
        })
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Arena range covered by `role`.
    pub fn range(&self, role: SignalRole) -> Range<usize> {
        let idx = SignalRole::ARENA_ORDER
            .iter()
            .position(|r| *r == role)
            .unwrap_or_default();
        self.ranges[idx].clone()
    }

    pub fn len(&self, role: SignalRole) -> usize {
        self.range(role).len()
    }

    pub fn role_of(&self, event: EventId) -> Option<SignalRole> {
        SignalRole::ARENA_ORDER
            .iter()
            .zip(self.ranges.iter())
            .find(|(_, range)| range.contains(&event.0))
            .map(|(role, _)| *role)
    }

    /// The single hub event.
    pub fn hub(&self) -> EventId {
        EventId(self.range(SignalRole::Hub).start)
    }
}

/// One pool the layout asks the backend for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    /// Role served, `None` for the unified pool
    pub role: Option<SignalRole>,
    pub capacity: u32,
    /// Events drawn from this pool; slot = event - events.start
    pub events: Range<usize>,
}

/// Slot count for a range of a validated table.
fn slot_count(len: usize) -> u32 {
    // RoleTable::new rejects counts past u32::MAX
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Pools to create for `layout`, in creation order.
pub fn plan_pools(layout: PoolLayout, roles: &RoleTable, unified_capacity: u32) -> Vec<PoolPlan> {
    match layout {
        PoolLayout::Unified => vec![PoolPlan {
            role: None,
            capacity: unified_capacity.max(slot_count(roles.event_count())),
            events: 0..roles.event_count(),
        }],
        PoolLayout::Partitioned => SignalRole::POOL_ORDER
            .iter()
            .map(|&role| PoolPlan {
                role: Some(role),
                capacity: slot_count(roles.len(role)),
                events: roles.range(role),
            })
            .collect(),
    }
}

/// Backend signals for every `EventId`, plus the pools that own them.
#[derive(Debug)]
pub struct SignalArena {
    layout: PoolLayout,
    roles: RoleTable,
    pools: Vec<PoolId>,
    signals: Vec<SignalId>,
}

impl SignalArena {
    /// Create the pools, then one reset signal per event in index order.
    pub fn create<B: Backend>(
        backend: &mut B,
        context: ContextId,
        layout: PoolLayout,
        roles: RoleTable,
        unified_capacity: u32,
    ) -> Result<Self> {
        let plans = plan_pools(layout, &roles, unified_capacity);

        let mut pools = Vec::with_capacity(plans.len());
        for plan in &plans {
            let pool = backend
                .create_signal_pool(context, plan.capacity)
                .with_context(|| format!("create_signal_pool(capacity {})", plan.capacity))?;
            debug!(
                "[ARENA:POOL] {} capacity {} for {:?}",
                pool,
                plan.capacity,
                plan.role.map(SignalRole::name).unwrap_or("all roles")
            );
            pools.push(pool);
        }

        let mut signals = Vec::with_capacity(roles.event_count());
        for (pool, plan) in pools.iter().zip(plans.iter()) {
            for event in plan.events.clone() {
                let slot = slot_count(event - plan.events.start);
                let signal = backend
                    .create_signal(*pool, slot)
                    .with_context(|| format!("create_signal({} slot {})", pool, slot))?;
                backend
                    .reset_signal(signal)
                    .with_context(|| format!("reset_signal({})", signal))?;
                signals.push(signal);
            }
        }

        info!(
            "[ARENA:CREATE] {} events across {} {} pool(s)",
            signals.len(),
            pools.len(),
            layout
        );

        Ok(Self {
            layout,
            roles,
            pools,
            signals,
        })
    }

    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    pub fn pools(&self) -> &[PoolId] {
        &self.pools
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn get(&self, event: EventId) -> Option<SignalId> {
        self.signals.get(event.0).copied()
    }

    /// Backend signal behind `event`.
    pub fn signal(&self, event: EventId) -> Result<SignalId> {
        self.get(event)
            .with_context(|| format!("{} is outside an arena of {}", event, self.len()))
    }

    /// Signals in one role slice.
    pub fn slice(&self, role: SignalRole) -> &[SignalId] {
        &self.signals[self.roles.range(role)]
    }

    /// Start a new reset cycle on every signal.
    pub fn reset_all<B: Backend>(&self, backend: &mut B) -> Result<()> {
        for signal in &self.signals {
            backend
                .reset_signal(*signal)
                .with_context(|| format!("reset_signal({})", signal))?;
        }
        Ok(())
    }

    /// Destroy signals, then pools, each in reverse creation order.
    ///
    /// The caller must have synchronized every stream that references them.
    pub fn destroy<B: Backend>(self, backend: &mut B) -> Result<()> {
        for signal in self.signals.iter().rev() {
            backend
                .destroy_signal(*signal)
                .with_context(|| format!("destroy_signal({})", signal))?;
        }
        for pool in self.pools.iter().rev() {
            backend
                .destroy_pool(*pool)
                .with_context(|| format!("destroy_pool({})", pool))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceId;
    use crate::sim::SimulatedBackend;

    #[test]
    fn test_role_table_sixteen() {
        let roles = RoleTable::new(16, 9).unwrap();
        assert_eq!(roles.range(SignalRole::Base), 0..4);
        assert_eq!(roles.range(SignalRole::Timing), 4..6);
        assert_eq!(roles.range(SignalRole::SecondaryTiming), 6..9);
        assert_eq!(roles.range(SignalRole::Hub), 9..10);
        assert_eq!(roles.range(SignalRole::KernelPhase), 10..16);
        assert_eq!(roles.hub(), EventId(9));
        assert_eq!(roles.role_of(EventId(12)), Some(SignalRole::KernelPhase));
        assert_eq!(roles.role_of(EventId(16)), None);
    }

    #[test]
    fn test_role_table_rejects_empty_slice() {
        assert!(matches!(
            RoleTable::new(16, 5),
            Err(ConfigError::EmptyRole {
                role: "secondary-timing",
                ..
            })
        ));
        assert!(matches!(
            RoleTable::new(16, 15),
            Err(ConfigError::EmptyRole {
                role: "kernel-phase",
                ..
            })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_role_table_rejects_oversized_arena() {
        let events = u32::MAX as usize + 1;
        assert_eq!(
            RoleTable::new(events, events / 2),
            Err(ConfigError::TooManyEvents(events))
        );
    }

    #[test]
    fn test_partitioned_pool_sizes() {
        let roles = RoleTable::new(16, 9).unwrap();
        let sizes: Vec<u32> = plan_pools(PoolLayout::Partitioned, &roles, 16)
            .iter()
            .map(|p| p.capacity)
            .collect();
        assert_eq!(sizes, vec![4, 2, 3, 6, 1]);

        let unified = plan_pools(PoolLayout::Unified, &roles, 1000);
        assert_eq!(unified.len(), 1);
        assert_eq!(unified[0].capacity, 1000);
        assert_eq!(unified[0].events, 0..16);
    }

    #[test]
    fn test_arena_slices_and_teardown() {
        let mut backend = SimulatedBackend::default();
        let device: DeviceId = backend.enumerate_devices().unwrap()[0];
        let ctx = backend.create_context(device).unwrap();
        let roles = RoleTable::new(16, 9).unwrap();

        let arena =
            SignalArena::create(&mut backend, ctx, PoolLayout::Partitioned, roles, 16).unwrap();
        assert_eq!(arena.len(), 16);
        assert_eq!(arena.pools().len(), 5);
        assert_eq!(arena.slice(SignalRole::KernelPhase).len(), 6);

        // Hub sits alone in the last pool
        let hub = arena.signal(EventId(9)).unwrap();
        assert_eq!(
            backend.signal_location(hub).unwrap(),
            (arena.pools()[4], 0)
        );
        assert!(arena.signal(EventId(16)).is_err());

        arena.destroy(&mut backend).unwrap();
        backend.destroy_context(ctx).unwrap();
        assert_eq!(backend.live_objects(), 0);
    }
}
