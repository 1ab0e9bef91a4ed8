//! Entity → lane routing.
//!
//! All HIGH events for one entity must be drained by the same lane, so the
//! lane is a pure function of the entity id: the first eight bytes of its
//! BLAKE3 digest modulo the lane count. No router state exists; two router
//! instances with the same lane count agree forever, across restarts.
//!
//! Changing the lane count remaps entities. That requires a coordinated
//! restart of every worker, never a rolling one.

use std::fmt;

use crate::entity::{EntityId, EntityIdValidator};
use crate::error::ValidationError;
use crate::event::{PriorityClass, TriggerEvent};

/// Where an event will be processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaneAssignment {
    /// The validated entity id.
    pub entity_id: EntityId,
    /// Priority class carried by the event.
    pub priority: PriorityClass,
    /// Lane index within the priority class (always 0 for the shared LOW lane).
    pub lane_index: usize,
}

impl fmt::Display for LaneAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.priority, self.lane_index)
    }
}

/// Routes trigger events to lanes.
pub trait EntityRouter: Send + Sync {
    /// Assigns a lane, or rejects the event if its entity cannot be resolved.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` when the entity id is blank or invalid.
    fn route(&self, event: &TriggerEvent) -> Result<LaneAssignment, ValidationError>;

    /// Number of HIGH lanes this router maps onto.
    fn high_lanes(&self) -> usize;
}

/// Stable 64-bit hash of an entity id.
#[must_use]
pub fn stable_hash(entity_id: &EntityId) -> u64 {
    let digest = blake3::hash(entity_id.routing_key());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Default router: stable hash modulo the HIGH lane count.
#[derive(Debug, Clone)]
pub struct HashRouter {
    high_lanes: usize,
    validator: EntityIdValidator,
}

impl HashRouter {
    /// Creates a router over `high_lanes` lanes (at least one).
    #[must_use]
    pub fn new(high_lanes: usize) -> Self {
        Self::with_validator(high_lanes, EntityIdValidator::default())
    }

    /// Creates a router with a custom entity id validator.
    #[must_use]
    pub fn with_validator(high_lanes: usize, validator: EntityIdValidator) -> Self {
        Self {
            high_lanes: high_lanes.max(1),
            validator,
        }
    }

    /// The HIGH lane for an entity.
    #[must_use]
    pub fn high_lane_for(&self, entity_id: &EntityId) -> usize {
        // `high_lanes` fits in u64 on every supported target.
        #[allow(clippy::cast_possible_truncation)]
        let lane = (stable_hash(entity_id) % self.high_lanes as u64) as usize;
        lane
    }
}

impl EntityRouter for HashRouter {
    fn route(&self, event: &TriggerEvent) -> Result<LaneAssignment, ValidationError> {
        let entity_id = self
            .validator
            .parse(&event.entity_id)
            .map_err(|e| ValidationError::MalformedEvent {
                reason: format!("unresolvable entity id: {e}"),
            })?;

        let lane_index = match event.priority {
            PriorityClass::High => self.high_lane_for(&entity_id),
            PriorityClass::Low => 0,
        };

        Ok(LaneAssignment {
            entity_id,
            priority: event.priority,
            lane_index,
        })
    }

    fn high_lanes(&self) -> usize {
        self.high_lanes
    }
}
