//! Prioritized experience replay.
//!
//! Bounded FIFO: once full, the oldest experience is evicted regardless of
//! priority. Sampling draws with replacement, `P(i) ∝ priority_i ^ alpha`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};
use crate::fingerprint::ContextFingerprint;

const DEFAULT_PRIORITY: f64 = 1.0;

/// One stored transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Experience {
    /// Context the action was taken in.
    pub context: ContextFingerprint,
    /// Action taken.
    pub action_id: String,
    /// Reward observed.
    pub reward: f64,
    /// Context after the action, when known.
    pub next_context: Option<ContextFingerprint>,
    /// Whether the session ended with this action.
    pub terminal: bool,
}

impl Experience {
    /// Terminal transition with no follow-up context.
    #[must_use]
    pub fn terminal(context: ContextFingerprint, action_id: impl Into<String>, reward: f64) -> Self {
        Self {
            context,
            action_id: action_id.into(),
            reward,
            next_context: None,
            terminal: true,
        }
    }
}

/// Experience drawn by [`ReplayBuffer::sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampledExperience {
    /// Id assigned by [`ReplayBuffer::add`]; stable across evictions.
    pub sequence: u64,
    /// Stored transition.
    pub experience: Experience,
    /// Priority at sampling time.
    pub priority: f64,
}

struct Slot {
    sequence: u64,
    experience: Experience,
    priority: f64,
}

struct ReplayState {
    slots: VecDeque<Slot>,
    next_sequence: u64,
    rng: StdRng,
}

impl ReplayState {
    // Sequences are contiguous from the front slot, so lookup is positional.
    fn slot_mut(&mut self, sequence: u64) -> Option<&mut Slot> {
        let first = self.slots.front()?.sequence;
        let offset = usize::try_from(sequence.checked_sub(first)?).ok()?;
        self.slots.get_mut(offset)
    }
}

/// Capacity-bounded prioritized replay buffer. In-memory only.
pub struct ReplayBuffer {
    state: Mutex<ReplayState>,
    capacity: usize,
    alpha: f64,
}

impl ReplayBuffer {
    /// Create a buffer; a `seed` makes sampling reproducible.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for zero capacity or a negative
    /// or non-finite `alpha`.
    pub fn new(capacity: usize, alpha: f64, seed: Option<u64>) -> PolicyResult<Self> {
        if capacity == 0 {
            return Err(PolicyError::invalid("replay capacity must be > 0"));
        }
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(PolicyError::invalid(format!(
                "replay alpha must be finite and >= 0, got {alpha}"
            )));
        }
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Ok(Self {
            state: Mutex::new(ReplayState {
                slots: VecDeque::with_capacity(capacity.min(1024)),
                next_sequence: 0,
                rng,
            }),
            capacity,
            alpha,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_priority(priority: f64) -> PolicyResult<()> {
        if priority.is_finite() && priority > 0.0 {
            Ok(())
        } else {
            Err(PolicyError::invalid(format!(
                "priority must be finite and > 0, got {priority}"
            )))
        }
    }

    /// Store an experience and return its sequence id. Without `priority`,
    /// the current maximum (or 1.0 for an empty buffer) is used so new items
    /// get sampled soon.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for a non-positive or non-finite
    /// priority or reward.
    pub fn add(&self, experience: Experience, priority: Option<f64>) -> PolicyResult<u64> {
        if !experience.reward.is_finite() {
            return Err(PolicyError::invalid(format!(
                "experience reward must be finite, got {}",
                experience.reward
            )));
        }
        if let Some(priority) = priority {
            Self::check_priority(priority)?;
        }

        let mut state = self.lock();
        let priority = priority.unwrap_or_else(|| {
            state
                .slots
                .iter()
                .map(|slot| slot.priority)
                .reduce(f64::max)
                .unwrap_or(DEFAULT_PRIORITY)
        });
        if state.slots.len() == self.capacity {
            state.slots.pop_front();
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.slots.push_back(Slot {
            sequence,
            experience,
            priority,
        });
        Ok(sequence)
    }

    /// Draw `k` experiences with replacement.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::EmptyReplayBuffer`] when nothing is stored.
    pub fn sample(&self, k: usize) -> PolicyResult<Vec<SampledExperience>> {
        let mut state = self.lock();
        if state.slots.is_empty() {
            return Err(PolicyError::EmptyReplayBuffer);
        }

        let weights: Vec<f64> = state
            .slots
            .iter()
            .map(|slot| slot.priority.powf(self.alpha))
            .collect();
        let distribution = WeightedIndex::new(&weights).map_err(|error| {
            PolicyError::invalid(format!("replay priorities are not sampleable: {error}"))
        })?;

        let ReplayState { slots, rng, .. } = &mut *state;
        Ok((0..k)
            .map(|_| {
                let slot = &slots[distribution.sample(rng)];
                SampledExperience {
                    sequence: slot.sequence,
                    experience: slot.experience.clone(),
                    priority: slot.priority,
                }
            })
            .collect())
    }

    /// Replace the priority of the experience with id `sequence`.
    ///
    /// # Errors
    ///
    /// [`PolicyError::InvalidInput`] for a bad priority;
    /// [`PolicyError::NotFound`] when the experience was evicted or never
    /// stored.
    pub fn update_priority(&self, sequence: u64, priority: f64) -> PolicyResult<()> {
        Self::check_priority(priority)?;
        let mut state = self.lock();
        let slot = state.slot_mut(sequence).ok_or_else(|| {
            PolicyError::NotFound(format!("replay experience {sequence} is no longer stored"))
        })?;
        slot.priority = priority;
        Ok(())
    }

    /// Stored experiences, oldest first.
    #[must_use]
    pub fn experiences(&self) -> Vec<Experience> {
        self.lock()
            .slots
            .iter()
            .map(|slot| slot.experience.clone())
            .collect()
    }

    /// Number of stored experiences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of stored experiences.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
