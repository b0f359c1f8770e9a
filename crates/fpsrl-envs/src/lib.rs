//! Built-in environments for fpsrl.
//!
//! Provides:
//! - `Arena` - first-person target shooting with stacked RGB frames, in
//!   several `Scenario` variations usable as a task sequence

mod arena;

pub use arena::{Arena, ArenaConfig, Scenario, AMMO, HEALTH};
