//! Paper-roll trim planning: randomized search for 2-way and 3-way width
//! pairings across two sequential trimming stages, scheduled per material
//! grade with cooperative cancellation.

pub mod export;
pub mod optimizer;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;
