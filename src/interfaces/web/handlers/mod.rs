pub mod agents;
pub mod events;
