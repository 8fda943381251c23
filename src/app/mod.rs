pub mod bootstrap;

pub use bootstrap::{CheckpointService, ServiceHealth};
