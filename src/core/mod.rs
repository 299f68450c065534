//! # Core runtime: container, workers, consumers, scaling.

mod active;
mod consumer;
mod container;
mod redeclare;
mod scaling;
mod worker;

pub use container::{Container, ContainerBuilder, ContainerState};
pub use redeclare::RedeclareHook;
