//! # Broker client contract and the in-memory reference broker.
//!
//! The container never talks wire protocol itself; it drives the
//! [`Connection`], [`Channel`] and [`Admin`] traits, which an AMQP client
//! adapter implements. [`MemoryBroker`] provides a complete in-process
//! implementation used by the test suite and the demos.

mod contract;
mod memory;

pub use contract::{
    Admin, Channel, Connection, ConsumeOptions, ConsumerSignal, ConsumerTagStrategy, QueueInfo,
};
pub use memory::MemoryBroker;
