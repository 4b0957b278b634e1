//! Vector clock for establishing happens-before between registry events
//! without synchronized wall clocks.
//!
//! Unlike a typical CRDT clock that mutates in place, this one is immutable:
//! every operation returns a new value. That matches the registry's need to
//! hand out a clock as part of an otherwise-immutable `ServiceInstance`.

mod vector_clock;

pub use vector_clock::VectorClock;
