//! Small runtime-agnostic building blocks shared between `netifd-core` and
//! the `netifd` binary: a reactive watch cell and process supervision
//! helpers (spawn, graceful-then-forceful shutdown of a child).

mod process;
mod property;

pub use process::{ChildGuard, SpawnError, send_signal, spawn_tracked, terminate};
pub use property::{Property, PropertyStream};
