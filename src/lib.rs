//! CloudSim: a deterministic, discrete-event simulator of a distributed
//! storage fabric (event scheduler, routing fabric, per-link
//! bandwidth-sharing transfer engine, per-node virtual OS/disk, and a
//! replica-cluster manager).

pub mod cluster;
pub mod config;
pub mod controller;
pub mod disk;
pub mod event;
pub mod ids;
pub mod node;
pub mod os;
pub mod routing;
pub mod sim;
pub mod snapshot;
pub mod transfer;
pub mod units;

pub use controller::{ControllerAPI, ControllerError, ControllerResult};
pub use sim::Simulator;
