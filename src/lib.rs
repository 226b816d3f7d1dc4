//! Waypoint: a stepwise orchestration engine.
//!
//! Work moves through pre-declared flow graphs of station-backed steps. A
//! deterministic compiler turns (flow, step, run context) into a hashable
//! instruction plan, an external execution engine runs it behind the
//! [`orchestrator::Engine`] seam, and the routing engine maps the
//! structured handoff onto the next position. Run state is an append-only
//! snapshot log; specifications change only through the concurrency-guarded
//! store.

pub mod api;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod events;
pub mod flow;
pub mod fragment;
pub mod handoff;
pub mod orchestrator;
pub mod routing;
pub mod runstate;
pub mod specstore;
pub mod station;
