//! Alert evaluation: rule snapshots, per-series sample windows, the
//! pending/firing/recovered state machine, active event persistence, mutes
//! and the notification repeat clock.
//!
//! Threshold rules are pushed points through [`Evaluator`] acting as the
//! cluster's local [`ringwatch_cluster::PointSink`]; range-query rules pull
//! from a [`tsdb::TsdbClient`] on the peer that owns them.

pub mod error;
pub mod evaluator;
pub mod event_store;
pub mod filter;
pub mod mute;
pub mod notify;
pub mod predicate;
pub mod rule;
pub mod rule_store;
pub mod state;
pub mod sweeper;
pub mod tsdb;
pub mod window;


pub use error::AlertError;
pub use evaluator::{Evaluator, EvaluatorParts};
pub use event_store::{ActiveEvent, EventStore, PersistPolicy};
pub use mute::MuteIndex;
pub use notify::{NotifyRequest, NotifyScheduler};
pub use rule::Rule;
pub use rule_store::{RuleSnapshot, RuleStore};
pub use state::StateTable;
pub use sweeper::Sweeper;
pub use tsdb::{QuerySeries, TsdbClient};
pub use window::WindowStore;
