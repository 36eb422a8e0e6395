//! Orchestration of period streams
//!
//! One [`PeriodStream`] loads one media type of one period. The
//! [`StreamOrchestrator`] runs them per media type, chains consecutive
//! periods, restarts on seeks out of the loaded periods and reports what it
//! does as [`StreamEvent`]s.

pub mod active_period;
pub mod events;
pub mod needed;
pub mod orchestrator;
pub mod period;

pub use active_period::ActivePeriodTracker;
pub use events::{EventSender, StreamEvent};
pub use orchestrator::StreamOrchestrator;
pub use period::{PeriodStream, PeriodStreamHandle, PeriodStreamState, PeriodStreamStatus, StreamContext};
