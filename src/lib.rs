pub mod core;
pub mod models;
pub mod platform;

pub use crate::core::calculator::{
    Calculator, CalculatorContext, CalculatorFactory, CalculatorRegistry,
};
pub use crate::core::config::TrackingConfig;
pub use crate::core::scheduler::{FrameScheduler, IntervalScheduler, YieldScheduler};
pub use crate::core::tracking_solution::{
    SessionParts, TickOutcome, TrackingError, TrackingResult, TrackingSolution,
};
