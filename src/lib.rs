//! Lateral path planner
//!
//! Turns vehicle and lane-sensing telemetry into a rate-limited steering and
//! lane plan every control cycle, while learning sensor and model biases
//! online and arbitrating between candidate models.

pub mod arbitration;
pub mod bus;
pub mod calibration;
pub mod decoder;
pub mod error;
pub mod history;
pub mod inference;
pub mod learning;
pub mod planner;
pub mod status;
pub mod trajectory;
pub mod tuning;
pub mod types;

pub use error::{PlannerError, PlannerResult};
pub use planner::{ControlLoopState, Planner, PlannerConfig};
pub use types::{CarState, PathPlan};
