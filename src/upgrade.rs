//! Rolling node replacement.

pub mod lifecycle;
pub mod orchestrator;
pub mod scaler;
