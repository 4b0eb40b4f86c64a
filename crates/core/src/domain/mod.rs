mod execution;
mod plan;
mod report;
mod state;
mod trigger;
mod worker;

pub use execution::*;
pub use plan::*;
pub use report::*;
pub use state::*;
pub use trigger::*;
pub use worker::*;
