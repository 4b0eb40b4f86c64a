mod error;
pub mod models;
mod pool;
pub mod repositories;
mod store;
#[cfg(test)]
mod test_support;

pub use error::*;
pub use models::SchedulerJob;
pub use pool::*;
pub use repositories::*;
pub use store::Store;
