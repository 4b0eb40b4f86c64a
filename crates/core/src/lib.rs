//! Domain model of the Cryton hive: plan templates, execution records,
//! their lifecycle states, trigger arguments and plan validation.

pub mod domain;
mod error;
pub mod keypath;
pub mod validation;

pub use domain::*;
pub use error::{EntityKind, ValidationError};
pub use keypath::{KeyPath, PathSegment};
pub use validation::{parse_plan_document, validate_plan, validate_step_arguments, PARENT_PREFIX};
