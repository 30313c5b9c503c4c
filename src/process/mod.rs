//! Declarative process definitions: model, loader, and the reference example

mod example;
pub mod loader;
mod model;

pub use loader::check_step_cycles;
pub use model::{
    Agent, Budget, Process, ResultStatus, Settings, Step, StepAttempt, StepResult, StepStatus, Validation,
};
