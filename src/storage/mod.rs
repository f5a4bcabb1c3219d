pub mod attempt_log;
pub mod templates;

pub use attempt_log::{AttemptLog, AttemptRecord};
pub use templates::{EnrolledModel, TemplateCache};
