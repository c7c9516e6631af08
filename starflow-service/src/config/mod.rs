// Pipeline Configuration Module
// YAML pipeline definitions, parsing with located errors, and semantic validation

pub mod error;
pub mod models;
pub mod parser;
pub mod validator;

pub use error::{ParseError, ParseErrorKind, ValidationError};
pub use models::{Action, PipelineDef, Settings, TaskDef};
pub use parser::PipelineParser;
pub use validator::PipelineValidator;
