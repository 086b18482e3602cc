pub mod config;
pub mod context;
pub mod cursor;
pub mod document;
pub mod engine;
pub mod error;
pub mod expression;
pub mod operators;
pub mod pipeline;
pub mod query;
pub mod script;
pub mod source;
pub mod value;

pub use config::EngineConfig;
pub use context::{Environment, EvalContext, MemoryEnvironment, Runtime};
pub use cursor::{ArrayCursor, BoxCursor, Cursor, CursorExt, TransformCursor, from_iter, from_stream, from_values};
pub use document::{Document, FieldPath};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use expression::{Expression, Parser};
pub use operators::{ArgShape, FnOperator, Operator, Registry};
pub use pipeline::{Pipeline, Services};
pub use script::{ScriptError, ScriptHost, ScriptResult};
pub use source::{DataSource, Expander, Expansion, MemorySource, QueryDescriptor};
pub use value::Value;
