//! Catalog actions the completion service can request mid-exchange
//!
//! Actions declare a typed parameter schema ([`ParamSpec`]) and are invoked
//! through [`ToolDispatcher::invoke`], which always returns text. Failures
//! become an explanatory string rather than an error the orchestrator has to
//! interpret.

mod dispatcher;
mod tool;

pub use dispatcher::ToolDispatcher;
pub use tool::{BoxedTool, FnTool, ParamSpec, ParamType, Tool, ToolArgs, ToolError, ToolMetadata};
