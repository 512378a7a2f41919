pub mod handler;
pub mod registry;

pub use handler::{ToolDef, ToolHandler, ToolParameter};
pub use registry::ToolRegistry;
