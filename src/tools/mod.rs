//! 工具层：Tool trait、注册表、带超时与审计的执行器，以及内置工具

pub mod calculator;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod shell;
pub mod web_fetch;

pub use calculator::CalculatorTool;
pub use executor::ToolExecutor;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolDanger, ToolRegistry};
pub use shell::ShellTool;
pub use web_fetch::WebFetchTool;
