//! Concrete tool providers.
//!
//! These providers plug into the agent core through the [`ToolProvider`]
//! contract and exercise the subprocess monitor for background work.
//!
//! [`ToolProvider`]: crate::tool::ToolProvider

pub mod python;
pub mod workdir;

pub use python::PythonWorkspace;
pub use workdir::WorkDir;
