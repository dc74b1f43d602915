//! 核心层：错误分类与引擎装配

pub mod engine;
pub mod error;

pub use engine::{parse_params, Engine};
pub use error::{ExecError, RegistryError};
