//! 命令定义和实现

pub mod demo;
pub mod run;

pub use demo::DemoCommand;
pub use run::RunCommand;
