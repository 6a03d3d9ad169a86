//! 内存存储实现模块
//!
//! 仅用于测试与本地演练。

pub mod points;

pub use points::*;
