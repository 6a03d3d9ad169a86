//! # Bridge Storage 模块
//!
//! 时序库写入的存储抽象与适配层。
//!
//! - [`traits`]：`TimeSeriesStore`（时序库客户端）与 `BatchSink`（写缓冲使用的批次写入）
//! - [`error`]：`StorageError`（带可自愈分类）与 `SinkError`（Retryable / Fatal）
//! - [`sink`]：`StorageSink` 适配器（超时 + 分类 + 延迟指标）
//! - [`connection`]：Postgres 连接池
//! - [`in_memory`]：内存实现（测试）
//! - [`postgres`]：Postgres / TimescaleDB 实现（生产）
//!
//! 存储客户端由进程装配时创建并注入 `StorageSink`，不存在进程级单例。

pub mod connection;
pub mod error;
pub mod in_memory;
pub mod postgres;
pub mod sink;
pub mod traits;

pub use connection::*;
pub use error::*;
pub use in_memory::InMemoryTimeSeriesStore;
pub use postgres::PgTimeSeriesStore;
pub use sink::StorageSink;
pub use traits::*;
