//! # PostgreSQL / TimescaleDB 存储实现模块
//!
//! 目标表结构（`ensure_target` 自动创建，存在 timescaledb 扩展时转为 hypertable）：
//!
//! ```sql
//! create table <table> (
//!     measurement text not null,
//!     tags jsonb not null,
//!     ts timestamptz not null,
//!     fields jsonb not null,
//!     primary key (measurement, tags, ts)
//! );
//! ```
//!
//! 写入使用 `on conflict ... do update`，重复投递的点位覆盖旧值。

pub mod points;

pub use points::*;
