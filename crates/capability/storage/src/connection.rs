//! 数据库连接管理
//!
//! 提供时序库连接池初始化功能：
//! - connect_pool：建立 Postgres 连接池（可单独传入账号密码）

use crate::error::StorageError;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;

/// 建立 Postgres 连接池
///
/// 最大连接数限制为 8；`username`/`password` 存在时覆盖 URL 中的凭据。
pub async fn connect_pool(
    database_url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<PgPool, StorageError> {
    let mut options = PgConnectOptions::from_str(database_url)
        .map_err(|err| StorageError::rejected(format!("invalid storage url: {}", err)))?;
    if let Some(username) = username {
        options = options.username(username);
    }
    if let Some(password) = password {
        options = options.password(password);
    }
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}
