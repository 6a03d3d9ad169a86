//! 存储层错误类型
//!
//! 定义两层错误：
//! - StorageError：底层存储客户端错误，携带是否可自愈的分类
//! - SinkError：写缓冲看到的结果，只有 Retryable 参与重试

/// 底层错误的性质。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// 超时、连接被拒、服务过载等可自愈错误
    Transient,
    /// 请求非法、认证失败等无法通过重试解决的错误
    Rejected,
}

#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    message: String,
}

impl StorageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| is_transient_sqlstate(&code))
                .unwrap_or(false),
            _ => false,
        };
        if transient {
            Self::transient(err.to_string())
        } else {
            Self::rejected(err.to_string())
        }
    }
}

/// SQLSTATE 中可自愈的错误码：连接异常(08)、资源不足(53)、
/// 管理员关闭/暂不可连(57P0x)、查询取消(57014)、序列化冲突/死锁(40001/40P01)、
/// 锁不可用(55P03)。认证失败(28)与语法/约束错误均不可重试。
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P0")
        || matches!(code, "57014" | "40001" | "40P01" | "55P03")
}

/// 写入结果错误（写缓冲据此决定重试或死信）。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable(_))
    }
}

impl From<StorageError> for SinkError {
    fn from(err: StorageError) -> Self {
        match err.kind() {
            StorageErrorKind::Transient => SinkError::Retryable(err.to_string()),
            StorageErrorKind::Rejected => SinkError::Fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("53300"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(!is_transient_sqlstate("28P01"));
        assert!(!is_transient_sqlstate("42P01"));
        assert!(!is_transient_sqlstate("23505"));
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err: SinkError = StorageError::from(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn row_not_found_is_fatal() {
        let err: SinkError = StorageError::from(sqlx::Error::RowNotFound).into();
        assert!(matches!(err, SinkError::Fatal(_)));
    }
}
