// ==========================================
// 配送路线引擎 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型，将下层错误转换为用户可读的错误消息
// ==========================================

use crate::domain::SequenceError;
use crate::engine::{ServiceError, StateLockError};
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
/// 所有错误信息必须包含显式原因
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 业务规则错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("业务规则违反: {0}")]
    BusinessRuleViolation(String),

    /// 手动排序前必须先优化（用户可见的拒绝）
    #[error("请先优化路线")]
    OptimizeFirst,

    // ==========================================
    // 外部服务错误
    // ==========================================
    #[error("外部服务不可用: {0}")]
    ServiceUnavailable(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::SerializationError(msg) => {
                ApiError::DatabaseError(format!("数据序列化失败: {}", msg))
            }
            RepositoryError::ValidationError(msg) => ApiError::ValidationError(msg),
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

// ==========================================
// 从 SequenceError 转换
// ==========================================
impl From<SequenceError> for ApiError {
    fn from(err: SequenceError) -> Self {
        match err {
            SequenceError::NotOptimized => ApiError::OptimizeFirst,
            SequenceError::WaypointNotFound(key) => ApiError::NotFound(format!("站点(key={})不存在", key)),
            SequenceError::DuplicateWaypoint(key) => {
                ApiError::BusinessRuleViolation(format!("站点已存在: key={}", key))
            }
            SequenceError::PhotoLimitExceeded { key, max } => {
                ApiError::InvalidInput(format!("站点{}最多保存{}张照片", key, max))
            }
            SequenceError::OrderMismatch(msg) => ApiError::InternalError(msg),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::ServiceUnavailable(err.to_string())
    }
}

impl From<StateLockError> for ApiError {
    fn from(err: StateLockError) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
