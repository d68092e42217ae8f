// ==========================================
// 配送路线引擎 - 数据仓储层
// ==========================================
// 职责: 持久化键值存储（序列、导航进度、悬浮窗位置）
// 红线: 不含排序/估算逻辑
// ==========================================

pub mod error;
pub mod route_store;

pub use error::{RepositoryError, RepositoryResult};
pub use route_store::{route_keys, RouteStore, SqliteRouteStore};
