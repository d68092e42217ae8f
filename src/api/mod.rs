// ==========================================
// 配送路线引擎 - API 层
// ==========================================
// 职责: 提供排序界面的业务 API，屏蔽引擎与仓储细节
// ==========================================

pub mod error;
pub mod route_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use route_api::RouteApi;
