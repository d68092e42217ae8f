// ==========================================
// 配送路线引擎 - 应用层
// ==========================================
// 职责: 装配各层，向宿主提供统一入口
// ==========================================

pub mod state;

// 重导出
pub use state::{get_default_db_path, AppState, OverlayPlatform, RoutingServices};
