// ==========================================
// 配送路线引擎 - 核心库
// ==========================================
// 技术栈: Rust + tokio + SQLite
// 系统定位: 排序界面 + 悬浮窗 双界面的路线排序、到达估算与导航驱动
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 站点、序列、矩阵
pub mod domain;

// 数据仓储层 - 键值持久化
pub mod repository;

// 引擎层 - 排序、估算、重优化、悬浮窗
pub mod engine;

// 配置层 - 引擎配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 排序界面接口
pub mod api;

// 应用层 - 构造注入
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::{
    Coordinates, NavigationProgress, OverlayPhase, StopAction, TravelTimeMatrix, Waypoint, WaypointKey,
    WaypointSequence, WaypointStatus,
};

// 引擎
pub use engine::{
    ArrivalEstimate, CrossSurfaceSync, OverlaySurfaceHandle, ProximityTracker, ReorderEngine,
    SilentReoptimizer,
};

// API
pub use api::{ApiError, ApiResult, RouteApi};

// 应用
pub use app::AppState;

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "配送路线引擎";
