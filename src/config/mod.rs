// ==========================================
// 配送路线引擎 - 配置层
// ==========================================
// 职责: 引擎配置默认值 + config_kv 表覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod engine_config;

// 重导出核心配置
pub use config_manager::{config_keys, ConfigManager};
pub use engine_config::{
    ArrivalConfig, EngineConfig, OverlayConfig, ProximityConfig, ReoptimizerConfig, SafeArea,
    WindowSize,
};
