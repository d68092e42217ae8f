// ==========================================
// 配送路线引擎 - 引擎配置
// ==========================================
// 职责: 各组件的类型化配置及默认值
// ==========================================

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ==========================================
// ArrivalConfig - 到达时间估算配置
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalConfig {
    pub service_minutes: u32,      // 全局单站服务时长: 5 分钟
    pub min_service_minutes: u32,  // 服务时长下限: 3 分钟
    pub jitter_range_seconds: u32, // 抖动范围: [0, 180) 秒
}

impl Default for ArrivalConfig {
    fn default() -> Self {
        Self {
            service_minutes: 5,
            min_service_minutes: 3,
            jitter_range_seconds: 180,
        }
    }
}

// ==========================================
// ReoptimizerConfig - 静默重优化配置
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReoptimizerConfig {
    pub debounce_ms: u64, // 防抖窗口: 200ms
}

impl ReoptimizerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ReoptimizerConfig {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

// ==========================================
// 屏幕安全区与窗口尺寸
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeArea {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Default for SafeArea {
    fn default() -> Self {
        Self {
            left: 0.0,
            top: 24.0,
            right: 1080.0,
            bottom: 2340.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: f64,
    pub height: f64,
}

// ==========================================
// OverlayConfig - 悬浮窗配置
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub proximity_threshold_m: f64,   // 接近阈值: 200m
    pub inactivity_secs: u64,         // 无操作自动收起: 20s
    pub completion_timeout_secs: u64, // 完成页自动关闭: 10s
    pub safe_area: SafeArea,
    pub minimized_size: WindowSize,
    pub full_size: WindowSize,
}

impl OverlayConfig {
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            proximity_threshold_m: 200.0,
            inactivity_secs: 20,
            completion_timeout_secs: 10,
            safe_area: SafeArea::default(),
            minimized_size: WindowSize {
                width: 220.0,
                height: 96.0,
            },
            full_size: WindowSize {
                width: 960.0,
                height: 640.0,
            },
        }
    }
}

// ==========================================
// ProximityConfig - 定位过滤配置
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityConfig {
    pub max_accuracy_m: f64,      // 精度门限: 50m
    pub min_interval_secs: u64,   // 最小转发间隔: 5s
    pub min_displacement_m: f64,  // 最小转发位移: 10m
    pub segment_gap_secs: u64,    // 轨迹分段间隔: 60s
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 50.0,
            min_interval_secs: 5,
            min_displacement_m: 10.0,
            segment_gap_secs: 60,
        }
    }
}

// ==========================================
// EngineConfig - 汇总配置
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub arrival: ArrivalConfig,
    pub reoptimizer: ReoptimizerConfig,
    pub overlay: OverlayConfig,
    pub proximity: ProximityConfig,
    /// 直线矩阵回退的假定车速 (km/h)
    pub fallback_speed_kmh: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arrival: ArrivalConfig::default(),
            reoptimizer: ReoptimizerConfig::default(),
            overlay: OverlayConfig::default(),
            proximity: ProximityConfig::default(),
            fallback_speed_kmh: 30.0,
        }
    }
}
