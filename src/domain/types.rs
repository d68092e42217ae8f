// ==========================================
// 配送路线引擎 - 领域类型定义
// ==========================================
// 职责: 站点状态、配送类型、悬浮窗阶段等基础枚举
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 站点状态 (Waypoint Status)
// ==========================================
// 序列化格式: SCREAMING_SNAKE_CASE (与持久化一致)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaypointStatus {
    #[default]
    None,      // 未处理
    Delivered, // 已送达
    Skipped,   // 已跳过
}

impl WaypointStatus {
    /// 是否已处理（送达或跳过）
    pub fn is_resolved(&self) -> bool {
        !matches!(self, WaypointStatus::None)
    }
}

impl fmt::Display for WaypointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaypointStatus::None => write!(f, "NONE"),
            WaypointStatus::Delivered => write!(f, "DELIVERED"),
            WaypointStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

// ==========================================
// 配送类型 (Delivery Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType {
    #[default]
    Delivery, // 派送
    Pickup,   // 取件
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryType::Delivery => write!(f, "DELIVERY"),
            DeliveryType::Pickup => write!(f, "PICKUP"),
        }
    }
}

// ==========================================
// 站点动作 (Stop Action)
// ==========================================
// 悬浮窗上的 跳过/完成 两个按钮
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopAction {
    Skip,
    Done,
}

impl StopAction {
    /// 动作对应的站点终态
    pub fn resulting_status(&self) -> WaypointStatus {
        match self {
            StopAction::Skip => WaypointStatus::Skipped,
            StopAction::Done => WaypointStatus::Delivered,
        }
    }
}

impl fmt::Display for StopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopAction::Skip => write!(f, "skip"),
            StopAction::Done => write!(f, "done"),
        }
    }
}

// ==========================================
// 悬浮窗阶段 (Overlay Phase)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlayPhase {
    Hidden,     // 无窗口
    Minimized,  // 紧凑胶囊，显示距离
    Full,       // 详情卡片，带 跳过/完成
    Completion, // 全部完成（终态）
}

impl OverlayPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayPhase::Hidden => "HIDDEN",
            OverlayPhase::Minimized => "MINIMIZED",
            OverlayPhase::Full => "FULL",
            OverlayPhase::Completion => "COMPLETION",
        }
    }

    /// 是否为可拖拽的可见阶段
    pub fn is_draggable(&self) -> bool {
        matches!(self, OverlayPhase::Minimized | OverlayPhase::Full)
    }
}

impl fmt::Display for OverlayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 悬浮窗位置 (Window Position)
// ==========================================
// 每个可见阶段各自保存一份
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowPosition {
    pub x: f64,
    pub y: f64,
}

impl WindowPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}
