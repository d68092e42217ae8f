// ==========================================
// 配送路线引擎 - 站点领域模型
// ==========================================
// 职责: Waypoint 实体、稳定标识、时间窗、包裹元数据
// 红线: 标识由 地址文本 + 归一化坐标 确定性派生
// ==========================================

use crate::domain::geo::{Coordinates, KEY_COORD_PRECISION};
use crate::domain::hash::stable_hash64;
use crate::domain::sequence::SequenceError;
use crate::domain::types::{DeliveryType, WaypointStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 每个站点最多保存的照片数量
pub const MAX_PHOTOS: usize = 2;

/// 当前包裹元数据结构版本
pub const PACKAGE_METADATA_VERSION: u32 = 2;

// ==========================================
// WaypointKey - 站点稳定标识
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaypointKey(String);

impl WaypointKey {
    /// 由地址与坐标派生标识
    ///
    /// 地址做 trim + 小写 + 空白折叠；坐标按 6 位小数取整。
    /// 相同站点在任何一次渲染/加载中得到相同的 key。
    pub fn derive(address: &str, coordinates: &Coordinates) -> Self {
        let normalized_address = address
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let (lat, lng) = coordinates.normalized(KEY_COORD_PRECISION);
        let canonical = format!("{}|{}|{}", normalized_address, lat, lng);
        WaypointKey(format!("wp-{:016x}", stable_hash64(&canonical)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WaypointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WaypointKey {
    fn from(value: &str) -> Self {
        WaypointKey(value.to_string())
    }
}

// ==========================================
// TimeWindow - 送达时间窗 ("HH:MM")
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub lower: Option<String>, // 最早 "HH:MM"
    pub upper: Option<String>, // 最晚 "HH:MM"
}

impl TimeWindow {
    pub fn new(lower: Option<&str>, upper: Option<&str>) -> Self {
        Self {
            lower: lower.map(str::to_string),
            upper: upper.map(str::to_string),
        }
    }

    /// 两端均未设置
    pub fn is_empty(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

// ==========================================
// 包裹元数据 (版本化)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehiclePosition {
    Front,
    Middle,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleSide {
    Left,
    Right,
}

/// 包裹元数据
///
/// 旧版本记录缺失的字段按默认值补齐（serde default），
/// `schema_version` 记录写入时的结构版本。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMetadata {
    pub schema_version: u32,
    pub size: Option<PackageSize>,
    pub package_type: Option<String>,
    pub vehicle_position: Option<VehiclePosition>,
    pub vehicle_side: Option<VehicleSide>,
    pub floor: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub photo_refs: Vec<String>,
    pub favorite_name: Option<String>,
}

impl Default for PackageMetadata {
    fn default() -> Self {
        Self {
            schema_version: PACKAGE_METADATA_VERSION,
            size: None,
            package_type: None,
            vehicle_position: None,
            vehicle_side: None,
            floor: None,
            phone: None,
            notes: None,
            photo_refs: Vec::new(),
            favorite_name: None,
        }
    }
}

// ==========================================
// Waypoint - 站点
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    // ===== 标识 =====
    pub key: WaypointKey,
    pub address: String,
    pub coordinates: Coordinates,

    // ===== 排序与约束 =====
    pub order_index: usize,
    #[serde(default)]
    pub time_window: TimeWindow,
    #[serde(default)]
    pub service_minutes_override: Option<u32>,

    // ===== 业务属性 =====
    #[serde(default)]
    pub delivery_type: DeliveryType,
    #[serde(default)]
    pub status: WaypointStatus,
    #[serde(default)]
    pub package: Option<PackageMetadata>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub photos: Vec<String>,
}

impl Waypoint {
    /// 创建站点（order_index 由序列在插入时重算）
    pub fn new(address: impl Into<String>, coordinates: Coordinates) -> Self {
        let address = address.into();
        let key = WaypointKey::derive(&address, &coordinates);
        Self {
            key,
            address,
            coordinates,
            order_index: 0,
            time_window: TimeWindow::default(),
            service_minutes_override: None,
            delivery_type: DeliveryType::default(),
            status: WaypointStatus::default(),
            package: None,
            favorite: false,
            notes: None,
            photos: Vec::new(),
        }
    }

    pub fn with_time_window(mut self, lower: Option<&str>, upper: Option<&str>) -> Self {
        self.time_window = TimeWindow::new(lower, upper);
        self
    }

    pub fn with_service_minutes(mut self, minutes: u32) -> Self {
        self.service_minutes_override = Some(minutes);
        self
    }

    pub fn with_package(mut self, package: PackageMetadata) -> Self {
        self.package = Some(package);
        self
    }

    /// 追加照片引用（最多 2 张）
    pub fn add_photo(&mut self, photo_ref: impl Into<String>) -> Result<(), SequenceError> {
        if self.photos.len() >= MAX_PHOTOS {
            return Err(SequenceError::PhotoLimitExceeded {
                key: self.key.clone(),
                max: MAX_PHOTOS,
            });
        }
        self.photos.push(photo_ref.into());
        Ok(())
    }

    /// 是否待处理
    pub fn is_pending(&self) -> bool {
        !self.status.is_resolved()
    }

    /// 收藏名（来自包裹元数据）
    pub fn favorite_name(&self) -> Option<&str> {
        self.package.as_ref().and_then(|p| p.favorite_name.as_deref())
    }
}
