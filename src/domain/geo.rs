// ==========================================
// 配送路线引擎 - 地理坐标
// ==========================================
// 职责: 坐标值对象、大圆距离 (haversine)、距离显示格式
// ==========================================

use serde::{Deserialize, Serialize};

/// 地球平均半径（米）
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// 坐标归一化精度（小数位），用于生成站点标识
pub const KEY_COORD_PRECISION: i32 = 6;

// ==========================================
// Coordinates - 经纬度坐标
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// 坐标是否在合法范围内
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// 按固定精度取整后的整数表示（避免浮点抖动影响标识）
    pub fn normalized(&self, precision: i32) -> (i64, i64) {
        let factor = 10f64.powi(precision);
        (
            (self.lat * factor).round() as i64,
            (self.lng * factor).round() as i64,
        )
    }

    /// 到另一点的大圆距离（米）
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        haversine_m(self, other)
    }
}

/// haversine 大圆距离（米）
pub fn haversine_m(a: &Coordinates, b: &Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// 距离显示文本
///
/// - None: "unknown"（无定位/无权限）
/// - < 1000m: "850 m"
/// - 其余: "1.2 km"
pub fn format_distance(meters: Option<f64>) -> String {
    match meters {
        Some(m) if m.is_finite() && m >= 0.0 => {
            let rounded = m.round();
            if rounded < 1000.0 {
                format!("{} m", rounded as i64)
            } else {
                format!("{:.1} km", m / 1000.0)
            }
        }
        _ => "unknown".to_string(),
    }
}
