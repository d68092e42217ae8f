// ==========================================
// 配送路线引擎 - 接近度跟踪
// ==========================================
// 职责: 定位流 → 到当前目标的距离；合格定位点转发给骑行历史
// 转发条件: 精度 <= 50m 且 (首个点 或 距上次转发 >= 5s 或 位移 >= 10m)
// 分段: 距上次转发超过 60s 开启新的轨迹段
// ==========================================

use crate::config::ProximityConfig;
use crate::domain::{haversine_m, Coordinates};
use crate::engine::services::RideHistoryStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 单个定位点（瞬时，不持久化）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub timestamp_ms: i64,
}

impl LocationFix {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }
}

/// 单次定位处理结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityUpdate {
    /// 到当前目标的距离（无目标或无定位时为 None）
    pub distance_m: Option<f64>,
    pub within_threshold: Option<bool>,
    /// 是否已转发给骑行历史
    pub forwarded: bool,
}

pub struct ProximityTracker {
    config: ProximityConfig,
    threshold_m: f64,
    ride_history: Arc<dyn RideHistoryStore>,
    target: Option<Coordinates>,
    last_forwarded: Option<LocationFix>,
    segment: u32,
    total_distance_m: f64,
}

impl ProximityTracker {
    pub fn new(config: ProximityConfig, threshold_m: f64, ride_history: Arc<dyn RideHistoryStore>) -> Self {
        Self {
            config,
            threshold_m,
            ride_history,
            target: None,
            last_forwarded: None,
            segment: 0,
            total_distance_m: 0.0,
        }
    }

    pub fn set_target(&mut self, target: Option<Coordinates>) {
        self.target = target;
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn total_distance_m(&self) -> f64 {
        self.total_distance_m
    }

    pub fn on_fix(&mut self, fix: LocationFix) -> ProximityUpdate {
        let distance_m = self.target.map(|t| haversine_m(&fix.coordinates(), &t));
        let forwarded = self.forward_if_qualifies(&fix);
        ProximityUpdate {
            distance_m,
            within_threshold: distance_m.map(|d| d < self.threshold_m),
            forwarded,
        }
    }

    /// 定位不可用 / 无权限: 距离降级为未知
    pub fn on_location_unavailable(&self) -> ProximityUpdate {
        tracing::debug!("定位不可用，距离显示为 unknown");
        ProximityUpdate {
            distance_m: None,
            within_threshold: None,
            forwarded: false,
        }
    }

    fn forward_if_qualifies(&mut self, fix: &LocationFix) -> bool {
        if fix.accuracy_m > self.config.max_accuracy_m {
            return false;
        }
        if self.ride_history.current_ride_id().is_none() {
            return false;
        }

        let (elapsed_ms, displacement_m) = match &self.last_forwarded {
            Some(last) => (
                fix.timestamp_ms - last.timestamp_ms,
                haversine_m(&last.coordinates(), &fix.coordinates()),
            ),
            None => (0, 0.0),
        };
        let qualifies = self.last_forwarded.is_none()
            || elapsed_ms >= self.config.min_interval_secs as i64 * 1000
            || displacement_m >= self.config.min_displacement_m;
        if !qualifies {
            return false;
        }

        if self.last_forwarded.is_some() {
            if elapsed_ms > self.config.segment_gap_secs as i64 * 1000 {
                self.segment += 1;
                tracing::info!("定位间隔过长，开启新轨迹段: segment={}, gap_ms={}", self.segment, elapsed_ms);
            } else {
                self.total_distance_m += displacement_m;
            }
        }
        self.last_forwarded = Some(*fix);

        if let Err(e) = self
            .ride_history
            .add_track_point(fix.lat, fix.lng, fix.accuracy_m, fix.timestamp_ms, self.segment)
        {
            tracing::warn!("轨迹点写入失败: {}", e);
        }
        if let Err(e) = self.ride_history.update_distance(self.total_distance_m) {
            tracing::warn!("里程更新失败: {}", e);
        }
        if let Err(e) = self.ride_history.check_stop_proximity(fix.lat, fix.lng, fix.timestamp_ms) {
            tracing::warn!("停靠检测失败: {}", e);
        }
        true
    }
}
