// ==========================================
// 配送路线引擎 - 导航进度
// ==========================================
// 职责: 可序列化的导航进度快照（游标、当前目标、已处理站点）
// ==========================================

use crate::domain::sequence::WaypointSequence;
use crate::domain::types::WaypointStatus;
use crate::domain::waypoint::WaypointKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationProgress {
    pub cursor: usize,
    pub current_target: Option<WaypointKey>,
    pub delivered: Vec<WaypointKey>,
    pub skipped: Vec<WaypointKey>,
    pub updated_at: DateTime<Utc>,
}

impl NavigationProgress {
    /// 从序列当前状态生成快照
    pub fn capture(sequence: &WaypointSequence, now: DateTime<Utc>) -> Self {
        let mut delivered = Vec::new();
        let mut skipped = Vec::new();
        for w in sequence.waypoints() {
            match w.status {
                WaypointStatus::Delivered => delivered.push(w.key.clone()),
                WaypointStatus::Skipped => skipped.push(w.key.clone()),
                WaypointStatus::None => {}
            }
        }
        Self {
            cursor: sequence.cursor(),
            current_target: sequence.current_target().map(|w| w.key.clone()),
            delivered,
            skipped,
            updated_at: now,
        }
    }

    /// 将进度恢复到序列上
    ///
    /// 优先按 current_target 的 key 定位游标（站点顺序可能已被重排），
    /// 找不到时退回到保存时的下标；不存在的 key 忽略。
    pub fn restore_into(&self, sequence: &mut WaypointSequence) {
        for key in &self.delivered {
            let _ = sequence.set_status(key, WaypointStatus::Delivered);
        }
        for key in &self.skipped {
            let _ = sequence.set_status(key, WaypointStatus::Skipped);
        }
        let cursor = self
            .current_target
            .as_ref()
            .and_then(|key| sequence.position(key))
            .unwrap_or(self.cursor);
        sequence.set_cursor(cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::Coordinates;
    use crate::domain::waypoint::Waypoint;

    #[test]
    fn test_capture_and_restore_follow_target_key() {
        let mut seq = WaypointSequence::new();
        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            seq.add(Waypoint::new(*name, Coordinates::new(i as f64, 0.0))).unwrap();
        }
        let keys = seq.keys();
        seq.set_status(&keys[0], WaypointStatus::Delivered).unwrap();
        seq.set_cursor(2);

        let progress = NavigationProgress::capture(&seq, Utc::now());
        assert_eq!(progress.current_target.as_ref(), Some(&keys[2]));

        // 重新加载时顺序变了: C, B, A
        let mut reloaded = WaypointSequence::new();
        for (i, name) in ["C", "B", "A"].iter().enumerate() {
            let coords = Coordinates::new((2 - i) as f64, 0.0);
            reloaded.add(Waypoint::new(*name, coords)).unwrap();
        }
        progress.restore_into(&mut reloaded);
        assert_eq!(reloaded.cursor(), 0);
        assert_eq!(reloaded.get(&keys[0]).unwrap().status, WaypointStatus::Delivered);
    }
}
