// ==========================================
// 配送路线引擎 - 站点序列
// ==========================================
// 职责: 有序、去重的站点集合；顺序与站点属性的唯一事实来源
// 红线:
// - key 在序列内唯一
// - order_index 始终为 0..n-1 的稠密排列
// - cursor ∈ [0, n]
// - 存在待处理站点时，游标推进总能到达其中任意一个（顺序变化后不遗漏）
// ==========================================

use crate::domain::types::WaypointStatus;
use crate::domain::waypoint::{Waypoint, WaypointKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// 序列层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("站点重复: key={0}")]
    DuplicateWaypoint(WaypointKey),

    #[error("站点不存在: key={0}")]
    WaypointNotFound(WaypointKey),

    #[error("请先优化路线: 未优化的序列不允许手动调整顺序")]
    NotOptimized,

    #[error("照片数量超限: key={key}, max={max}")]
    PhotoLimitExceeded { key: WaypointKey, max: usize },

    #[error("顺序不匹配: {0}")]
    OrderMismatch(String),
}

/// 序列统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub total: usize,
    pub pending: usize,
    pub delivered: usize,
    pub skipped: usize,
}

impl SequenceSummary {
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.pending == 0
    }
}

// ==========================================
// WaypointSequence - 站点序列
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointSequence {
    waypoints: Vec<Waypoint>,
    optimized: bool,
    cursor: usize,
    /// 每次变更递增（用于日志与陈旧检测）
    #[serde(default)]
    revision: u64,
}

impl WaypointSequence {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== 查询 =====

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn position(&self, key: &WaypointKey) -> Option<usize> {
        self.waypoints.iter().position(|w| &w.key == key)
    }

    pub fn get(&self, key: &WaypointKey) -> Option<&Waypoint> {
        self.waypoints.iter().find(|w| &w.key == key)
    }

    pub fn keys(&self) -> Vec<WaypointKey> {
        self.waypoints.iter().map(|w| w.key.clone()).collect()
    }

    /// 当前目标站点（cursor == n 时为 None）
    pub fn current_target(&self) -> Option<&Waypoint> {
        self.waypoints.get(self.cursor)
    }

    /// 除当前目标外是否还有待处理站点
    pub fn has_other_pending(&self) -> bool {
        self.waypoints
            .iter()
            .enumerate()
            .any(|(i, w)| i != self.cursor && w.is_pending())
    }

    /// 第一个待处理站点的下标（没有则为 n）
    pub fn first_pending(&self) -> usize {
        self.waypoints
            .iter()
            .position(Waypoint::is_pending)
            .unwrap_or(self.waypoints.len())
    }

    pub fn summary(&self) -> SequenceSummary {
        let mut summary = SequenceSummary {
            total: self.waypoints.len(),
            ..Default::default()
        };
        for w in &self.waypoints {
            match w.status {
                WaypointStatus::None => summary.pending += 1,
                WaypointStatus::Delivered => summary.delivered += 1,
                WaypointStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    // ===== 变更 =====

    /// 追加站点到末尾，返回其下标
    pub fn add(&mut self, mut waypoint: Waypoint) -> Result<usize, SequenceError> {
        if self.position(&waypoint.key).is_some() {
            return Err(SequenceError::DuplicateWaypoint(waypoint.key));
        }
        waypoint.order_index = self.waypoints.len();
        self.waypoints.push(waypoint);
        self.touch();
        Ok(self.waypoints.len() - 1)
    }

    /// 删除站点；删除位置在 cursor 之前时 cursor 前移
    pub fn remove(&mut self, key: &WaypointKey) -> Result<Waypoint, SequenceError> {
        let index = self
            .position(key)
            .ok_or_else(|| SequenceError::WaypointNotFound(key.clone()))?;
        let removed = self.waypoints.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        self.cursor = self.cursor.min(self.waypoints.len());
        self.reindex();
        self.touch();
        Ok(removed)
    }

    /// 将站点移动到最终下标 target（超出范围时落到末尾）
    ///
    /// 不检查 optimized 前置条件，前置条件由 ReorderEngine 负责。
    /// 当前目标站点保持不变（cursor 跟随其新位置）。
    pub fn move_to(&mut self, key: &WaypointKey, target: usize) -> Result<usize, SequenceError> {
        let from = self
            .position(key)
            .ok_or_else(|| SequenceError::WaypointNotFound(key.clone()))?;
        let target = target.min(self.waypoints.len().saturating_sub(1));
        if from == target {
            return Ok(target);
        }

        let current_key = self.current_target().map(|w| w.key.clone());
        let item = self.waypoints.remove(from);
        self.waypoints.insert(target, item);
        self.restore_cursor(current_key);
        self.reindex();
        self.touch();
        Ok(target)
    }

    /// 按给定 key 顺序整体重排（必须是当前站点集合的一个排列）
    ///
    /// 整体重排即新路线: 游标回到新顺序中的第一个待处理站点。
    pub fn apply_order(&mut self, order: &[WaypointKey]) -> Result<(), SequenceError> {
        if order.len() != self.waypoints.len() {
            return Err(SequenceError::OrderMismatch(format!(
                "期望 {} 个站点，实际 {} 个",
                self.waypoints.len(),
                order.len()
            )));
        }
        let unique: HashSet<&WaypointKey> = order.iter().collect();
        if unique.len() != order.len() {
            return Err(SequenceError::OrderMismatch("顺序中存在重复站点".to_string()));
        }

        let mut remaining = std::mem::take(&mut self.waypoints);
        let mut reordered = Vec::with_capacity(remaining.len());
        for key in order {
            match remaining.iter().position(|w| &w.key == key) {
                Some(i) => reordered.push(remaining.swap_remove(i)),
                None => {
                    // 还原后报错，保证零变更
                    remaining.extend(reordered);
                    self.waypoints = remaining;
                    self.reindex_by_order_index();
                    return Err(SequenceError::WaypointNotFound(key.clone()));
                }
            }
        }
        self.waypoints = reordered;
        self.reindex();
        self.cursor = self.first_pending();
        self.touch();
        Ok(())
    }

    /// 更新站点状态
    pub fn set_status(&mut self, key: &WaypointKey, status: WaypointStatus) -> Result<(), SequenceError> {
        let waypoint = self
            .waypoints
            .iter_mut()
            .find(|w| &w.key == key)
            .ok_or_else(|| SequenceError::WaypointNotFound(key.clone()))?;
        waypoint.status = status;
        self.touch();
        Ok(())
    }

    /// 游标移动到下一个待处理站点
    ///
    /// 先向后查找，到末尾后从头回绕（当前站点最后检查）；全部处理完移到 n。
    pub fn advance_cursor(&mut self) -> Option<&Waypoint> {
        let n = self.waypoints.len();
        let start = (self.cursor + 1).min(n);
        self.cursor = (start..n)
            .chain(0..start)
            .find(|&i| self.waypoints[i].is_pending())
            .unwrap_or(n);
        self.touch();
        self.current_target()
    }

    /// 设置游标（越界时钳制到 n）
    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor.min(self.waypoints.len());
        self.touch();
    }

    pub fn mark_optimized(&mut self, optimized: bool) {
        self.optimized = optimized;
        self.touch();
    }

    /// 清空序列（显式重置）
    pub fn clear(&mut self) {
        self.waypoints.clear();
        self.optimized = false;
        self.cursor = 0;
        self.touch();
    }

    /// 可变访问单个站点的非排序属性
    pub fn update<F>(&mut self, key: &WaypointKey, f: F) -> Result<(), SequenceError>
    where
        F: FnOnce(&mut Waypoint),
    {
        let waypoint = self
            .waypoints
            .iter_mut()
            .find(|w| &w.key == key)
            .ok_or_else(|| SequenceError::WaypointNotFound(key.clone()))?;
        let original_key = waypoint.key.clone();
        f(waypoint);
        // key 与顺序不允许通过此入口修改
        waypoint.key = original_key;
        self.reindex();
        self.touch();
        Ok(())
    }

    /// 校验不变量（测试与加载后使用）
    pub fn check_invariants(&self) -> Result<(), SequenceError> {
        let unique: HashSet<&WaypointKey> = self.waypoints.iter().map(|w| &w.key).collect();
        if unique.len() != self.waypoints.len() {
            return Err(SequenceError::OrderMismatch("存在重复 key".to_string()));
        }
        for (i, w) in self.waypoints.iter().enumerate() {
            if w.order_index != i {
                return Err(SequenceError::OrderMismatch(format!(
                    "order_index 不连续: key={}, index={}, expected={}",
                    w.key, w.order_index, i
                )));
            }
        }
        if self.cursor > self.waypoints.len() {
            return Err(SequenceError::OrderMismatch(format!(
                "cursor 越界: {} > {}",
                self.cursor,
                self.waypoints.len()
            )));
        }
        Ok(())
    }

    /// 加载后修复（去重、重建下标、钳制游标）
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.waypoints.retain(|w| seen.insert(w.key.clone()));
        self.reindex_by_order_index();
        self.cursor = self.cursor.min(self.waypoints.len());
    }

    // ===== 内部 =====

    fn reindex(&mut self) {
        for (i, w) in self.waypoints.iter_mut().enumerate() {
            w.order_index = i;
        }
    }

    fn reindex_by_order_index(&mut self) {
        self.waypoints.sort_by_key(|w| w.order_index);
        self.reindex();
    }

    fn restore_cursor(&mut self, current_key: Option<WaypointKey>) {
        if let Some(key) = current_key {
            if let Some(index) = self.position(&key) {
                self.cursor = index;
            }
        }
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}
