// ==========================================
// 配送路线引擎 - 手动排序引擎
// ==========================================
// 职责: 将拖拽手势 / 显式移动转换为新的序列顺序
// 红线:
// - 未优化的序列拒绝手动排序（零变更）
// - 拖拽释放时下标补偿必须精确（raw > original ⇒ raw - 1）
// - 每次完成的拖拽最多触发一次下游（持久化 + 重算）
// ==========================================

use crate::domain::{SequenceError, WaypointKey, WaypointSequence};
use crate::engine::events::{OptionalEventPublisher, SequenceEvent, SequenceEventKind};

// ==========================================
// 拖拽几何
// ==========================================

/// 当前渲染行的垂直几何（含被拖拽行自身）
#[derive(Debug, Clone, PartialEq)]
pub struct RowGeometry {
    pub key: WaypointKey,
    pub top: f64,
    pub height: f64,
}

impl RowGeometry {
    pub fn midpoint(&self) -> f64 {
        self.top + self.height / 2.0
    }
}

/// 由指针位置解析原始落点下标
///
/// 选择垂直中点位于指针下方且最近的行，落点为该行下标；
/// 没有这样的行时落到末尾（rows.len()）。
pub fn resolve_drop_index(rows: &[RowGeometry], pointer_y: f64) -> usize {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| row.midpoint() > pointer_y)
        .min_by(|(_, a), (_, b)| a.midpoint().total_cmp(&b.midpoint()))
        .map(|(i, _)| i)
        .unwrap_or(rows.len())
}

/// 下标补偿: 被拖拽项先从原位置移除，落点在其之后时需减一
pub fn compensate_drop_index(original: usize, raw: usize) -> usize {
    if raw > original {
        raw - 1
    } else {
        raw
    }
}

// ==========================================
// 排序结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderOutcome {
    /// 顺序已改变
    Moved { key: WaypointKey, from: usize, to: usize },
    /// 落点与原位置相同，无变更
    Unchanged { key: WaypointKey, index: usize },
}

impl ReorderOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, ReorderOutcome::Moved { .. })
    }
}

// ==========================================
// ReorderEngine
// ==========================================
pub struct ReorderEngine {
    publisher: OptionalEventPublisher,
}

impl ReorderEngine {
    pub fn new(publisher: OptionalEventPublisher) -> Self {
        Self { publisher }
    }

    /// 显式移动站点到最终下标
    ///
    /// # 返回
    /// - `Err(NotOptimized)`: 序列未优化，零变更
    /// - `Ok(Moved)`: 已移动并发布一次 Reordered 事件
    /// - `Ok(Unchanged)`: 位置未变，不发布事件
    pub fn reorder(
        &self,
        sequence: &mut WaypointSequence,
        key: &WaypointKey,
        target_index: usize,
    ) -> Result<ReorderOutcome, SequenceError> {
        if !sequence.is_optimized() {
            tracing::info!("拒绝手动排序: 序列尚未优化, key={}", key);
            return Err(SequenceError::NotOptimized);
        }
        let from = sequence
            .position(key)
            .ok_or_else(|| SequenceError::WaypointNotFound(key.clone()))?;
        let to = sequence.move_to(key, target_index)?;

        if from == to {
            return Ok(ReorderOutcome::Unchanged {
                key: key.clone(),
                index: from,
            });
        }

        tracing::info!("站点已移动: key={}, from={}, to={}", key, from, to);
        self.publisher.publish(SequenceEvent::user(
            SequenceEventKind::Reordered,
            sequence.is_optimized(),
            sequence.revision(),
        ));
        Ok(ReorderOutcome::Moved {
            key: key.clone(),
            from,
            to,
        })
    }

    /// 开始拖拽（未优化时直接拒绝，不进入拖拽状态）
    pub fn begin_drag(&self, sequence: &WaypointSequence, key: &WaypointKey) -> Result<DragSession, SequenceError> {
        if !sequence.is_optimized() {
            return Err(SequenceError::NotOptimized);
        }
        let original_index = sequence
            .position(key)
            .ok_or_else(|| SequenceError::WaypointNotFound(key.clone()))?;
        tracing::debug!("开始拖拽: key={}, index={}", key, original_index);
        Ok(DragSession {
            key: key.clone(),
            original_index,
            raw_drop_index: original_index,
        })
    }

    /// 释放拖拽: 解析补偿后的落点并执行一次移动
    pub fn release_drag(
        &self,
        sequence: &mut WaypointSequence,
        session: DragSession,
    ) -> Result<ReorderOutcome, SequenceError> {
        let target = session.target_index();
        tracing::debug!(
            "释放拖拽: key={}, original={}, raw={}, target={}",
            session.key,
            session.original_index,
            session.raw_drop_index,
            target
        );
        self.reorder(sequence, &session.key, target)
    }
}

// ==========================================
// DragSession - 单次拖拽手势
// ==========================================
/// 指针事件驱动、同步处理；释放前不产生任何变更
#[derive(Debug, Clone, PartialEq)]
pub struct DragSession {
    key: WaypointKey,
    original_index: usize,
    raw_drop_index: usize,
}

impl DragSession {
    pub fn key(&self) -> &WaypointKey {
        &self.key
    }

    pub fn original_index(&self) -> usize {
        self.original_index
    }

    /// 指针移动时更新原始落点
    pub fn update(&mut self, rows: &[RowGeometry], pointer_y: f64) -> usize {
        self.raw_drop_index = resolve_drop_index(rows, pointer_y);
        self.raw_drop_index
    }

    /// 补偿后的最终下标
    pub fn target_index(&self) -> usize {
        compensate_drop_index(self.original_index, self.raw_drop_index)
    }
}
