// ==========================================
// 配送路线引擎 - 共享路线状态
// ==========================================
// 职责: 序列 + 最近一次矩阵绑定 + 代次，供排序入口与后台重优化共享
// 红线: 读者只能看到完整应用后的状态（写锁内一次性替换）
// ==========================================

use crate::domain::{Coordinates, MatrixIndex, TravelTimeMatrix, WaypointSequence};
use crate::engine::services::SolveRequest;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("路线状态锁获取失败: {0}")]
pub struct StateLockError(pub String);

/// 最近一次估算/优化所用的矩阵及其下标映射
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixBinding {
    pub matrix: TravelTimeMatrix,
    pub index: MatrixIndex,
}

#[derive(Debug, Clone, Default)]
pub struct RouteState {
    pub sequence: WaypointSequence,
    pub matrix: Option<MatrixBinding>,
    /// "当前位置" 锚点（请求矩阵时放在首位）
    pub origin: Option<Coordinates>,
    /// 每次显式重置递增；旧代次的异步结果一律丢弃
    pub generation: u64,
    /// 每次显式优化递增；此前发起的静默重优化结果丢弃
    pub plan_epoch: u64,
}

impl RouteState {
    pub fn new(sequence: WaypointSequence) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    /// 显式重置: 清空序列与矩阵，代次 +1
    pub fn reset(&mut self) {
        self.sequence.clear();
        self.matrix = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// 显式优化结果已应用
    pub fn bump_plan_epoch(&mut self) {
        self.plan_epoch = self.plan_epoch.wrapping_add(1);
    }

    /// 构造矩阵请求: [锚点?] + 全部站点（当前顺序）
    pub fn build_request(&self) -> (Vec<Coordinates>, SolveRequest) {
        let keys = self.sequence.keys();
        let index = MatrixIndex::for_request(self.origin.is_some(), &keys);
        let mut locations = Vec::with_capacity(keys.len() + 1);
        locations.extend(self.origin);
        locations.extend(self.sequence.waypoints().iter().map(|w| w.coordinates));
        (locations, SolveRequest { keys, index })
    }
}

/// 共享句柄
#[derive(Debug, Clone, Default)]
pub struct SharedRouteState {
    inner: Arc<RwLock<RouteState>>,
}

impl SharedRouteState {
    pub fn new(state: RouteState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, RouteState>, StateLockError> {
        self.inner.read().map_err(|e| StateLockError(e.to_string()))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, RouteState>, StateLockError> {
        self.inner.write().map_err(|e| StateLockError(e.to_string()))
    }
}
