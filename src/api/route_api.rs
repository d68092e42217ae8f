// ==========================================
// 配送路线引擎 - 路线 API
// ==========================================
// 职责: 排序界面入口（增删站点、手动排序、状态更新、优化、估算、重置）
// 说明:
// - 所有变更在共享状态写锁内完成，随后持久化并发布一次序列事件
// - 实现 HostActionBridge，承接悬浮窗回传的 跳过/完成 动作
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::ArrivalConfig;
use crate::domain::{
    Coordinates, MatrixIndex, NavigationProgress, SequenceSummary, Waypoint, WaypointKey, WaypointSequence,
    WaypointStatus,
};
use crate::engine::arrival::{estimate_arrivals, ArrivalEstimate, StartTime};
use crate::engine::events::{MutationOrigin, OptionalEventPublisher, SequenceEvent, SequenceEventKind};
use crate::engine::reoptimizer::merge_order;
use crate::engine::reorder::{DragSession, ReorderEngine, ReorderOutcome};
use crate::engine::route_state::{MatrixBinding, RouteState, SharedRouteState};
use crate::engine::services::{RouteSolver, TravelTimeMatrixService};
use crate::engine::sync::{attach_host, CrossSurfaceSync, HostActionBridge, SequencingToOverlay, Subscription, TargetPayload};
use crate::repository::RouteStore;
use chrono::Utc;
use std::error::Error;
use std::sync::Arc;

pub struct RouteApi {
    state: SharedRouteState,
    store: Arc<dyn RouteStore>,
    reorder_engine: ReorderEngine,
    publisher: OptionalEventPublisher,
    matrix_service: Arc<dyn TravelTimeMatrixService>,
    solver: Arc<dyn RouteSolver>,
    sync: Arc<CrossSurfaceSync>,
    arrival_config: ArrivalConfig,
}

impl RouteApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedRouteState,
        store: Arc<dyn RouteStore>,
        publisher: OptionalEventPublisher,
        matrix_service: Arc<dyn TravelTimeMatrixService>,
        solver: Arc<dyn RouteSolver>,
        sync: Arc<CrossSurfaceSync>,
        arrival_config: ArrivalConfig,
    ) -> Self {
        Self {
            state,
            store,
            reorder_engine: ReorderEngine::new(publisher.clone()),
            publisher,
            matrix_service,
            solver,
            sync,
            arrival_config,
        }
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn sequence(&self) -> ApiResult<WaypointSequence> {
        Ok(self.state.read()?.sequence.clone())
    }

    pub fn summary(&self) -> ApiResult<SequenceSummary> {
        Ok(self.state.read()?.sequence.summary())
    }

    pub fn current_target(&self) -> ApiResult<Option<TargetPayload>> {
        Ok(target_payload(&self.state.read()?.sequence))
    }

    /// 按当前顺序与最近一次矩阵估算到达时间
    pub fn estimate_arrivals(&self, start: StartTime) -> ApiResult<Vec<ArrivalEstimate>> {
        let start = start.resolve();
        let state = self.state.read()?;
        let waypoints = state.sequence.waypoints();
        let estimates = match &state.matrix {
            Some(binding) => estimate_arrivals(
                &binding.index.route_nodes(waypoints),
                Some(&binding.matrix),
                start,
                &self.arrival_config,
            ),
            None => estimate_arrivals(
                &MatrixIndex::default().route_nodes(waypoints),
                None,
                start,
                &self.arrival_config,
            ),
        };
        Ok(estimates)
    }

    // ==========================================
    // 加载 / 重置
    // ==========================================

    /// 从持久化存储恢复序列与导航进度
    pub fn load(&self) -> ApiResult<SequenceSummary> {
        let mut sequence = self.store.load_sequence()?.unwrap_or_default();
        if let Some(progress) = self.store.load_progress()? {
            progress.restore_into(&mut sequence);
        }
        let summary = sequence.summary();
        let message = SequencingToOverlay::for_sequence(&sequence);
        {
            let mut state = self.state.write()?;
            let generation = state.generation;
            let origin = state.origin;
            *state = RouteState::new(sequence);
            state.origin = origin;
            state.generation = generation.wrapping_add(1);
        }
        tracing::info!(
            "路线已加载: total={}, pending={}, delivered={}, skipped={}",
            summary.total,
            summary.pending,
            summary.delivered,
            summary.skipped
        );
        self.announce(message);
        Ok(summary)
    }

    /// 显式重置: 清空序列、进度，取消所有后台请求
    pub fn reset(&self) -> ApiResult<()> {
        let revision = {
            let mut state = self.state.write()?;
            state.reset();
            state.sequence.revision()
        };
        self.store.clear_route()?;
        self.publisher
            .publish(SequenceEvent::user(SequenceEventKind::Cleared, false, revision));
        tracing::info!("路线已重置");
        Ok(())
    }

    /// 设置"当前位置"锚点
    pub fn set_origin(&self, origin: Option<Coordinates>) -> ApiResult<()> {
        if let Some(c) = origin {
            if !c.is_valid() {
                return Err(ApiError::InvalidInput(format!("坐标非法: lat={}, lng={}", c.lat, c.lng)));
            }
        }
        self.state.write()?.origin = origin;
        Ok(())
    }

    // ==========================================
    // 变更
    // ==========================================

    pub fn add_waypoint(&self, waypoint: Waypoint) -> ApiResult<WaypointKey> {
        if !waypoint.coordinates.is_valid() {
            return Err(ApiError::InvalidInput(format!(
                "站点坐标非法: address={}",
                waypoint.address
            )));
        }
        let key = waypoint.key.clone();
        let (event, before, after) = {
            let mut state = self.state.write()?;
            let before = SequencingToOverlay::for_sequence(&state.sequence);
            state.sequence.add(waypoint)?;
            self.store.save_sequence(&state.sequence)?;
            (
                SequenceEvent::user(SequenceEventKind::Added, state.sequence.is_optimized(), state.sequence.revision()),
                before,
                SequencingToOverlay::for_sequence(&state.sequence),
            )
        };
        tracing::info!("站点已添加: key={}", key);
        self.publisher.publish(event);
        self.announce_if_changed(before, after);
        Ok(key)
    }

    pub fn remove_waypoint(&self, key: &WaypointKey) -> ApiResult<Waypoint> {
        let (removed, event, before, after) = {
            let mut state = self.state.write()?;
            let before = SequencingToOverlay::for_sequence(&state.sequence);
            let removed = state.sequence.remove(key)?;
            self.store.save_sequence(&state.sequence)?;
            (
                removed,
                SequenceEvent::user(SequenceEventKind::Removed, state.sequence.is_optimized(), state.sequence.revision()),
                before,
                SequencingToOverlay::for_sequence(&state.sequence),
            )
        };
        tracing::info!("站点已删除: key={}", key);
        self.publisher.publish(event);
        self.announce_if_changed(before, after);
        Ok(removed)
    }

    /// 显式移动站点（未优化时拒绝: ApiError::OptimizeFirst）
    pub fn reorder(&self, key: &WaypointKey, target_index: usize) -> ApiResult<ReorderOutcome> {
        let mut state = self.state.write()?;
        let outcome = self.reorder_engine.reorder(&mut state.sequence, key, target_index)?;
        if outcome.is_moved() {
            self.store.save_sequence(&state.sequence)?;
        }
        Ok(outcome)
    }

    pub fn begin_drag(&self, key: &WaypointKey) -> ApiResult<DragSession> {
        let state = self.state.read()?;
        Ok(self.reorder_engine.begin_drag(&state.sequence, key)?)
    }

    /// 拖拽释放: 完成一次拖拽最多持久化、发布一次
    pub fn release_drag(&self, session: DragSession) -> ApiResult<ReorderOutcome> {
        let mut state = self.state.write()?;
        let outcome = self.reorder_engine.release_drag(&mut state.sequence, session)?;
        if outcome.is_moved() {
            self.store.save_sequence(&state.sequence)?;
        }
        Ok(outcome)
    }

    pub fn set_status(&self, key: &WaypointKey, status: WaypointStatus) -> ApiResult<()> {
        let (event, before, after) = {
            let mut state = self.state.write()?;
            let before = SequencingToOverlay::for_sequence(&state.sequence);
            state.sequence.set_status(key, status)?;
            self.store.save_sequence(&state.sequence)?;
            self.store
                .save_progress(&NavigationProgress::capture(&state.sequence, Utc::now()))?;
            (
                SequenceEvent::user(
                    SequenceEventKind::StatusChanged,
                    state.sequence.is_optimized(),
                    state.sequence.revision(),
                ),
                before,
                SequencingToOverlay::for_sequence(&state.sequence),
            )
        };
        tracing::info!("站点状态已更新: key={}, status={}", key, status);
        self.publisher.publish(event);
        self.announce_if_changed(before, after);
        Ok(())
    }

    /// 添加照片引用（每站最多 2 张）
    pub fn add_photo(&self, key: &WaypointKey, photo_ref: &str) -> ApiResult<()> {
        let mut state = self.state.write()?;
        let mut result = Ok(());
        state.sequence.update(key, |w| result = w.add_photo(photo_ref))?;
        result?;
        self.store.save_sequence(&state.sequence)?;
        Ok(())
    }

    /// 游标前进到下一个待处理站点，并通知悬浮窗
    pub fn advance_to_next(&self) -> ApiResult<Option<WaypointKey>> {
        let next = {
            let mut state = self.state.write()?;
            let next = state.sequence.advance_cursor().map(|w| w.key.clone());
            self.store
                .save_progress(&NavigationProgress::capture(&state.sequence, Utc::now()))?;
            next
        };
        match &next {
            Some(key) => tracing::info!("导航至下一站: key={}", key),
            None => tracing::info!("没有待处理的站点"),
        }
        self.announce_current()?;
        Ok(next)
    }

    // ==========================================
    // 优化
    // ==========================================

    /// 显式优化: 请求矩阵 → 求解 → 一次性应用，并置 optimized = true
    ///
    /// 该变更来源为 ExplicitOptimize，不会再触发静默重优化；
    /// plan_epoch 递增，此前发起的静默重优化结果作废。
    /// 应用后游标回到新顺序中的第一个待处理站点。
    pub async fn optimize(&self) -> ApiResult<()> {
        let (generation, locations, request) = {
            let state = self.state.read()?;
            if state.sequence.is_empty() {
                return Err(ApiError::BusinessRuleViolation("没有可优化的站点".to_string()));
            }
            let (locations, request) = state.build_request();
            (state.generation, locations, request)
        };

        tracing::info!("开始优化路线: stops={}", request.keys.len());
        let matrix = self.matrix_service.fetch_matrix(&locations).await?;
        let solved = self.solver.solve(&request, &matrix).await?;

        let (event, before, after) = {
            let mut state = self.state.write()?;
            if state.generation != generation {
                return Err(ApiError::BusinessRuleViolation("路线已被重置，优化结果已丢弃".to_string()));
            }
            let before = SequencingToOverlay::for_sequence(&state.sequence);
            let merged = merge_order(&solved, &state.sequence.keys());
            state.sequence.apply_order(&merged)?;
            state.sequence.mark_optimized(true);
            state.bump_plan_epoch();
            state.matrix = Some(MatrixBinding {
                matrix,
                index: request.index,
            });
            self.store.save_sequence(&state.sequence)?;
            self.store
                .save_progress(&NavigationProgress::capture(&state.sequence, Utc::now()))?;
            (
                SequenceEvent {
                    kind: SequenceEventKind::Optimized,
                    origin: MutationOrigin::ExplicitOptimize,
                    optimized: true,
                    revision: state.sequence.revision(),
                },
                before,
                SequencingToOverlay::for_sequence(&state.sequence),
            )
        };
        tracing::info!("路线优化完成");
        self.publisher.publish(event);
        self.announce_if_changed(before, after);
        Ok(())
    }

    /// 仅刷新矩阵（不改变顺序），用于未优化序列的到达估算
    pub async fn refresh_matrix(&self) -> ApiResult<()> {
        let (generation, locations, request) = {
            let state = self.state.read()?;
            let (locations, request) = state.build_request();
            (state.generation, locations, request)
        };
        let matrix = self.matrix_service.fetch_matrix(&locations).await?;
        let mut state = self.state.write()?;
        if state.generation == generation {
            state.matrix = Some(MatrixBinding {
                matrix,
                index: request.index,
            });
        }
        Ok(())
    }

    // ==========================================
    // 跨界面
    // ==========================================

    /// 排序界面就绪: 挂接悬浮窗回传通道
    pub fn attach_overlay(self: &Arc<Self>) -> Subscription {
        attach_host(&self.sync, self.clone())
    }

    fn announce_current(&self) -> ApiResult<()> {
        let message = SequencingToOverlay::for_sequence(&self.state.read()?.sequence);
        self.announce(message);
        Ok(())
    }

    /// 目标或"是否最后一站"发生变化时才推送
    fn announce_if_changed(&self, before: Option<SequencingToOverlay>, after: Option<SequencingToOverlay>) {
        if before != after {
            self.announce(after);
        }
    }

    fn announce(&self, message: Option<SequencingToOverlay>) {
        if let Some(message) = message {
            self.sync.to_overlay.publish(message);
        }
    }
}

/// 当前目标 → 悬浮窗载荷
fn target_payload(sequence: &WaypointSequence) -> Option<TargetPayload> {
    match SequencingToOverlay::for_sequence(sequence)? {
        SequencingToOverlay::TargetChanged(payload) => Some(payload),
        SequencingToOverlay::AllStopsCompleted => None,
    }
}

impl HostActionBridge for RouteApi {
    fn resolve_address(&self, address: &str) -> Option<WaypointKey> {
        let state = self.state.read().ok()?;
        let sequence = &state.sequence;
        if let Some(target) = sequence.current_target().filter(|w| w.address == address) {
            return Some(target.key.clone());
        }
        sequence
            .waypoints()
            .iter()
            .find(|w| w.address == address && w.is_pending())
            .or_else(|| sequence.waypoints().iter().find(|w| w.address == address))
            .map(|w| w.key.clone())
    }

    fn advance_to_next(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        RouteApi::advance_to_next(self)?;
        Ok(())
    }

    fn mark_delivered(&self, key: &WaypointKey) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(self.set_status(key, WaypointStatus::Delivered)?)
    }

    fn mark_skipped(&self, key: &WaypointKey) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(self.set_status(key, WaypointStatus::Skipped)?)
    }

    fn all_stops_completed(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let summary = self.summary()?;
        tracing::info!(
            "全部站点已处理: delivered={}, skipped={}",
            summary.delivered,
            summary.skipped
        );
        Ok(())
    }
}
