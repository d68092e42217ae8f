// ==========================================
// 配送路线引擎 - 静默重优化
// ==========================================
// 职责: 已优化序列发生结构性变更后，防抖合并为一次后台重优化请求
// 红线:
// - 防抖窗口内的多次变更合并为一次请求（尾沿重置）
// - 同一序列同时最多一个请求在途；在途期间的变更只记一次，完成后再发一次
// - 成功: 写锁内一次性替换顺序与矩阵；失败: 状态不动，发非致命通知，optimized 保持 true
// - 序列被清空（代次变化）或显式优化过（plan_epoch 变化）后，旧结果一律丢弃
// - 应用后游标回到第一个待处理站点，并向悬浮窗推送新目标
// 架构: 单个 tokio 任务（actor）持有全部调度状态，外部只通过 mpsc 发命令
// ==========================================

use crate::config::ReoptimizerConfig;
use crate::domain::{NavigationProgress, WaypointKey};
use crate::engine::events::{SequenceEvent, SequenceEventKind, SequenceEventPublisher};
use crate::engine::route_state::{MatrixBinding, SharedRouteState};
use crate::engine::services::{NotificationSink, RouteSolver, TravelTimeMatrixService};
use crate::engine::sync::{CrossSurfaceSync, SequencingToOverlay};
use crate::repository::RouteStore;
use chrono::Utc;
use std::collections::HashSet;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ==========================================
// 统计
// ==========================================

#[derive(Debug, Default)]
struct ReoptimizerCounters {
    triggers: AtomicU64,
    requests: AtomicU64,
    applied: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicU64,
}

/// 重优化统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReoptimizerStats {
    /// 收到的触发次数
    pub triggers: u64,
    /// 实际发出的请求数
    pub requests: u64,
    /// 被合并（未单独发请求）的触发次数
    pub coalesced: u64,
    pub applied: u64,
    pub failures: u64,
    /// 因代次变化或序列未优化而丢弃的结果
    pub discarded: u64,
}

// ==========================================
// 单次请求
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestOutcome {
    Applied,
    Discarded,
    Failed,
}

type InFlight = Pin<Box<dyn Future<Output = RequestOutcome> + Send>>;

/// 请求执行上下文（在途 future 持有其 Arc）
struct ReoptimizeContext {
    state: SharedRouteState,
    matrix_service: Arc<dyn TravelTimeMatrixService>,
    solver: Arc<dyn RouteSolver>,
    notifier: Arc<dyn NotificationSink>,
    store: Option<Arc<dyn RouteStore>>,
    sync: Option<Arc<CrossSurfaceSync>>,
}

impl ReoptimizeContext {
    async fn run_once(self: Arc<Self>) -> RequestOutcome {
        let snapshot = match self.state.read() {
            Ok(state) if state.sequence.is_optimized() && !state.sequence.is_empty() => {
                let (locations, request) = state.build_request();
                Some((state.generation, state.plan_epoch, locations, request))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::error!("重优化读取状态失败: {}", e);
                return RequestOutcome::Failed;
            }
        };
        let Some((generation, plan_epoch, locations, request)) = snapshot else {
            tracing::debug!("序列未优化或为空，跳过重优化");
            return RequestOutcome::Discarded;
        };

        tracing::debug!("发出重优化请求: generation={}, stops={}", generation, request.keys.len());

        let matrix = match self.matrix_service.fetch_matrix(&locations).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("重优化矩阵请求失败，保留原顺序: {}", e);
                self.notifier.notify(&format!("路线重新优化失败: {}", e));
                return RequestOutcome::Failed;
            }
        };
        let solved = match self.solver.solve(&request, &matrix).await {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("重优化求解失败，保留原顺序: {}", e);
                self.notifier.notify(&format!("路线重新优化失败: {}", e));
                return RequestOutcome::Failed;
            }
        };

        // 写锁内一次性应用
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("重优化写入状态失败: {}", e);
                return RequestOutcome::Failed;
            }
        };
        if state.generation != generation
            || state.plan_epoch != plan_epoch
            || !state.sequence.is_optimized()
        {
            tracing::info!(
                "丢弃过期的重优化结果: request_generation={}, current_generation={}, request_epoch={}, current_epoch={}",
                generation,
                state.generation,
                plan_epoch,
                state.plan_epoch
            );
            return RequestOutcome::Discarded;
        }

        let merged = merge_order(&solved, &state.sequence.keys());
        if let Err(e) = state.sequence.apply_order(&merged) {
            tracing::warn!("重优化结果无法应用: {}", e);
            self.notifier.notify(&format!("路线重新优化失败: {}", e));
            return RequestOutcome::Failed;
        }
        state.matrix = Some(MatrixBinding {
            matrix,
            index: request.index,
        });
        tracing::info!(
            "重优化已应用: stops={}, revision={}",
            state.sequence.len(),
            state.sequence.revision()
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.save_sequence(&state.sequence) {
                tracing::warn!("重优化结果持久化失败: {}", e);
            }
            if let Err(e) = store.save_progress(&NavigationProgress::capture(&state.sequence, Utc::now())) {
                tracing::warn!("重优化后导航进度持久化失败: {}", e);
            }
        }
        let message = SequencingToOverlay::for_sequence(&state.sequence);
        drop(state);

        if let (Some(sync), Some(message)) = (&self.sync, message) {
            sync.to_overlay.publish(message);
        }
        RequestOutcome::Applied
    }
}

/// 按标识合并求解结果与当前序列
///
/// 仍存在的站点按求解顺序排列；在途期间新增的站点保持相对顺序追加到末尾；
/// 已删除的站点忽略。
pub fn merge_order(solved: &[WaypointKey], current: &[WaypointKey]) -> Vec<WaypointKey> {
    let present: HashSet<&WaypointKey> = current.iter().collect();
    let mut placed: HashSet<&WaypointKey> = HashSet::with_capacity(current.len());
    let mut merged = Vec::with_capacity(current.len());

    for key in solved {
        if present.contains(key) && placed.insert(key) {
            merged.push(key.clone());
        }
    }
    for key in current {
        if placed.insert(key) {
            merged.push(key.clone());
        }
    }
    merged
}

// ==========================================
// Actor
// ==========================================

#[derive(Debug)]
enum Command {
    Trigger,
    Cancel,
    Shutdown,
}

async fn poll_in_flight(slot: &mut Option<InFlight>) -> RequestOutcome {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run_actor(
    mut rx: mpsc::UnboundedReceiver<Command>,
    ctx: Arc<ReoptimizeContext>,
    config: ReoptimizerConfig,
    counters: Arc<ReoptimizerCounters>,
) {
    let debounce = config.debounce();
    let mut deadline: Option<Instant> = None;
    let mut dirty = false;
    let mut in_flight: Option<InFlight> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Trigger) => {
                    counters.triggers.fetch_add(1, Ordering::Relaxed);
                    // 尾沿防抖: 每次触发都重置截止时间
                    deadline = Some(Instant::now() + debounce);
                }
                Some(Command::Cancel) => {
                    if deadline.is_some() || in_flight.is_some() {
                        tracing::info!("取消待发/在途的重优化请求");
                    }
                    deadline = None;
                    dirty = false;
                    in_flight = None;
                }
                Some(Command::Shutdown) | None => {
                    tracing::debug!("静默重优化器退出");
                    break;
                }
            },
            _ = sleep_until_opt(deadline) => {
                deadline = None;
                if in_flight.is_some() {
                    tracing::debug!("已有请求在途，记录待补发");
                    dirty = true;
                } else {
                    counters.requests.fetch_add(1, Ordering::Relaxed);
                    in_flight = Some(Box::pin(ctx.clone().run_once()));
                }
            },
            outcome = poll_in_flight(&mut in_flight) => {
                in_flight = None;
                match outcome {
                    RequestOutcome::Applied => counters.applied.fetch_add(1, Ordering::Relaxed),
                    RequestOutcome::Failed => counters.failures.fetch_add(1, Ordering::Relaxed),
                    RequestOutcome::Discarded => counters.discarded.fetch_add(1, Ordering::Relaxed),
                };
                if dirty && deadline.is_none() {
                    // 在途期间的变更合并为一次补发（仍经过防抖）
                    deadline = Some(Instant::now() + debounce);
                }
                dirty = false;
            },
        }
    }
}

// ==========================================
// SilentReoptimizer
// ==========================================

/// 静默重优化器
///
/// 作为 `SequenceEventPublisher` 接入序列入口层: 结构性变更触发，
/// `Cleared` 取消所有待发/在途请求。必须在 tokio 运行时内创建。
pub struct SilentReoptimizer {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<ReoptimizerCounters>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SilentReoptimizer {
    pub fn spawn(
        state: SharedRouteState,
        matrix_service: Arc<dyn TravelTimeMatrixService>,
        solver: Arc<dyn RouteSolver>,
        notifier: Arc<dyn NotificationSink>,
        store: Option<Arc<dyn RouteStore>>,
        sync: Option<Arc<CrossSurfaceSync>>,
        config: ReoptimizerConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ReoptimizerCounters::default());
        let ctx = Arc::new(ReoptimizeContext {
            state,
            matrix_service,
            solver,
            notifier,
            store,
            sync,
        });
        tracing::info!("静默重优化器已启动: debounce_ms={}", config.debounce_ms);
        let handle = tokio::spawn(run_actor(rx, ctx, config, counters.clone()));
        Arc::new(Self {
            tx,
            counters,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// 手动触发一次（等同一次结构性变更）
    pub fn trigger(&self) {
        self.send(Command::Trigger);
    }

    /// 取消待发与在途请求
    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    pub fn stats(&self) -> ReoptimizerStats {
        let triggers = self.counters.triggers.load(Ordering::Relaxed);
        let requests = self.counters.requests.load(Ordering::Relaxed);
        ReoptimizerStats {
            triggers,
            requests,
            coalesced: triggers.saturating_sub(requests),
            applied: self.counters.applied.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// 停止 actor 并等待其退出（在途请求随之丢弃）
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown);
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                tracing::warn!("重优化器句柄锁获取失败: {}", e);
                None
            }
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("重优化器任务异常退出: {}", e);
            }
        }
    }

    fn send(&self, cmd: Command) {
        if let Err(e) = self.tx.send(cmd) {
            tracing::debug!("重优化器已退出，忽略命令: {:?}", e.0);
        }
    }
}

impl SequenceEventPublisher for SilentReoptimizer {
    fn publish(&self, event: SequenceEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        if event.kind == SequenceEventKind::Cleared {
            self.tx.send(Command::Cancel)?;
        } else if event.triggers_reoptimize() {
            tracing::debug!(
                "序列变更触发重优化: kind={}, revision={}",
                event.kind.as_str(),
                event.revision
            );
            self.tx.send(Command::Trigger)?;
        }
        Ok(())
    }
}

impl Drop for SilentReoptimizer {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coordinates, TravelTimeMatrix, Waypoint, WaypointSequence};
    use crate::engine::route_state::RouteState;
    use crate::engine::services::{ServiceError, ServiceResult, SolveRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// 记录调用次数与最大并发的矩阵服务
    #[derive(Default)]
    struct FakeMatrix {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay_ms: u64,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TravelTimeMatrixService for FakeMatrix {
        async fn fetch_matrix(&self, locations: &[Coordinates]) -> ServiceResult<TravelTimeMatrix> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ServiceError::MatrixUnavailable("offline".into()));
            }
            let n = locations.len();
            Ok(TravelTimeMatrix::from_seconds(vec![vec![60.0; n]; n]))
        }
    }

    /// 将顺序整体反转的求解器
    struct ReverseSolver;

    #[async_trait]
    impl RouteSolver for ReverseSolver {
        async fn solve(&self, request: &SolveRequest, _m: &TravelTimeMatrix) -> ServiceResult<Vec<WaypointKey>> {
            Ok(request.keys.iter().rev().cloned().collect())
        }
    }

    #[derive(Default)]
    struct Notes(Mutex<Vec<String>>);

    impl NotificationSink for Notes {
        fn notify(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn optimized_state(names: &[&str]) -> SharedRouteState {
        let mut seq = WaypointSequence::new();
        for (i, n) in names.iter().enumerate() {
            seq.add(Waypoint::new(*n, Coordinates::new(31.0 + i as f64 * 0.01, 121.0))).unwrap();
        }
        seq.mark_optimized(true);
        SharedRouteState::new(RouteState::new(seq))
    }

    fn addresses(state: &SharedRouteState) -> Vec<String> {
        state
            .read()
            .unwrap()
            .sequence
            .waypoints()
            .iter()
            .map(|w| w.address.clone())
            .collect()
    }

    fn spawn_with(
        state: &SharedRouteState,
        matrix: Arc<FakeMatrix>,
        notes: Arc<Notes>,
    ) -> Arc<SilentReoptimizer> {
        SilentReoptimizer::spawn(
            state.clone(),
            matrix,
            Arc::new(ReverseSolver),
            notes,
            None,
            None,
            ReoptimizerConfig { debounce_ms: 200 },
        )
    }

    fn reordered(revision: u64) -> SequenceEvent {
        SequenceEvent::user(SequenceEventKind::Reordered, true, revision)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_request() {
        let state = optimized_state(&["A", "B", "C"]);
        let matrix = Arc::new(FakeMatrix { delay_ms: 50, ..Default::default() });
        let reopt = spawn_with(&state, matrix.clone(), Arc::new(Notes::default()));

        for i in 0..5 {
            reopt.publish(reordered(i)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(matrix.calls.load(Ordering::SeqCst), 1);
        let stats = reopt.stats();
        assert_eq!(stats.triggers, 5);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.coalesced, 4);
        assert_eq!(stats.applied, 1);
        assert_eq!(addresses(&state), vec!["C", "B", "A"]);
        assert!(state.read().unwrap().matrix.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_during_flight_cause_exactly_one_follow_up() {
        let state = optimized_state(&["A", "B", "C"]);
        let matrix = Arc::new(FakeMatrix { delay_ms: 1_000, ..Default::default() });
        let reopt = spawn_with(&state, matrix.clone(), Arc::new(Notes::default()));

        reopt.publish(reordered(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await; // 请求已在途
        assert_eq!(matrix.calls.load(Ordering::SeqCst), 1);

        for i in 0..3 {
            reopt.publish(reordered(2 + i)).unwrap();
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(matrix.calls.load(Ordering::SeqCst), 2);
        assert_eq!(matrix.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(reopt.stats().requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_state_untouched() {
        let state = optimized_state(&["A", "B", "C"]);
        let matrix = Arc::new(FakeMatrix { delay_ms: 10, ..Default::default() });
        matrix.fail.store(true, Ordering::SeqCst);
        let notes = Arc::new(Notes::default());
        let reopt = spawn_with(&state, matrix.clone(), notes.clone());
        let revision = state.read().unwrap().sequence.revision();

        reopt.publish(reordered(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let guard = state.read().unwrap();
        assert_eq!(guard.sequence.revision(), revision);
        assert!(guard.sequence.is_optimized());
        assert!(guard.matrix.is_none());
        drop(guard);
        assert_eq!(addresses(&state), vec!["A", "B", "C"]);
        assert_eq!(notes.0.lock().unwrap().len(), 1);
        assert_eq!(reopt.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_discarded() {
        let state = optimized_state(&["A", "B"]);
        let matrix = Arc::new(FakeMatrix { delay_ms: 500, ..Default::default() });
        let reopt = spawn_with(&state, matrix.clone(), Arc::new(Notes::default()));

        reopt.publish(reordered(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        {
            // 在途期间重建序列（代次变化）
            let mut guard = state.write().unwrap();
            guard.reset();
            guard.sequence.add(Waypoint::new("X", Coordinates::new(1.0, 1.0))).unwrap();
            guard.sequence.add(Waypoint::new("Y", Coordinates::new(2.0, 2.0))).unwrap();
            guard.sequence.mark_optimized(true);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(addresses(&state), vec!["X", "Y"]);
        assert_eq!(reopt.stats().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_predating_explicit_optimize_is_discarded() {
        let state = optimized_state(&["A", "B", "C"]);
        let matrix = Arc::new(FakeMatrix { delay_ms: 500, ..Default::default() });
        let reopt = spawn_with(&state, matrix.clone(), Arc::new(Notes::default()));

        reopt.publish(reordered(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(matrix.calls.load(Ordering::SeqCst), 1);
        {
            // 在途期间显式优化给出新顺序 B A C
            let mut guard = state.write().unwrap();
            let keys = guard.sequence.keys();
            guard
                .sequence
                .apply_order(&[keys[1].clone(), keys[0].clone(), keys[2].clone()])
                .unwrap();
            guard.bump_plan_epoch();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(addresses(&state), vec!["B", "A", "C"]);
        let stats = reopt.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_applied_order_restarts_cursor_and_pushes_target() {
        use crate::domain::WaypointStatus;

        let state = optimized_state(&["A", "B", "C"]);
        {
            let mut guard = state.write().unwrap();
            let keys = guard.sequence.keys();
            guard.sequence.set_status(&keys[0], WaypointStatus::Delivered).unwrap();
            guard.sequence.set_cursor(1); // B
        }
        let sync = CrossSurfaceSync::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = sync.to_overlay.subscribe(move |m| sink.lock().unwrap().push(m));

        let reopt = SilentReoptimizer::spawn(
            state.clone(),
            Arc::new(FakeMatrix::default()),
            Arc::new(ReverseSolver),
            Arc::new(Notes::default()),
            None,
            Some(sync.clone()),
            ReoptimizerConfig { debounce_ms: 200 },
        );
        reopt.publish(reordered(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // 新顺序 C B A: 第一个待处理站点为 C
        assert_eq!(addresses(&state), vec!["C", "B", "A"]);
        assert_eq!(state.read().unwrap().sequence.cursor(), 0);
        let messages = received.lock().unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            SequencingToOverlay::TargetChanged(payload) => {
                assert_eq!(payload.address, "C");
                assert!(!payload.is_last);
            }
            other => panic!("期望 TargetChanged，实际 {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_cancels_pending_request() {
        let state = optimized_state(&["A", "B"]);
        let matrix = Arc::new(FakeMatrix::default());
        let reopt = spawn_with(&state, matrix.clone(), Arc::new(Notes::default()));

        reopt.publish(reordered(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        reopt
            .publish(SequenceEvent::user(SequenceEventKind::Cleared, false, 2))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(matrix.calls.load(Ordering::SeqCst), 0);
        reopt.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_structural_and_unoptimized_events_ignored() {
        let state = optimized_state(&["A", "B"]);
        let matrix = Arc::new(FakeMatrix::default());
        let reopt = spawn_with(&state, matrix.clone(), Arc::new(Notes::default()));

        reopt
            .publish(SequenceEvent::user(SequenceEventKind::StatusChanged, true, 1))
            .unwrap();
        reopt
            .publish(SequenceEvent::user(SequenceEventKind::Added, false, 2))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(reopt.stats().triggers, 0);
        assert_eq!(matrix.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_merge_order_by_identity() {
        let k = |s: &str| WaypointKey::from(s);
        let solved = vec![k("c"), k("gone"), k("a"), k("b")];
        let current = vec![k("a"), k("b"), k("c"), k("new1"), k("new2")];
        assert_eq!(
            merge_order(&solved, &current),
            vec![k("c"), k("a"), k("b"), k("new1"), k("new2")]
        );
    }
}
