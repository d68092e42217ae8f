// ==========================================
// 配送路线引擎 - 悬浮窗界面运行时
// ==========================================
// 职责: 悬浮窗 UI 线程（actor），OverlayState 的唯一写者
// - 定位回调、跨界面消息、定时器到期均经 mpsc 转入 actor 再归约
// - 执行归约产生的副作用（渲染、定时器、转发、位置持久化、终止）
// - 启动时获取一次"保持唤醒"锁，拆除时释放一次
// 拆除顺序: 取消定时器 → 退订 → 释放唤醒锁 → 移除窗口
// ==========================================

use crate::config::EngineConfig;
use crate::domain::{OverlayPhase, WindowPosition};
use crate::engine::overlay::{self, OverlayEffect, OverlayEvent, OverlayState, TimerKind};
use crate::engine::proximity::{LocationFix, ProximityTracker};
use crate::engine::services::{RideHistoryStore, WakeLockProvider, WindowHost};
use crate::engine::sync::{CrossSurfaceSync, OverlayToSequencing, SequencingToOverlay, Subscription, TargetPayload};
use crate::repository::RouteStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ==========================================
// KeepAwakeGuard - 幂等的唤醒锁守卫
// ==========================================
pub struct KeepAwakeGuard {
    provider: Arc<dyn WakeLockProvider>,
    held: AtomicBool,
}

impl KeepAwakeGuard {
    pub fn new(provider: Arc<dyn WakeLockProvider>) -> Self {
        Self {
            provider,
            held: AtomicBool::new(false),
        }
    }

    /// 已持有时为空操作
    pub fn acquire(&self) {
        if self.held.swap(true, Ordering::SeqCst) {
            tracing::debug!("唤醒锁已持有，忽略重复获取");
            return;
        }
        if let Err(e) = self.provider.acquire() {
            self.held.store(false, Ordering::SeqCst);
            tracing::warn!("唤醒锁获取失败: {}", e);
        }
    }

    /// 未持有时为空操作
    pub fn release(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            tracing::debug!("唤醒锁未持有，忽略重复释放");
            return;
        }
        if let Err(e) = self.provider.release() {
            tracing::warn!("唤醒锁释放失败: {}", e);
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAwakeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ==========================================
// 输入与句柄
// ==========================================

#[derive(Debug, Clone)]
enum SurfaceInput {
    Event(OverlayEvent),
    Location(LocationFix),
    LocationUnavailable,
    Shutdown,
}

/// 定位回调入口（可在任意线程调用，内部转交 UI actor）
#[derive(Clone)]
pub struct LocationSink {
    tx: mpsc::UnboundedSender<SurfaceInput>,
}

impl LocationSink {
    pub fn on_fix(&self, fix: LocationFix) {
        if self.tx.send(SurfaceInput::Location(fix)).is_err() {
            tracing::debug!("悬浮窗已销毁，丢弃定位点");
        }
    }

    pub fn on_unavailable(&self) {
        if self.tx.send(SurfaceInput::LocationUnavailable).is_err() {
            tracing::debug!("悬浮窗已销毁，丢弃定位不可用通知");
        }
    }
}

/// 悬浮窗依赖（构造注入）
#[derive(Clone)]
pub struct OverlaySurfaceDeps {
    pub window_host: Arc<dyn WindowHost>,
    pub wake_lock: Arc<dyn WakeLockProvider>,
    pub ride_history: Arc<dyn RideHistoryStore>,
    pub store: Arc<dyn RouteStore>,
    pub sync: Arc<CrossSurfaceSync>,
}

pub struct OverlaySurfaceHandle {
    tx: mpsc::UnboundedSender<SurfaceInput>,
    state_rx: watch::Receiver<OverlayState>,
    join: JoinHandle<OverlayState>,
}

impl OverlaySurfaceHandle {
    pub fn send(&self, event: OverlayEvent) {
        if self.tx.send(SurfaceInput::Event(event)).is_err() {
            tracing::debug!("悬浮窗已销毁，忽略事件");
        }
    }

    pub fn location_sink(&self) -> LocationSink {
        LocationSink { tx: self.tx.clone() }
    }

    /// 最近一次归约后的状态快照
    pub fn state(&self) -> OverlayState {
        self.state_rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 显式关闭并等待拆除完成，返回最终状态
    pub async fn shutdown(self) -> OverlayState {
        if self.tx.send(SurfaceInput::Shutdown).is_err() {
            tracing::debug!("悬浮窗已自行拆除");
        }
        self.join().await
    }

    /// 等待悬浮窗自行结束（拖拽关闭 / 完成超时）
    pub async fn join(self) -> OverlayState {
        let fallback = self.state_rx.borrow().clone();
        match self.join.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("悬浮窗任务异常退出: {}", e);
                fallback
            }
        }
    }
}

// ==========================================
// 启动
// ==========================================

/// 启动悬浮窗界面（必须在 tokio 运行时内调用）
pub fn start_overlay_surface(
    config: EngineConfig,
    deps: OverlaySurfaceDeps,
    resume_full: bool,
    initial_target: Option<TargetPayload>,
) -> OverlaySurfaceHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let load_position = |phase: OverlayPhase| {
        deps.store
            .load_overlay_position(phase)
            .unwrap_or_else(|e| {
                tracing::warn!("读取悬浮窗位置失败: phase={}, error={}", phase, e);
                None
            })
            .unwrap_or_else(|| WindowPosition::new(config.overlay.safe_area.left, config.overlay.safe_area.top))
    };
    let transition = overlay::start(
        resume_full,
        initial_target.clone(),
        load_position(OverlayPhase::Minimized),
        load_position(OverlayPhase::Full),
        &config.overlay,
    );
    let (state_tx, state_rx) = watch::channel(transition.state.clone());

    let join = tokio::spawn(run_surface(
        config,
        deps,
        tx.clone(),
        rx,
        state_tx,
        transition,
        initial_target,
    ));

    OverlaySurfaceHandle { tx, state_rx, join }
}

// ==========================================
// UI actor
// ==========================================

struct SurfaceRuntime {
    config: EngineConfig,
    deps: OverlaySurfaceDeps,
    tx: mpsc::UnboundedSender<SurfaceInput>,
    timer: Option<JoinHandle<()>>,
    window_removed: bool,
}

impl SurfaceRuntime {
    fn apply(&mut self, state: &OverlayState, effects: Vec<OverlayEffect>) {
        for effect in effects {
            match effect {
                OverlayEffect::CancelTimer => {
                    if let Some(handle) = self.timer.take() {
                        handle.abort();
                    }
                }
                OverlayEffect::ScheduleTimer { kind, after, generation } => {
                    if let Some(stale) = self.timer.take() {
                        stale.abort();
                    }
                    let tx = self.tx.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let event = match kind {
                            TimerKind::Inactivity => OverlayEvent::InactivityElapsed { generation },
                            TimerKind::CompletionTimeout => OverlayEvent::CompletionTimeout { generation },
                        };
                        if tx.send(SurfaceInput::Event(event)).is_err() {
                            tracing::debug!("悬浮窗已销毁，定时器到期被忽略: kind={:?}", kind);
                        }
                    }));
                }
                OverlayEffect::ForwardAction { action, address } => {
                    self.deps
                        .sync
                        .to_sequencing
                        .publish(OverlayToSequencing::Action { action, address });
                }
                OverlayEffect::ForwardAllStopsCompleted => {
                    self.deps.sync.to_sequencing.publish(OverlayToSequencing::AllStopsCompleted);
                }
                OverlayEffect::PersistPosition { phase, position } => {
                    if let Err(e) = self.deps.store.save_overlay_position(phase, position) {
                        tracing::warn!("悬浮窗位置保存失败: phase={}, error={}", phase, e);
                    }
                }
                OverlayEffect::Render => {
                    let position = state
                        .position(state.phase)
                        .unwrap_or(state.full_position);
                    tracing::debug!("渲染悬浮窗: phase={}, distance={}", state.phase, state.distance_text());
                    if let Err(e) = self.deps.window_host.show(state.phase, position.x, position.y) {
                        if e.is_benign() {
                            tracing::debug!("窗口已分离，忽略渲染: {}", e);
                        } else {
                            tracing::warn!("悬浮窗渲染失败: {}", e);
                        }
                    }
                }
                OverlayEffect::Terminate => self.remove_window(),
            }
        }
    }

    fn remove_window(&mut self) {
        if self.window_removed {
            return;
        }
        self.window_removed = true;
        match self.deps.window_host.remove() {
            Ok(()) => tracing::info!("悬浮窗已移除"),
            Err(e) if e.is_benign() => tracing::debug!("移除已分离的窗口，忽略: {}", e),
            Err(e) => tracing::warn!("悬浮窗移除失败: {}", e),
        }
    }
}

async fn run_surface(
    config: EngineConfig,
    deps: OverlaySurfaceDeps,
    tx: mpsc::UnboundedSender<SurfaceInput>,
    mut rx: mpsc::UnboundedReceiver<SurfaceInput>,
    state_tx: watch::Sender<OverlayState>,
    initial: overlay::Transition,
    initial_target: Option<TargetPayload>,
) -> OverlayState {
    let wake = KeepAwakeGuard::new(deps.wake_lock.clone());
    wake.acquire();

    // 跨界面消息转入本 actor
    let inbound_tx = tx.clone();
    let subscription: Subscription = deps.sync.to_overlay.subscribe(move |message| {
        let event = match message {
            SequencingToOverlay::TargetChanged(payload) => OverlayEvent::TargetChanged(payload),
            SequencingToOverlay::AllStopsCompleted => OverlayEvent::AllStopsCompleted,
        };
        if inbound_tx.send(SurfaceInput::Event(event)).is_err() {
            tracing::debug!("悬浮窗已销毁，丢弃排序界面消息");
        }
    });

    let mut tracker = ProximityTracker::new(
        config.proximity.clone(),
        config.overlay.proximity_threshold_m,
        deps.ride_history.clone(),
    );
    tracker.set_target(initial_target.as_ref().map(|t| t.coordinates));

    let mut runtime = SurfaceRuntime {
        config,
        deps,
        tx,
        timer: None,
        window_removed: false,
    };

    let mut state = initial.state;
    runtime.apply(&state, initial.effects);
    tracing::info!("悬浮窗已启动: phase={}", state.phase);

    while !state.is_terminated() {
        let event = match rx.recv().await {
            Some(SurfaceInput::Event(event)) => event,
            Some(SurfaceInput::Location(fix)) => {
                OverlayEvent::DistanceUpdated(tracker.on_fix(fix).distance_m)
            }
            Some(SurfaceInput::LocationUnavailable) => {
                OverlayEvent::DistanceUpdated(tracker.on_location_unavailable().distance_m)
            }
            Some(SurfaceInput::Shutdown) | None => break,
        };
        if let OverlayEvent::TargetChanged(payload) = &event {
            tracker.set_target(Some(payload.coordinates));
        }

        let transition = overlay::reduce(&state, event, &runtime.config.overlay);
        state = transition.state;
        runtime.apply(&state, transition.effects);
        state_tx.send_replace(state.clone());
    }

    // ===== 拆除 =====
    if let Some(handle) = runtime.timer.take() {
        handle.abort();
    }
    drop(subscription);
    wake.release();
    runtime.remove_window();
    if !state.is_terminated() {
        state.phase = OverlayPhase::Hidden;
        state.timer = None;
        state_tx.send_replace(state.clone());
    }
    tracing::info!("悬浮窗已拆除");
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coordinates, StopAction};
    use crate::engine::overlay::Rect;
    use crate::engine::services::{ServiceError, ServiceResult};
    use crate::repository::SqliteRouteStore;
    use rusqlite::Connection;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeWindow {
        shows: AtomicUsize,
        removes: AtomicUsize,
    }

    impl WindowHost for FakeWindow {
        fn show(&self, _phase: OverlayPhase, _x: f64, _y: f64) -> ServiceResult<()> {
            self.shows.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn remove(&self) -> ServiceResult<()> {
            if self.removes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(ServiceError::WindowDetached("already removed".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeWake {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl WakeLockProvider for FakeWake {
        fn acquire(&self) -> ServiceResult<()> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release(&self) -> ServiceResult<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoRide;

    impl RideHistoryStore for NoRide {
        fn add_track_point(&self, _: f64, _: f64, _: f64, _: i64, _: u32) -> ServiceResult<()> {
            Ok(())
        }
        fn update_distance(&self, _: f64) -> ServiceResult<()> {
            Ok(())
        }
        fn check_stop_proximity(&self, _: f64, _: f64, _: i64) -> ServiceResult<()> {
            Ok(())
        }
        fn current_ride_id(&self) -> Option<String> {
            None
        }
    }

    struct Fixture {
        window: Arc<FakeWindow>,
        wake: Arc<FakeWake>,
        store: Arc<SqliteRouteStore>,
        sync: Arc<CrossSurfaceSync>,
    }

    impl Fixture {
        fn new() -> Self {
            let conn = Connection::open_in_memory().unwrap();
            Self {
                window: Arc::new(FakeWindow::default()),
                wake: Arc::new(FakeWake::default()),
                store: Arc::new(SqliteRouteStore::from_connection(Arc::new(Mutex::new(conn))).unwrap()),
                sync: CrossSurfaceSync::new(),
            }
        }

        fn deps(&self) -> OverlaySurfaceDeps {
            OverlaySurfaceDeps {
                window_host: self.window.clone(),
                wake_lock: self.wake.clone(),
                ride_history: Arc::new(NoRide),
                store: self.store.clone(),
                sync: self.sync.clone(),
            }
        }
    }

    fn target(is_last: bool) -> TargetPayload {
        TargetPayload {
            address: "Main Street 1".into(),
            coordinates: Coordinates::new(31.0, 121.0),
            package: None,
            notes: None,
            photos: Vec::new(),
            favorite_name: None,
            is_last,
        }
    }

    fn fix_at(lat: f64, secs: i64) -> LocationFix {
        LocationFix {
            lat,
            lng: 121.0,
            accuracy_m: 5.0,
            timestamp_ms: secs * 1000,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_proximity_drives_phase_and_inactivity_minimizes() {
        let fx = Fixture::new();
        let handle = start_overlay_surface(EngineConfig::default(), fx.deps(), false, Some(target(false)));
        settle().await;
        assert_eq!(handle.state().phase, OverlayPhase::Minimized);
        assert_eq!(fx.wake.acquired.load(Ordering::SeqCst), 1);

        let sink = handle.location_sink();
        sink.on_fix(fix_at(31.001, 0)); // ≈111m → 展开
        settle().await;
        assert_eq!(handle.state().phase, OverlayPhase::Full);

        sink.on_fix(fix_at(31.01, 5)); // ≈1.1km
        settle().await;
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(handle.state().phase, OverlayPhase::Minimized);

        let final_state = handle.shutdown().await;
        assert_eq!(final_state.phase, OverlayPhase::Hidden);
        assert_eq!(fx.wake.released.load(Ordering::SeqCst), 1);
        assert_eq!(fx.window.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drag_to_dismiss_tears_down_once() {
        let fx = Fixture::new();
        let handle = start_overlay_surface(EngineConfig::default(), fx.deps(), true, Some(target(false)));
        settle().await;

        handle.send(OverlayEvent::DragReleased {
            window: Rect::new(500.0, 2100.0, 220.0, 96.0),
            close_target: Rect::new(480.0, 2100.0, 120.0, 120.0),
        });
        let final_state = handle.join().await;

        assert_eq!(final_state.phase, OverlayPhase::Hidden);
        assert_eq!(fx.wake.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(fx.wake.released.load(Ordering::SeqCst), 1);
        assert_eq!(fx.window.removes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.sync.to_overlay.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_action_completes_and_auto_closes() {
        let fx = Fixture::new();
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = forwarded.clone();
        let _sub = fx.sync.to_sequencing.subscribe(move |m| sink.lock().unwrap().push(m));

        let handle = start_overlay_surface(EngineConfig::default(), fx.deps(), true, Some(target(true)));
        settle().await;
        handle.send(OverlayEvent::UserAction(StopAction::Done));
        settle().await;
        assert_eq!(handle.state().phase, OverlayPhase::Completion);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let final_state = handle.join().await;
        assert_eq!(final_state.phase, OverlayPhase::Hidden);
        assert_eq!(
            *forwarded.lock().unwrap(),
            vec![
                OverlayToSequencing::Action {
                    action: StopAction::Done,
                    address: "Main Street 1".into()
                },
                OverlayToSequencing::AllStopsCompleted,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_changed_via_bus_and_position_persisted() {
        let fx = Fixture::new();
        let handle = start_overlay_surface(EngineConfig::default(), fx.deps(), false, None);
        settle().await;

        let mut next = target(false);
        next.address = "Second Street 2".into();
        fx.sync.to_overlay.publish(SequencingToOverlay::TargetChanged(next));
        settle().await;
        assert_eq!(
            handle.state().target.map(|t| t.address),
            Some("Second Street 2".to_string())
        );

        handle.send(OverlayEvent::DragReleased {
            window: Rect::new(300.0, 400.0, 220.0, 96.0),
            close_target: Rect::new(480.0, 2100.0, 120.0, 120.0),
        });
        settle().await;
        assert_eq!(
            fx.store.load_overlay_position(OverlayPhase::Minimized).unwrap(),
            Some(WindowPosition::new(300.0, 400.0))
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_change_clears_distance_and_late_fixes_are_dropped() {
        let fx = Fixture::new();
        let handle = start_overlay_surface(EngineConfig::default(), fx.deps(), false, Some(target(false)));
        settle().await;
        let sink = handle.location_sink();
        sink.on_fix(fix_at(31.001, 0));
        settle().await;
        assert!(handle.state().last_distance_m.is_some());

        let mut next = target(false);
        next.address = "Far Road 9".into();
        next.coordinates = Coordinates::new(31.2, 121.0);
        fx.sync.to_overlay.publish(SequencingToOverlay::TargetChanged(next));
        settle().await;
        let state = handle.state();
        assert_eq!(state.last_distance_m, None);
        assert_eq!(state.distance_text(), "unknown");

        handle.shutdown().await;
        // 拆除后的定位回调只记录日志
        sink.on_fix(fix_at(31.2, 10));
        sink.on_unavailable();
        assert_eq!(fx.window.removes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keep_awake_guard_is_idempotent() {
        let wake = Arc::new(FakeWake::default());
        let guard = KeepAwakeGuard::new(wake.clone());
        guard.acquire();
        guard.acquire();
        assert!(guard.is_held());
        guard.release();
        guard.release();
        drop(guard);
        assert_eq!(wake.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(wake.released.load(Ordering::SeqCst), 1);
    }
}
