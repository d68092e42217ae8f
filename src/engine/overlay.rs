// ==========================================
// 配送路线引擎 - 悬浮窗状态机
// ==========================================
// 职责: (state, event) → (new_state, effects) 纯函数归约
// 红线:
// - 定时器单次、可取消；任何重新调度前先取消（cancel-before-reschedule）
// - 定时器事件携带代次，过期代次直接忽略
// - 距离未知时不做任何自动收起/展开
// - 窗口位置按阶段分别保存，并钳制到安全区内
// ==========================================
//
// 转换表:
// | 当前阶段          | 事件                              | 新阶段      |
// |-------------------|-----------------------------------|-------------|
// | Minimized         | Tap                               | Full        |
// | Minimized         | DistanceUpdated(< 阈值)           | Full        |
// | Full              | InactivityElapsed 且 距离 >= 阈值 | Minimized   |
// | Full              | UserAction (非最后一站)           | Minimized   |
// | Full              | UserAction (最后一站)             | Completion  |
// | Minimized / Full  | DragReleased 与关闭区域重叠       | Hidden      |
// | Minimized / Full  | AllStopsCompleted                 | Completion  |
// | Completion        | Tap / CompletionTimeout           | Hidden      |
// | 任意可见阶段      | Close                             | Hidden      |

use crate::config::{OverlayConfig, SafeArea, WindowSize};
use crate::domain::{format_distance, OverlayPhase, StopAction, WindowPosition};
use crate::engine::sync::TargetPayload;
use std::time::Duration;

// ==========================================
// 几何
// ==========================================

/// 屏幕矩形
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// 是否有重叠（仅边相接不算重叠）
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// 将窗口位置钳制到安全区: x ∈ [left, right - w], y ∈ [top, bottom - h]
///
/// 安全区比窗口还小时贴靠 left / top。
pub fn clamp_position(position: WindowPosition, size: WindowSize, safe: &SafeArea) -> WindowPosition {
    let clamp_axis = |v: f64, lo: f64, hi: f64| if hi < lo { lo } else { v.max(lo).min(hi) };
    WindowPosition {
        x: clamp_axis(position.x, safe.left, safe.right - size.width),
        y: clamp_axis(position.y, safe.top, safe.bottom - size.height),
    }
}

// ==========================================
// 状态
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Inactivity,
    CompletionTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayState {
    pub phase: OverlayPhase,
    pub target: Option<TargetPayload>,
    pub last_distance_m: Option<f64>,
    pub minimized_position: WindowPosition,
    pub full_position: WindowPosition,
    /// 当前唯一的待触发定时器
    pub timer: Option<PendingTimer>,
    /// 单调递增的定时器代次
    pub timer_generation: u64,
}

impl OverlayState {
    pub fn position(&self, phase: OverlayPhase) -> Option<WindowPosition> {
        match phase {
            OverlayPhase::Minimized => Some(self.minimized_position),
            OverlayPhase::Full => Some(self.full_position),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == OverlayPhase::Hidden
    }

    /// 距离显示文本（无定位时为 "unknown"）
    pub fn distance_text(&self) -> String {
        format_distance(self.last_distance_m)
    }

    fn within_threshold(&self, config: &OverlayConfig) -> Option<bool> {
        self.last_distance_m.map(|d| d < config.proximity_threshold_m)
    }

    fn is_last_target(&self) -> bool {
        self.target.as_ref().map(|t| t.is_last).unwrap_or(false)
    }
}

// ==========================================
// 事件与副作用
// ==========================================

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEvent {
    Tap,
    /// 新的距离读数（None = 无定位/无权限）
    DistanceUpdated(Option<f64>),
    /// 用户与卡片交互（滚动、展开照片等）
    UserInteraction,
    InactivityElapsed { generation: u64 },
    UserAction(StopAction),
    DragReleased { window: Rect, close_target: Rect },
    AllStopsCompleted,
    CompletionTimeout { generation: u64 },
    TargetChanged(TargetPayload),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEffect {
    CancelTimer,
    ScheduleTimer { kind: TimerKind, after: Duration, generation: u64 },
    ForwardAction { action: StopAction, address: String },
    ForwardAllStopsCompleted,
    PersistPosition { phase: OverlayPhase, position: WindowPosition },
    Render,
    Terminate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: OverlayState,
    pub effects: Vec<OverlayEffect>,
}

// ==========================================
// 定时器辅助
// ==========================================

fn arm(state: &mut OverlayState, effects: &mut Vec<OverlayEffect>, kind: TimerKind, after: Duration) {
    if state.timer.is_some() {
        effects.push(OverlayEffect::CancelTimer);
    }
    state.timer_generation = state.timer_generation.wrapping_add(1);
    state.timer = Some(PendingTimer {
        kind,
        generation: state.timer_generation,
    });
    effects.push(OverlayEffect::ScheduleTimer {
        kind,
        after,
        generation: state.timer_generation,
    });
}

fn disarm(state: &mut OverlayState, effects: &mut Vec<OverlayEffect>) {
    if state.timer.take().is_some() {
        effects.push(OverlayEffect::CancelTimer);
    }
}

fn is_current(state: &OverlayState, kind: TimerKind, generation: u64) -> bool {
    state.timer == Some(PendingTimer { kind, generation })
}

fn terminate(state: &mut OverlayState, effects: &mut Vec<OverlayEffect>) {
    disarm(state, effects);
    state.phase = OverlayPhase::Hidden;
    effects.push(OverlayEffect::Terminate);
}

// ==========================================
// 启动
// ==========================================

/// 悬浮窗启动: 默认 Minimized，恢复上下文时进入 Full
pub fn start(
    resume_full: bool,
    target: Option<TargetPayload>,
    minimized_position: WindowPosition,
    full_position: WindowPosition,
    config: &OverlayConfig,
) -> Transition {
    let mut state = OverlayState {
        phase: OverlayPhase::Minimized,
        target,
        last_distance_m: None,
        minimized_position: clamp_position(minimized_position, config.minimized_size, &config.safe_area),
        full_position: clamp_position(full_position, config.full_size, &config.safe_area),
        timer: None,
        timer_generation: 0,
    };
    let mut effects = Vec::new();
    if resume_full {
        state.phase = OverlayPhase::Full;
        arm(&mut state, &mut effects, TimerKind::Inactivity, config.inactivity());
    }
    effects.push(OverlayEffect::Render);
    Transition { state, effects }
}

// ==========================================
// 归约
// ==========================================

pub fn reduce(current: &OverlayState, event: OverlayEvent, config: &OverlayConfig) -> Transition {
    use OverlayEvent as E;
    use OverlayPhase as P;

    let mut state = current.clone();
    let mut effects = Vec::new();

    match (current.phase, event) {
        // ===== Hidden: 终态，忽略一切 =====
        (P::Hidden, _) => {}

        // ===== 通用 =====
        (_, E::Close) => terminate(&mut state, &mut effects),

        (P::Minimized | P::Full, E::TargetChanged(payload)) => {
            state.target = Some(payload);
            // 旧距离属于上一站，等下一个定位点
            state.last_distance_m = None;
            effects.push(OverlayEffect::Render);
        }

        (P::Minimized | P::Full, E::AllStopsCompleted) => {
            state.phase = P::Completion;
            arm(&mut state, &mut effects, TimerKind::CompletionTimeout, config.completion_timeout());
            effects.push(OverlayEffect::Render);
        }

        (P::Minimized | P::Full, E::DragReleased { window, close_target }) => {
            if window.intersects(&close_target) {
                tracing::info!("悬浮窗拖入关闭区域，结束悬浮窗");
                terminate(&mut state, &mut effects);
            } else {
                let phase = current.phase;
                let size = if phase == P::Full {
                    config.full_size
                } else {
                    config.minimized_size
                };
                let position = clamp_position(WindowPosition::new(window.x, window.y), size, &config.safe_area);
                if phase == P::Full {
                    state.full_position = position;
                } else {
                    state.minimized_position = position;
                }
                effects.push(OverlayEffect::PersistPosition { phase, position });
                effects.push(OverlayEffect::Render);
            }
        }

        // ===== Minimized =====
        (P::Minimized, E::Tap) => {
            state.phase = P::Full;
            arm(&mut state, &mut effects, TimerKind::Inactivity, config.inactivity());
            effects.push(OverlayEffect::Render);
        }

        (P::Minimized, E::DistanceUpdated(distance)) => {
            state.last_distance_m = distance;
            if state.within_threshold(config) == Some(true) {
                tracing::debug!("接近站点，自动展开: distance={:?}", distance);
                state.phase = P::Full;
                arm(&mut state, &mut effects, TimerKind::Inactivity, config.inactivity());
            }
            effects.push(OverlayEffect::Render);
        }

        // ===== Full =====
        (P::Full, E::DistanceUpdated(distance)) => {
            state.last_distance_m = distance;
            if state.within_threshold(config) == Some(true) {
                // 靠近站点时不允许自动收起
                arm(&mut state, &mut effects, TimerKind::Inactivity, config.inactivity());
            }
            effects.push(OverlayEffect::Render);
        }

        (P::Full, E::UserInteraction) => {
            arm(&mut state, &mut effects, TimerKind::Inactivity, config.inactivity());
        }

        (P::Full, E::InactivityElapsed { generation })
            if is_current(current, TimerKind::Inactivity, generation) =>
        {
            state.timer = None;
            if state.within_threshold(config) == Some(false) {
                tracing::debug!("无操作超时且远离站点，自动收起");
                state.phase = P::Minimized;
                effects.push(OverlayEffect::Render);
            } else {
                arm(&mut state, &mut effects, TimerKind::Inactivity, config.inactivity());
            }
        }

        (P::Full, E::UserAction(action)) => {
            let address = current.target.as_ref().map(|t| t.address.clone()).unwrap_or_default();
            effects.push(OverlayEffect::ForwardAction { action, address });
            if current.is_last_target() {
                state.phase = P::Completion;
                effects.push(OverlayEffect::ForwardAllStopsCompleted);
                arm(&mut state, &mut effects, TimerKind::CompletionTimeout, config.completion_timeout());
            } else {
                state.phase = P::Minimized;
                disarm(&mut state, &mut effects);
            }
            effects.push(OverlayEffect::Render);
        }

        // ===== Completion =====
        (P::Completion, E::Tap) => terminate(&mut state, &mut effects),

        (P::Completion, E::CompletionTimeout { generation })
            if is_current(current, TimerKind::CompletionTimeout, generation) =>
        {
            state.timer = None;
            terminate(&mut state, &mut effects);
        }

        // ===== 其余组合: 过期定时器、阶段不符的动作等 =====
        (phase, event) => {
            tracing::debug!("悬浮窗忽略事件: phase={}, event={:?}", phase, event);
        }
    }

    if state.phase != current.phase {
        tracing::info!("悬浮窗阶段变更: {} -> {}", current.phase, state.phase);
    }
    Transition { state, effects }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Coordinates;

    fn config() -> OverlayConfig {
        OverlayConfig::default()
    }

    fn target(is_last: bool) -> TargetPayload {
        TargetPayload {
            address: "Main Street 1".to_string(),
            coordinates: Coordinates::new(31.0, 121.0),
            package: None,
            notes: None,
            photos: Vec::new(),
            favorite_name: None,
            is_last,
        }
    }

    fn started(resume_full: bool, is_last: bool) -> OverlayState {
        start(
            resume_full,
            Some(target(is_last)),
            WindowPosition::new(10.0, 100.0),
            WindowPosition::new(20.0, 200.0),
            &config(),
        )
        .state
    }

    fn pending_generation(state: &OverlayState) -> u64 {
        state.timer.map(|t| t.generation).unwrap()
    }

    fn step(state: &OverlayState, event: OverlayEvent) -> Transition {
        reduce(state, event, &config())
    }

    #[test]
    fn test_start_phase() {
        assert_eq!(started(false, false).phase, OverlayPhase::Minimized);
        let full = started(true, false);
        assert_eq!(full.phase, OverlayPhase::Full);
        assert_eq!(full.timer.map(|t| t.kind), Some(TimerKind::Inactivity));
    }

    #[test]
    fn test_tap_expands() {
        let t = step(&started(false, false), OverlayEvent::Tap);
        assert_eq!(t.state.phase, OverlayPhase::Full);
        assert!(matches!(t.effects[0], OverlayEffect::ScheduleTimer { kind: TimerKind::Inactivity, .. }));
    }

    #[test]
    fn test_far_then_inactive_minimizes_then_near_expands() {
        let s = started(true, false);
        let s = step(&s, OverlayEvent::DistanceUpdated(Some(450.0))).state;
        let s = step(&s, OverlayEvent::DistanceUpdated(Some(300.0))).state;
        assert_eq!(s.phase, OverlayPhase::Full);

        let gen = pending_generation(&s);
        let s = step(&s, OverlayEvent::InactivityElapsed { generation: gen }).state;
        assert_eq!(s.phase, OverlayPhase::Minimized);
        assert!(s.timer.is_none());

        let t = step(&s, OverlayEvent::DistanceUpdated(Some(120.0)));
        assert_eq!(t.state.phase, OverlayPhase::Full);
    }

    #[test]
    fn test_near_stop_resets_inactivity_with_cancel_first() {
        let s = started(true, false);
        let old_gen = pending_generation(&s);
        let t = step(&s, OverlayEvent::DistanceUpdated(Some(80.0)));
        assert_eq!(t.effects[0], OverlayEffect::CancelTimer);
        assert!(matches!(t.effects[1], OverlayEffect::ScheduleTimer { .. }));

        // 旧定时器到期不再生效
        let stale = step(&t.state, OverlayEvent::InactivityElapsed { generation: old_gen });
        assert_eq!(stale.state, t.state);
        assert!(stale.effects.is_empty());
    }

    #[test]
    fn test_inactivity_near_stop_stays_full() {
        let s = step(&started(true, false), OverlayEvent::DistanceUpdated(Some(50.0))).state;
        let gen = pending_generation(&s);
        let t = step(&s, OverlayEvent::InactivityElapsed { generation: gen });
        assert_eq!(t.state.phase, OverlayPhase::Full);
        assert!(t.state.timer.is_some());
    }

    #[test]
    fn test_unknown_distance_never_auto_transitions() {
        let s = started(false, false);
        let t = step(&s, OverlayEvent::DistanceUpdated(None));
        assert_eq!(t.state.phase, OverlayPhase::Minimized);

        let s = started(true, false);
        let s = step(&s, OverlayEvent::DistanceUpdated(None)).state;
        let gen = pending_generation(&s);
        let t = step(&s, OverlayEvent::InactivityElapsed { generation: gen });
        assert_eq!(t.state.phase, OverlayPhase::Full);
        assert_eq!(t.state.distance_text(), "unknown");
    }

    #[test]
    fn test_target_change_forgets_previous_distance() {
        let s = step(&started(true, false), OverlayEvent::DistanceUpdated(Some(50.0))).state;
        let s = step(&s, OverlayEvent::TargetChanged(target(false))).state;
        assert_eq!(s.last_distance_m, None);
        assert_eq!(s.distance_text(), "unknown");

        // 距离未知: 无操作超时只重新计时，不沿用旧站点的"靠近"判断
        let gen = pending_generation(&s);
        let t = step(&s, OverlayEvent::InactivityElapsed { generation: gen });
        assert_eq!(t.state.phase, OverlayPhase::Full);

        let s = step(&t.state, OverlayEvent::DistanceUpdated(Some(900.0))).state;
        let gen = pending_generation(&s);
        let t = step(&s, OverlayEvent::InactivityElapsed { generation: gen });
        assert_eq!(t.state.phase, OverlayPhase::Minimized);
    }

    #[test]
    fn test_distance_text() {
        let s = step(&started(true, false), OverlayEvent::DistanceUpdated(Some(1234.0))).state;
        assert_eq!(s.distance_text(), "1.2 km");
    }

    #[test]
    fn test_user_action_forwards_and_minimizes() {
        let s = started(true, false);
        let t = step(&s, OverlayEvent::UserAction(StopAction::Done));
        assert_eq!(t.state.phase, OverlayPhase::Minimized);
        assert!(t.effects.contains(&OverlayEffect::ForwardAction {
            action: StopAction::Done,
            address: "Main Street 1".to_string(),
        }));
        assert!(t.effects.contains(&OverlayEffect::CancelTimer));
        assert!(t.state.timer.is_none());
    }

    #[test]
    fn test_action_on_last_stop_completes_then_times_out() {
        let s = started(true, true);
        let t = step(&s, OverlayEvent::UserAction(StopAction::Skip));
        assert_eq!(t.state.phase, OverlayPhase::Completion);
        assert!(t.effects.contains(&OverlayEffect::ForwardAllStopsCompleted));

        let gen = pending_generation(&t.state);
        let done = step(&t.state, OverlayEvent::CompletionTimeout { generation: gen });
        assert_eq!(done.state.phase, OverlayPhase::Hidden);
        assert!(done.effects.contains(&OverlayEffect::Terminate));
    }

    #[test]
    fn test_all_stops_completed_then_tap_hides() {
        let t = step(&started(false, false), OverlayEvent::AllStopsCompleted);
        assert_eq!(t.state.phase, OverlayPhase::Completion);
        let t = step(&t.state, OverlayEvent::Tap);
        assert_eq!(t.state.phase, OverlayPhase::Hidden);
        assert_eq!(t.effects, vec![OverlayEffect::CancelTimer, OverlayEffect::Terminate]);
    }

    #[test]
    fn test_drag_to_dismiss() {
        let close = Rect::new(480.0, 2100.0, 120.0, 120.0);
        let s = started(true, false);
        let t = step(
            &s,
            OverlayEvent::DragReleased {
                window: Rect::new(470.0, 2050.0, 220.0, 96.0),
                close_target: close,
            },
        );
        assert_eq!(t.state.phase, OverlayPhase::Hidden);
        assert!(t.effects.contains(&OverlayEffect::Terminate));

        // 被终止后任何事件都无效
        let after = step(&t.state, OverlayEvent::Tap);
        assert_eq!(after.state.phase, OverlayPhase::Hidden);
        assert!(after.effects.is_empty());
    }

    #[test]
    fn test_drag_without_overlap_persists_clamped_position() {
        let close = Rect::new(480.0, 2100.0, 120.0, 120.0);
        let s = started(false, false);
        let t = step(
            &s,
            OverlayEvent::DragReleased {
                window: Rect::new(-50.0, 5.0, 220.0, 96.0),
                close_target: close,
            },
        );
        assert_eq!(t.state.phase, OverlayPhase::Minimized);
        let expected = WindowPosition::new(0.0, 24.0);
        assert_eq!(t.state.minimized_position, expected);
        assert_eq!(t.state.full_position, s.full_position);
        assert!(t.effects.contains(&OverlayEffect::PersistPosition {
            phase: OverlayPhase::Minimized,
            position: expected,
        }));
    }

    #[test]
    fn test_clamp_position() {
        let safe = SafeArea {
            left: 0.0,
            top: 24.0,
            right: 1080.0,
            bottom: 2340.0,
        };
        let size = WindowSize {
            width: 220.0,
            height: 96.0,
        };
        assert_eq!(
            clamp_position(WindowPosition::new(2000.0, 3000.0), size, &safe),
            WindowPosition::new(860.0, 2244.0)
        );
        let tiny = SafeArea {
            left: 10.0,
            top: 10.0,
            right: 100.0,
            bottom: 50.0,
        };
        assert_eq!(
            clamp_position(WindowPosition::new(500.0, 500.0), size, &tiny),
            WindowPosition::new(10.0, 10.0)
        );
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&Rect::new(5.0, 5.0, 10.0, 10.0)));
        assert!(!a.intersects(&Rect::new(10.0, 0.0, 10.0, 10.0)));
        assert!(!a.intersects(&Rect::new(20.0, 20.0, 1.0, 1.0)));
    }
}
