// ==========================================
// 配送路线引擎 - 引擎层
// ==========================================
// 职责: 排序、到达估算、静默重优化、悬浮窗状态机、接近度跟踪、跨界面同步
// 红线: Engine 不拼 SQL；外部协作方只通过 services 中的 trait 访问
// ==========================================

pub mod arrival;
pub mod events;
pub mod overlay;
pub mod overlay_surface;
pub mod proximity;
pub mod reoptimizer;
pub mod reorder;
pub mod route_state;
pub mod services;
pub mod sync;

// 重导出核心引擎
pub use arrival::{estimate_arrivals, ArrivalEstimate, ArrivalLabel, Compliance, StartTime};
pub use events::{
    MutationOrigin, NoOpEventPublisher, OptionalEventPublisher, SequenceEvent, SequenceEventKind,
    SequenceEventPublisher,
};
pub use overlay::{OverlayEffect, OverlayEvent, OverlayState, Rect};
pub use overlay_surface::{
    start_overlay_surface, KeepAwakeGuard, LocationSink, OverlaySurfaceDeps, OverlaySurfaceHandle,
};
pub use proximity::{LocationFix, ProximityTracker, ProximityUpdate};
pub use reoptimizer::{ReoptimizerStats, SilentReoptimizer};
pub use reorder::{DragSession, ReorderEngine, ReorderOutcome, RowGeometry};
pub use route_state::{MatrixBinding, RouteState, SharedRouteState, StateLockError};
pub use services::{
    LogNotificationSink, NearestNeighborSolver, NotificationSink, RideHistoryStore, RouteSolver,
    ServiceError, ServiceResult, SolveRequest, StraightLineMatrixService, TravelTimeMatrixService,
    WakeLockProvider, WindowHost,
};
pub use sync::{
    CrossSurfaceSync, Delivery, HostActionBridge, OverlayToSequencing, SequencingToOverlay,
    Subscription, SurfaceBus, TargetPayload,
};
