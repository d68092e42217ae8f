// ==========================================
// 配送路线引擎 - 领域模型层
// ==========================================
// 职责: 定义领域实体、值对象、基础类型
// 红线: 不含持久化逻辑, 不含异步/定时器逻辑
// ==========================================

pub mod geo;
pub mod hash;
pub mod matrix;
pub mod progress;
pub mod sequence;
pub mod types;
pub mod waypoint;

// 重导出核心类型
pub use geo::{format_distance, haversine_m, Coordinates};
pub use matrix::{MatrixIndex, RouteNode, TravelTimeMatrix};
pub use progress::NavigationProgress;
pub use sequence::{SequenceError, SequenceSummary, WaypointSequence};
pub use types::{DeliveryType, OverlayPhase, StopAction, WaypointStatus, WindowPosition};
pub use waypoint::{
    PackageMetadata, PackageSize, TimeWindow, VehiclePosition, VehicleSide, Waypoint, WaypointKey,
};
