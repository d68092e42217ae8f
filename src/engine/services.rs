// ==========================================
// 配送路线引擎 - 外部协作方接口
// ==========================================
// 职责: 定义引擎依赖的外部服务 trait（依赖倒置）
// - 通行时间矩阵服务 / 路线求解器 (异步)
// - 骑行历史、通知、保持唤醒、窗口宿主 (同步)
// 说明: 引擎只依赖 trait，具体实现由 app 层注入
// ==========================================

use crate::domain::{haversine_m, Coordinates, MatrixIndex, TravelTimeMatrix, WaypointKey};
use async_trait::async_trait;
use thiserror::Error;

/// 外部协作方错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("矩阵服务请求失败: {0}")]
    MatrixUnavailable(String),

    #[error("路线求解失败: {0}")]
    SolverFailed(String),

    #[error("外部请求超时: {0}")]
    Timeout(String),

    #[error("窗口已分离: {0}")]
    WindowDetached(String),

    #[error("协作方调用失败: {0}")]
    Collaborator(String),
}

impl ServiceError {
    /// 可安全忽略的良性错误（窗口已被拆除）
    pub fn is_benign(&self) -> bool {
        matches!(self, ServiceError::WindowDetached(_))
    }
}

/// Result 类型别名
pub type ServiceResult<T> = Result<T, ServiceError>;

// ==========================================
// 通行时间矩阵服务
// ==========================================
/// 请求: 有序坐标列表；响应: 按请求下标寻址的 `durations`
#[async_trait]
pub trait TravelTimeMatrixService: Send + Sync {
    async fn fetch_matrix(&self, locations: &[Coordinates]) -> ServiceResult<TravelTimeMatrix>;
}

/// 求解请求
#[derive(Debug, Clone)]
pub struct SolveRequest {
    /// 参与求解的站点（请求时的顺序）
    pub keys: Vec<WaypointKey>,
    /// 站点到矩阵下标的映射（含"当前位置"锚点）
    pub index: MatrixIndex,
}

// ==========================================
// 路线求解器
// ==========================================
/// 返回 `request.keys` 的一个排列，作为新的访问顺序
#[async_trait]
pub trait RouteSolver: Send + Sync {
    async fn solve(&self, request: &SolveRequest, matrix: &TravelTimeMatrix) -> ServiceResult<Vec<WaypointKey>>;
}

// ==========================================
// 骑行历史（外部存储，接口不在此重新定义语义）
// ==========================================
pub trait RideHistoryStore: Send + Sync {
    fn add_track_point(&self, lat: f64, lng: f64, accuracy_m: f64, timestamp_ms: i64, segment: u32) -> ServiceResult<()>;
    fn update_distance(&self, total_meters: f64) -> ServiceResult<()>;
    fn check_stop_proximity(&self, lat: f64, lng: f64, timestamp_ms: i64) -> ServiceResult<()>;
    fn current_ride_id(&self) -> Option<String>;
}

/// 非致命通知（如后台重优化失败）
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// "保持处理器唤醒" 锁
pub trait WakeLockProvider: Send + Sync {
    fn acquire(&self) -> ServiceResult<()>;
    fn release(&self) -> ServiceResult<()>;
}

/// 悬浮窗宿主（原生窗口的增删改）
pub trait WindowHost: Send + Sync {
    fn show(&self, phase: crate::domain::OverlayPhase, x: f64, y: f64) -> ServiceResult<()>;
    /// 已分离的窗口返回 `ServiceError::WindowDetached`
    fn remove(&self) -> ServiceResult<()>;
}

// ==========================================
// 通知: 仅写日志
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, message: &str) {
        tracing::warn!("通知: {}", message);
    }
}

// ==========================================
// StraightLineMatrixService - 直线距离估算矩阵
// ==========================================
/// 未配置网络矩阵服务时的兜底实现: haversine 距离 / 固定车速
#[derive(Debug, Clone)]
pub struct StraightLineMatrixService {
    speed_kmh: f64,
}

impl StraightLineMatrixService {
    pub fn new(speed_kmh: f64) -> Self {
        Self { speed_kmh }
    }

    pub fn compute(&self, locations: &[Coordinates]) -> ServiceResult<TravelTimeMatrix> {
        if !(self.speed_kmh.is_finite() && self.speed_kmh > 0.0) {
            return Err(ServiceError::MatrixUnavailable(format!(
                "车速配置无效: {}",
                self.speed_kmh
            )));
        }
        let meters_per_second = self.speed_kmh * 1000.0 / 3600.0;
        let durations = locations
            .iter()
            .map(|from| {
                locations
                    .iter()
                    .map(|to| Some((haversine_m(from, to) / meters_per_second).round()))
                    .collect()
            })
            .collect();
        Ok(TravelTimeMatrix::new(durations))
    }
}

#[async_trait]
impl TravelTimeMatrixService for StraightLineMatrixService {
    async fn fetch_matrix(&self, locations: &[Coordinates]) -> ServiceResult<TravelTimeMatrix> {
        self.compute(locations)
    }
}

// ==========================================
// NearestNeighborSolver - 最近邻贪心求解
// ==========================================
/// 本地兜底求解器: 从锚点（或首站）出发，每次走向耗时最短的未访问站点
///
/// 缺失的矩阵单元视为不可达（排在最后）。
#[derive(Debug, Clone, Default)]
pub struct NearestNeighborSolver;

#[async_trait]
impl RouteSolver for NearestNeighborSolver {
    async fn solve(&self, request: &SolveRequest, matrix: &TravelTimeMatrix) -> ServiceResult<Vec<WaypointKey>> {
        let mut remaining: Vec<&WaypointKey> = request.keys.iter().collect();
        let mut order = Vec::with_capacity(remaining.len());

        let mut current = match request.index.anchor {
            Some(anchor) => Some(anchor),
            None if !remaining.is_empty() => {
                let first = remaining.remove(0);
                order.push(first.clone());
                request.index.stop_index(first)
            }
            None => None,
        };

        while !remaining.is_empty() {
            let best = remaining
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let cost = |k: &WaypointKey| {
                        current
                            .zip(request.index.stop_index(k))
                            .and_then(|(from, to)| matrix.lookup(from, to))
                            .unwrap_or(f64::INFINITY)
                    };
                    cost(**a).total_cmp(&cost(**b))
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            let next = remaining.remove(best);
            current = request.index.stop_index(next);
            order.push(next.clone());
        }
        Ok(order)
    }
}
