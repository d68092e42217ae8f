// ==========================================
// 配送路线引擎 - 应用状态
// ==========================================
// 职责: 构造注入，装配仓储、引擎与 API 实例
// 说明: 外部协作方（矩阵服务、求解器、通知、窗口宿主等）由宿主传入
// ==========================================

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::api::{ApiResult, RouteApi};
use crate::config::{ConfigManager, EngineConfig};
use crate::db::{ensure_schema_version, open_sqlite_connection};
use crate::engine::{
    CrossSurfaceSync, LogNotificationSink, NearestNeighborSolver, NotificationSink, OptionalEventPublisher,
    OverlaySurfaceDeps, OverlaySurfaceHandle, RideHistoryStore, RouteSolver, SharedRouteState,
    SilentReoptimizer, StraightLineMatrixService, Subscription, TravelTimeMatrixService, WakeLockProvider,
    WindowHost,
};
use crate::engine::overlay_surface::start_overlay_surface;
use crate::repository::{RouteStore, SqliteRouteStore};

/// 排序相关外部协作方
#[derive(Clone)]
pub struct RoutingServices {
    pub matrix_service: Arc<dyn TravelTimeMatrixService>,
    pub solver: Arc<dyn RouteSolver>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl RoutingServices {
    /// 离线默认: 直线矩阵 + 最近邻求解 + 日志通知
    pub fn offline(config: &EngineConfig) -> Self {
        Self {
            matrix_service: Arc::new(StraightLineMatrixService::new(config.fallback_speed_kmh)),
            solver: Arc::new(NearestNeighborSolver),
            notifier: Arc::new(LogNotificationSink),
        }
    }
}

/// 悬浮窗平台协作方
#[derive(Clone)]
pub struct OverlayPlatform {
    pub window_host: Arc<dyn WindowHost>,
    pub wake_lock: Arc<dyn WakeLockProvider>,
    pub ride_history: Arc<dyn RideHistoryStore>,
}

/// 应用状态
///
/// 包含共享路线状态、仓储、后台重优化器与 API 实例。
/// 必须在 tokio 运行时内创建（重优化器为后台任务）。
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 引擎配置（默认值 + config_kv 覆写）
    pub config: EngineConfig,

    /// 排序界面 API
    pub route_api: Arc<RouteApi>,

    /// 静默重优化器
    pub reoptimizer: Arc<SilentReoptimizer>,

    /// 跨界面消息通道
    pub sync: Arc<CrossSurfaceSync>,

    /// 键值存储
    pub store: Arc<dyn RouteStore>,

    /// 配置管理
    pub config_manager: Arc<ConfigManager>,

    overlay_bridge: Subscription,
}

impl AppState {
    /// 创建新的 AppState 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    /// - services: 矩阵服务、求解器与通知
    ///
    /// # 说明
    /// 该方法会：
    /// 1. 打开共享连接并初始化表结构
    /// 2. 读取引擎配置
    /// 3. 启动静默重优化器并挂到序列事件上
    /// 4. 创建 RouteApi，恢复持久化的路线与进度
    pub fn new(db_path: String, services: RoutingServices) -> Result<Self, String> {
        let (config, config_manager, store) = Self::open(&db_path)?;
        Self::assemble(db_path, config, config_manager, store, services).map_err(|e| e.to_string())
    }

    /// 使用离线默认协作方创建（直线矩阵车速取自配置）
    pub fn with_offline_services(db_path: String) -> Result<Self, String> {
        let (config, config_manager, store) = Self::open(&db_path)?;
        let services = RoutingServices::offline(&config);
        Self::assemble(db_path, config, config_manager, store, services).map_err(|e| e.to_string())
    }

    fn open(db_path: &str) -> Result<(EngineConfig, Arc<ConfigManager>, Arc<dyn RouteStore>), String> {
        tracing::info!("初始化AppState，数据库路径: {}", db_path);

        let conn = open_sqlite_connection(db_path).map_err(|e| format!("无法打开数据库: {}", e))?;
        ensure_schema_version(&conn).map_err(|e| format!("schema_version 初始化失败: {}", e))?;
        let conn = Arc::new(Mutex::new(conn));

        let config_manager = Arc::new(
            ConfigManager::from_connection(conn.clone()).map_err(|e| format!("无法创建ConfigManager: {}", e))?,
        );
        let config = config_manager.load_engine_config().unwrap_or_else(|e| {
            tracing::warn!("引擎配置读取失败，使用默认值: {}", e);
            EngineConfig::default()
        });

        let store: Arc<dyn RouteStore> = Arc::new(
            SqliteRouteStore::from_connection(conn).map_err(|e| format!("无法创建SqliteRouteStore: {}", e))?,
        );
        Ok((config, config_manager, store))
    }

    fn assemble(
        db_path: String,
        config: EngineConfig,
        config_manager: Arc<ConfigManager>,
        store: Arc<dyn RouteStore>,
        services: RoutingServices,
    ) -> ApiResult<Self> {
        let state = SharedRouteState::default();
        let sync = CrossSurfaceSync::new();

        let reoptimizer = SilentReoptimizer::spawn(
            state.clone(),
            services.matrix_service.clone(),
            services.solver.clone(),
            services.notifier,
            Some(store.clone()),
            Some(sync.clone()),
            config.reoptimizer.clone(),
        );
        let publisher = OptionalEventPublisher::with_publisher(reoptimizer.clone());

        let route_api = Arc::new(RouteApi::new(
            state,
            store.clone(),
            publisher,
            services.matrix_service,
            services.solver,
            sync.clone(),
            config.arrival.clone(),
        ));
        route_api.load()?;
        let overlay_bridge = route_api.attach_overlay();

        tracing::info!("AppState初始化成功");
        Ok(Self {
            db_path,
            config,
            route_api,
            reoptimizer,
            sync,
            store,
            config_manager,
            overlay_bridge,
        })
    }

    /// 打开悬浮窗界面（以当前目标为初始内容）
    pub fn open_overlay(&self, platform: OverlayPlatform, resume_full: bool) -> ApiResult<OverlaySurfaceHandle> {
        let target = self.route_api.current_target()?;
        let deps = OverlaySurfaceDeps {
            window_host: platform.window_host,
            wake_lock: platform.wake_lock,
            ride_history: platform.ride_history,
            store: self.store.clone(),
            sync: self.sync.clone(),
        };
        Ok(start_overlay_surface(self.config.clone(), deps, resume_full, target))
    }

    /// 关闭: 断开悬浮窗回传并停止后台重优化
    pub async fn shutdown(self) {
        self.overlay_bridge.unsubscribe();
        self.reoptimizer.shutdown().await;
        tracing::info!("AppState已关闭");
    }
}

/// 获取默认数据库路径
///
/// 优先读取 DELIVERY_ROUTE_DB_PATH，否则放在用户数据目录下。
pub fn get_default_db_path() -> String {
    if let Ok(path) = std::env::var("DELIVERY_ROUTE_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./delivery_route.db");

    if let Some(data_dir) = dirs::data_dir() {
        #[cfg(debug_assertions)]
        {
            path = data_dir.join("delivery-route-engine-dev");
        }

        #[cfg(not(debug_assertions))]
        {
            path = data_dir.join("delivery-route-engine");
        }

        // 目录创建失败时 open 会报错，这里不阻塞
        std::fs::create_dir_all(&path).ok();
        path = path.join("delivery_route.db");
    }

    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coordinates, Waypoint};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_app_state_restores_route() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("route.db").to_string_lossy().to_string();

        let app = AppState::with_offline_services(db_path.clone()).unwrap();
        app.route_api
            .add_waypoint(Waypoint::new("A", Coordinates::new(31.0, 121.0)))
            .unwrap();
        app.route_api
            .add_waypoint(Waypoint::new("B", Coordinates::new(31.01, 121.0)))
            .unwrap();
        app.shutdown().await;

        let app = AppState::with_offline_services(db_path).unwrap();
        assert_eq!(app.route_api.summary().unwrap().total, 2);
        app.shutdown().await;
    }

    #[test]
    fn test_default_db_path_env_override() {
        std::env::set_var("DELIVERY_ROUTE_DB_PATH", " /tmp/custom.db ");
        assert_eq!(get_default_db_path(), "/tmp/custom.db");
        std::env::remove_var("DELIVERY_ROUTE_DB_PATH");
    }
}
