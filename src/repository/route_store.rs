// ==========================================
// 配送路线引擎 - 路线键值存储
// ==========================================
// 职责: 持久化站点序列、导航进度、悬浮窗位置
// 存储: route_kv 表 (key → JSON)
// 契约: 后写覆盖 (last-write-wins)，重复保存幂等
// ==========================================

use crate::db::open_sqlite_connection;
use crate::domain::{NavigationProgress, OverlayPhase, WaypointSequence, WindowPosition};
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// 存储键
pub mod route_keys {
    pub const SEQUENCE: &str = "sequence";
    pub const NAVIGATION_PROGRESS: &str = "navigation_progress";
    pub const OVERLAY_POSITION_PREFIX: &str = "overlay_position/";
}

// ==========================================
// RouteStore - 持久化键值存储接口
// ==========================================
/// 两个界面共享的持久化接口
///
/// 实现必须满足: 后写覆盖、保存幂等。
pub trait RouteStore: Send + Sync {
    fn save_sequence(&self, sequence: &WaypointSequence) -> RepositoryResult<()>;
    fn load_sequence(&self) -> RepositoryResult<Option<WaypointSequence>>;

    fn save_progress(&self, progress: &NavigationProgress) -> RepositoryResult<()>;
    fn load_progress(&self) -> RepositoryResult<Option<NavigationProgress>>;

    fn save_overlay_position(&self, phase: OverlayPhase, position: WindowPosition) -> RepositoryResult<()>;
    fn load_overlay_position(&self, phase: OverlayPhase) -> RepositoryResult<Option<WindowPosition>>;

    /// 显式重置时清空序列与进度
    fn clear_route(&self) -> RepositoryResult<()>;
}

// ==========================================
// SqliteRouteStore - SQLite 实现
// ==========================================
pub struct SqliteRouteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRouteStore {
    /// 打开数据库文件并确保表存在
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)
            .map_err(|e| RepositoryError::DatabaseConnectionError(e.to_string()))?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// 复用已有连接
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let store = Self { conn };
        store.ensure_table()?;
        Ok(store)
    }

    fn ensure_table(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS route_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> RepositoryResult<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO route_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, json, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!("route_kv 已写入: key={}, bytes={}", key, json.len());
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> RepositoryResult<Option<T>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM route_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn overlay_key(phase: OverlayPhase) -> String {
        format!("{}{}", route_keys::OVERLAY_POSITION_PREFIX, phase.as_str())
    }
}

impl RouteStore for SqliteRouteStore {
    fn save_sequence(&self, sequence: &WaypointSequence) -> RepositoryResult<()> {
        self.put(route_keys::SEQUENCE, sequence)
    }

    fn load_sequence(&self) -> RepositoryResult<Option<WaypointSequence>> {
        let loaded: Option<WaypointSequence> = self.get(route_keys::SEQUENCE)?;
        Ok(loaded.map(|mut seq| {
            seq.normalize();
            seq
        }))
    }

    fn save_progress(&self, progress: &NavigationProgress) -> RepositoryResult<()> {
        self.put(route_keys::NAVIGATION_PROGRESS, progress)
    }

    fn load_progress(&self) -> RepositoryResult<Option<NavigationProgress>> {
        self.get(route_keys::NAVIGATION_PROGRESS)
    }

    fn save_overlay_position(&self, phase: OverlayPhase, position: WindowPosition) -> RepositoryResult<()> {
        if !phase.is_draggable() {
            return Err(RepositoryError::ValidationError(format!(
                "阶段 {} 不保存窗口位置",
                phase
            )));
        }
        self.put(&Self::overlay_key(phase), &position)
    }

    fn load_overlay_position(&self, phase: OverlayPhase) -> RepositoryResult<Option<WindowPosition>> {
        self.get(&Self::overlay_key(phase))
    }

    fn clear_route(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM route_kv WHERE key IN (?1, ?2)",
            params![route_keys::SEQUENCE, route_keys::NAVIGATION_PROGRESS],
        )?;
        tracing::info!("路线数据已清空");
        Ok(())
    }
}
