// ==========================================
// 配送路线引擎 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::engine_config::EngineConfig;
use crate::db::open_sqlite_connection;
use rusqlite::{params, Connection};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// 配置键
// ==========================================
pub mod config_keys {
    pub const SERVICE_MINUTES: &str = "arrival/service_minutes";
    pub const MIN_SERVICE_MINUTES: &str = "arrival/min_service_minutes";
    pub const JITTER_RANGE_SECONDS: &str = "arrival/jitter_range_seconds";
    pub const DEBOUNCE_MS: &str = "reoptimizer/debounce_ms";
    pub const PROXIMITY_THRESHOLD_M: &str = "overlay/proximity_threshold_m";
    pub const INACTIVITY_SECS: &str = "overlay/inactivity_secs";
    pub const COMPLETION_TIMEOUT_SECS: &str = "overlay/completion_timeout_secs";
    pub const SAFE_AREA: &str = "overlay/safe_area";
    pub const MAX_ACCURACY_M: &str = "proximity/max_accuracy_m";
    pub const MIN_INTERVAL_SECS: &str = "proximity/min_interval_secs";
    pub const MIN_DISPLACEMENT_M: &str = "proximity/min_displacement_m";
    pub const SEGMENT_GAP_SECS: &str = "proximity/segment_gap_secs";
    pub const FALLBACK_SPEED_KMH: &str = "matrix/fallback_speed_kmh";
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, Box<dyn Error>> {
        let conn = open_sqlite_connection(db_path)?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：会对传入连接再次应用统一 PRAGMA（幂等），并确保 config_kv 表存在。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, Box<dyn Error>> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
            conn_guard.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS config_kv (
                    scope_id TEXT NOT NULL DEFAULT 'global',
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (scope_id, key)
                );
                "#,
            )?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 配置（UPSERT）
    pub fn set_config_value(&self, key: &str, value: &str) -> Result<(), Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        tracing::info!("配置已更新: {}={}", key, value);
        Ok(())
    }

    /// 获取所有配置的快照（JSON格式）
    pub fn get_config_snapshot(&self) -> Result<String, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key",
        )?;

        let mut config_map: HashMap<String, String> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        Ok(serde_json::to_string(&json!(config_map))?)
    }

    /// 读取并解析数值配置；缺失返回默认值，格式错误告警后返回默认值
    fn get_parsed_or<T>(&self, key: &str, default: T) -> Result<T, Box<dyn Error>>
    where
        T: FromStr + Copy + std::fmt::Display,
    {
        match self.get_config_value(key)? {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!("配置格式错误，使用默认值: key={}, value={}, default={}", key, raw, default);
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// 加载引擎配置（默认值 + config_kv 覆写）
    pub fn load_engine_config(&self) -> Result<EngineConfig, Box<dyn Error>> {
        let mut config = EngineConfig::default();

        // ===== 到达时间估算 =====
        config.arrival.service_minutes =
            self.get_parsed_or(config_keys::SERVICE_MINUTES, config.arrival.service_minutes)?;
        config.arrival.min_service_minutes = self.get_parsed_or(
            config_keys::MIN_SERVICE_MINUTES,
            config.arrival.min_service_minutes,
        )?;
        config.arrival.jitter_range_seconds = self.get_parsed_or(
            config_keys::JITTER_RANGE_SECONDS,
            config.arrival.jitter_range_seconds,
        )?;

        // ===== 静默重优化 =====
        config.reoptimizer.debounce_ms =
            self.get_parsed_or(config_keys::DEBOUNCE_MS, config.reoptimizer.debounce_ms)?;

        // ===== 悬浮窗 =====
        config.overlay.proximity_threshold_m = self.get_parsed_or(
            config_keys::PROXIMITY_THRESHOLD_M,
            config.overlay.proximity_threshold_m,
        )?;
        config.overlay.inactivity_secs =
            self.get_parsed_or(config_keys::INACTIVITY_SECS, config.overlay.inactivity_secs)?;
        config.overlay.completion_timeout_secs = self.get_parsed_or(
            config_keys::COMPLETION_TIMEOUT_SECS,
            config.overlay.completion_timeout_secs,
        )?;
        if let Some(raw) = self.get_config_value(config_keys::SAFE_AREA)? {
            match serde_json::from_str(&raw) {
                Ok(area) => config.overlay.safe_area = area,
                Err(e) => tracing::warn!("安全区配置格式错误，使用默认值: {}", e),
            }
        }

        // ===== 定位过滤 =====
        config.proximity.max_accuracy_m =
            self.get_parsed_or(config_keys::MAX_ACCURACY_M, config.proximity.max_accuracy_m)?;
        config.proximity.min_interval_secs = self.get_parsed_or(
            config_keys::MIN_INTERVAL_SECS,
            config.proximity.min_interval_secs,
        )?;
        config.proximity.min_displacement_m = self.get_parsed_or(
            config_keys::MIN_DISPLACEMENT_M,
            config.proximity.min_displacement_m,
        )?;
        config.proximity.segment_gap_secs = self.get_parsed_or(
            config_keys::SEGMENT_GAP_SECS,
            config.proximity.segment_gap_secs,
        )?;

        config.fallback_speed_kmh =
            self.get_parsed_or(config_keys::FALLBACK_SPEED_KMH, config.fallback_speed_kmh)?;

        Ok(config)
    }
}
