// ==========================================
// 配送路线引擎 - 命令行入口
// ==========================================
// 用法:
//   delivery-route-engine [stops.json] [--optimize] [--reset]
// stops.json: [{ "address": "...", "lat": 31.2, "lng": 121.4,
//                "window_start": "09:00", "window_end": "10:00", "service_minutes": 5 }]
// 输出: 当前序列的到达估算（JSON）
// ==========================================

use anyhow::{Context, Result};
use delivery_route_engine::app::{get_default_db_path, AppState};
use delivery_route_engine::domain::{Coordinates, Waypoint};
use delivery_route_engine::engine::StartTime;
use delivery_route_engine::logging;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct StopInput {
    address: String,
    lat: f64,
    lng: f64,
    #[serde(default)]
    window_start: Option<String>,
    #[serde(default)]
    window_end: Option<String>,
    #[serde(default)]
    service_minutes: Option<u32>,
}

impl StopInput {
    fn into_waypoint(self) -> Waypoint {
        let mut waypoint = Waypoint::new(self.address, Coordinates::new(self.lat, self.lng))
            .with_time_window(self.window_start.as_deref(), self.window_end.as_deref());
        if let Some(minutes) = self.service_minutes {
            waypoint = waypoint.with_service_minutes(minutes);
        }
        waypoint
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("DELIVERY_ROUTE_LOG_FORMAT").as_deref() == Ok("json") {
        logging::init_json();
    } else {
        logging::init();
    }

    tracing::info!("==================================================");
    tracing::info!("{} v{}", delivery_route_engine::APP_NAME, delivery_route_engine::VERSION);
    tracing::info!("==================================================");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let optimize = args.iter().any(|a| a == "--optimize");
    let reset = args.iter().any(|a| a == "--reset");
    let stops_file = args.iter().find(|a| !a.starts_with("--"));

    let db_path = get_default_db_path();
    tracing::info!("使用数据库: {}", db_path);
    let app = AppState::with_offline_services(db_path).map_err(anyhow::Error::msg)?;
    let api = app.route_api.clone();

    if reset {
        api.reset()?;
    }

    if let Some(path) = stops_file {
        let raw = std::fs::read_to_string(path).with_context(|| format!("读取站点文件失败: {}", path))?;
        let stops: Vec<StopInput> = serde_json::from_str(&raw).context("站点文件格式错误")?;
        for stop in stops {
            let waypoint = stop.into_waypoint();
            let address = waypoint.address.clone();
            if let Err(e) = api.add_waypoint(waypoint) {
                tracing::warn!("站点未添加: address={}, error={}", address, e);
            }
        }
    }

    if optimize {
        api.optimize().await?;
    } else {
        api.refresh_matrix().await?;
    }

    let sequence = api.sequence()?;
    let estimates = api.estimate_arrivals(StartTime::Now)?;
    let rows: Vec<_> = sequence
        .waypoints()
        .iter()
        .zip(estimates.iter())
        .map(|(w, e)| {
            json!({
                "order": w.order_index,
                "address": w.address,
                "status": w.status,
                "arrival": e.label.display(),
                "compliance": e.compliance,
            })
        })
        .collect();

    let summary = api.summary()?;
    let next = api.current_target()?;
    let report = json!({
        "optimized": sequence.is_optimized(),
        "summary": summary,
        "next": next.as_ref().map(|t| t.address.clone()),
        "stops": rows,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    app.shutdown().await;
    Ok(())
}
