// ==========================================
// 配送路线引擎 - 到达时间估算
// ==========================================
// 职责: 由站点顺序 + 耗时矩阵 + 开始时间推算每站到达时间与时间窗符合度
// 红线:
// - 纯函数: 相同输入必须得到完全相同的输出（无隐藏可变状态）
// - 矩阵缺项只跳过该段，不中断整体估算
// - 锚点参与耗时累计，不参与时间窗判定
// ==========================================

use crate::config::ArrivalConfig;
use crate::domain::hash::stable_hash;
use crate::domain::{RouteNode, TimeWindow, TravelTimeMatrix, Waypoint, WaypointKey};
use chrono::{Duration, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

// ==========================================
// 输出类型
// ==========================================

/// 到达时间标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArrivalLabel {
    /// 起点（无到达时间）
    Start,
    /// 预计到达时间
    Eta(NaiveDateTime),
    /// 无矩阵，无法估算
    Unknown,
}

impl ArrivalLabel {
    /// 显示文本: "Start" / "HH:MM" / "--"
    pub fn display(&self) -> String {
        match self {
            ArrivalLabel::Start => "Start".to_string(),
            ArrivalLabel::Eta(at) => at.format("%H:%M").to_string(),
            ArrivalLabel::Unknown => "--".to_string(),
        }
    }
}

/// 时间窗符合度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compliance {
    Ok,
    Warning,
    /// 无时间窗（或无到达时间），不做判定
    Neutral,
}

/// 单站到达估算
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalEstimate {
    pub key: WaypointKey,
    pub label: ArrivalLabel,
    pub compliance: Compliance,
}

/// 估算开始时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    Now,
    At(NaiveDateTime),
}

impl StartTime {
    /// "Now" 在调用方解析一次，估算函数本身不读时钟
    pub fn resolve(&self) -> NaiveDateTime {
        match self {
            StartTime::Now => Local::now().naive_local(),
            StartTime::At(at) => *at,
        }
    }
}

// ==========================================
// 时间窗判定
// ==========================================

/// 解析 "HH:MM" 为当日分钟数；非法输入返回 None
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let (h, m) = value.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// 判定到达分钟数是否落在时间窗内
///
/// - 仅下界: arrival >= lower
/// - 仅上界: arrival <= upper
/// - lower <= upper: lower <= arrival <= upper
/// - lower > upper (跨午夜): arrival >= lower 或 arrival <= upper
/// - 均无: Neutral
pub fn classify_window(window: &TimeWindow, arrival_minute: u32) -> Compliance {
    let lower = window.lower.as_deref().and_then(parse_hhmm);
    let upper = window.upper.as_deref().and_then(parse_hhmm);

    let compliant = match (lower, upper) {
        (None, None) => return Compliance::Neutral,
        (Some(lo), None) => arrival_minute >= lo,
        (None, Some(hi)) => arrival_minute <= hi,
        (Some(lo), Some(hi)) if lo <= hi => (lo..=hi).contains(&arrival_minute),
        (Some(lo), Some(hi)) => arrival_minute >= lo || arrival_minute <= hi,
    };

    if compliant {
        Compliance::Ok
    } else {
        Compliance::Warning
    }
}

// ==========================================
// 服务时长
// ==========================================

/// 站点服务时长（秒）
///
/// `max(min_service, override 或全局配置)` 分钟 + 确定性抖动秒数。
/// 抖动由 (地址, 0 基投递序号) 的稳定哈希得出，范围 [0, jitter_range_seconds)。
pub fn service_seconds(waypoint: &Waypoint, delivery_index: usize, config: &ArrivalConfig) -> i64 {
    let minutes = waypoint
        .service_minutes_override
        .unwrap_or(config.service_minutes)
        .max(config.min_service_minutes);
    let jitter = if config.jitter_range_seconds == 0 {
        0
    } else {
        stable_hash(&format!("{}#{}", waypoint.address, delivery_index)) % config.jitter_range_seconds
    };
    i64::from(minutes) * 60 + i64::from(jitter)
}

// ==========================================
// ArrivalTimeEstimator
// ==========================================

/// 逐站推算到达时间
///
/// 首个真实站点标记为 Start，其之前的耗时不计入。
/// 若 Start 紧跟在前导锚点之后，Start 本身不贡献服务时长。
/// 每个后续站点: 累计 prev→cur 行驶耗时，再累计上一站的服务时长。
/// 锚点在 Start 之后出现时只累计行驶耗时，不产出估算。
pub fn estimate_arrivals(
    nodes: &[RouteNode<'_>],
    matrix: Option<&TravelTimeMatrix>,
    start: NaiveDateTime,
    config: &ArrivalConfig,
) -> Vec<ArrivalEstimate> {
    let mut estimates = Vec::with_capacity(nodes.len());
    let mut elapsed_secs: i64 = 0;
    let mut prev_matrix_index: Option<usize> = None;
    let mut pending_service_secs: Option<i64> = None;
    let mut started = false;
    let mut leading_anchor = false;
    let mut delivery_index = 0usize;

    for node in nodes {
        match node {
            RouteNode::Anchor { matrix_index } => {
                if started {
                    elapsed_secs += hop_seconds(matrix, prev_matrix_index, *matrix_index);
                    elapsed_secs += pending_service_secs.take().unwrap_or(0);
                } else {
                    leading_anchor = true;
                }
                prev_matrix_index = *matrix_index;
            }
            RouteNode::Stop { waypoint, matrix_index } => {
                let index = delivery_index;
                delivery_index += 1;

                if !started {
                    started = true;
                    estimates.push(ArrivalEstimate {
                        key: waypoint.key.clone(),
                        label: ArrivalLabel::Start,
                        compliance: Compliance::Neutral,
                    });
                    pending_service_secs =
                        (!leading_anchor).then(|| service_seconds(waypoint, index, config));
                    prev_matrix_index = *matrix_index;
                    continue;
                }

                let Some(matrix) = matrix else {
                    estimates.push(ArrivalEstimate {
                        key: waypoint.key.clone(),
                        label: ArrivalLabel::Unknown,
                        compliance: Compliance::Neutral,
                    });
                    prev_matrix_index = *matrix_index;
                    continue;
                };

                elapsed_secs += hop_seconds(Some(matrix), prev_matrix_index, *matrix_index);
                elapsed_secs += pending_service_secs.take().unwrap_or(0);

                let arrival = start + Duration::seconds(elapsed_secs);
                let arrival_minute = arrival.hour() * 60 + arrival.minute();
                estimates.push(ArrivalEstimate {
                    key: waypoint.key.clone(),
                    label: ArrivalLabel::Eta(arrival),
                    compliance: classify_window(&waypoint.time_window, arrival_minute),
                });

                pending_service_secs = Some(service_seconds(waypoint, index, config));
                prev_matrix_index = *matrix_index;
            }
        }
    }

    estimates
}

/// 单段行驶耗时；缺项记录日志并按 0 处理
fn hop_seconds(matrix: Option<&TravelTimeMatrix>, from: Option<usize>, to: Option<usize>) -> i64 {
    let Some(matrix) = matrix else {
        return 0;
    };
    match from.zip(to).and_then(|(f, t)| matrix.lookup(f, t)) {
        Some(secs) => secs.round() as i64,
        None => {
            tracing::warn!("矩阵缺少路段耗时，跳过该段: from={:?}, to={:?}", from, to);
            0
        }
    }
}
