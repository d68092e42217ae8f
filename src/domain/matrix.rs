// ==========================================
// 配送路线引擎 - 通行时间矩阵
// ==========================================
// 职责: 按请求位置列表下标寻址的耗时表（秒）
// 说明: 每次估算/优化请求临时创建，用完即弃，不持久化
// ==========================================

use crate::domain::waypoint::{Waypoint, WaypointKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ==========================================
// TravelTimeMatrix - 耗时矩阵
// ==========================================
/// 外部矩阵服务响应 `{ "durations": number[][] }`
///
/// 单元格允许为 null（服务端无法计算该段时返回）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TravelTimeMatrix {
    pub durations: Vec<Vec<Option<f64>>>,
}

impl TravelTimeMatrix {
    pub fn new(durations: Vec<Vec<Option<f64>>>) -> Self {
        Self { durations }
    }

    /// 由全量秒数表构造
    pub fn from_seconds(durations: Vec<Vec<f64>>) -> Self {
        Self {
            durations: durations
                .into_iter()
                .map(|row| row.into_iter().map(Some).collect())
                .collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.durations.len()
    }

    /// 查找 from → to 的耗时；越界、null、非有限值、负值均视为缺失
    pub fn lookup(&self, from: usize, to: usize) -> Option<f64> {
        self.durations
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .flatten()
            .filter(|v| v.is_finite() && *v >= 0.0)
    }
}

// ==========================================
// RouteNode - 估算输入节点
// ==========================================
/// 路线节点：锚点（如"当前位置"）或真实站点
///
/// 锚点参与耗时累计，但不参与时间窗判定，也不产出到达估算。
#[derive(Debug, Clone, Copy)]
pub enum RouteNode<'a> {
    Anchor { matrix_index: Option<usize> },
    Stop { waypoint: &'a Waypoint, matrix_index: Option<usize> },
}

impl<'a> RouteNode<'a> {
    pub fn matrix_index(&self) -> Option<usize> {
        match self {
            RouteNode::Anchor { matrix_index } => *matrix_index,
            RouteNode::Stop { matrix_index, .. } => *matrix_index,
        }
    }

    pub fn is_anchor(&self) -> bool {
        matches!(self, RouteNode::Anchor { .. })
    }
}

// ==========================================
// MatrixIndex - 站点到矩阵下标的映射
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixIndex {
    /// "当前位置" 锚点所在下标（无锚点时为 None）
    pub anchor: Option<usize>,
    pub stops: HashMap<WaypointKey, usize>,
}

impl MatrixIndex {
    /// 请求位置列表布局: [锚点?] + 站点（按给定顺序）
    pub fn for_request(with_anchor: bool, keys: &[WaypointKey]) -> Self {
        let offset = usize::from(with_anchor);
        Self {
            anchor: with_anchor.then_some(0),
            stops: keys
                .iter()
                .enumerate()
                .map(|(i, k)| (k.clone(), i + offset))
                .collect(),
        }
    }

    pub fn stop_index(&self, key: &WaypointKey) -> Option<usize> {
        self.stops.get(key).copied()
    }

    /// 按站点当前顺序构建估算节点（锚点位于首位）
    pub fn route_nodes<'a>(&self, waypoints: &'a [Waypoint]) -> Vec<RouteNode<'a>> {
        let mut nodes = Vec::with_capacity(waypoints.len() + 1);
        if let Some(anchor) = self.anchor {
            nodes.push(RouteNode::Anchor {
                matrix_index: Some(anchor),
            });
        }
        nodes.extend(waypoints.iter().map(|w| RouteNode::Stop {
            waypoint: w,
            matrix_index: self.stop_index(&w.key),
        }));
        nodes
    }
}
