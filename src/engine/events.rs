// ==========================================
// 配送路线引擎 - 序列变更事件发布
// ==========================================
// 职责: 定义序列变更事件与发布 trait，实现依赖倒置
// 说明: 序列入口层发布事件，静默重优化器实现订阅
// ==========================================

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

// ==========================================
// 序列事件类型
// ==========================================

/// 序列变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceEventKind {
    /// 新增站点
    Added,
    /// 删除站点
    Removed,
    /// 手动调整顺序
    Reordered,
    /// 站点状态变更（送达/跳过）
    StatusChanged,
    /// 显式重置
    Cleared,
    /// 显式优化完成
    Optimized,
}

impl SequenceEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            SequenceEventKind::Added => "Added",
            SequenceEventKind::Removed => "Removed",
            SequenceEventKind::Reordered => "Reordered",
            SequenceEventKind::StatusChanged => "StatusChanged",
            SequenceEventKind::Cleared => "Cleared",
            SequenceEventKind::Optimized => "Optimized",
        }
    }

    /// 是否改变了站点集合或顺序
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SequenceEventKind::Added | SequenceEventKind::Removed | SequenceEventKind::Reordered
        )
    }
}

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOrigin {
    /// 用户操作（添加/删除/拖拽）
    User,
    /// 显式"优化"动作
    ExplicitOptimize,
    /// 后台静默重优化结果
    SilentReoptimize,
}

/// 序列事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub kind: SequenceEventKind,
    pub origin: MutationOrigin,
    /// 事件发生后序列的 optimized 标志
    pub optimized: bool,
    /// 事件发生后序列的 revision
    pub revision: u64,
}

impl SequenceEvent {
    pub fn user(kind: SequenceEventKind, optimized: bool, revision: u64) -> Self {
        Self {
            kind,
            origin: MutationOrigin::User,
            optimized,
            revision,
        }
    }

    /// 是否应触发静默重优化
    ///
    /// 仅当: 结构性变更 + 序列已优化 + 非显式优化/重优化自身产生
    pub fn triggers_reoptimize(&self) -> bool {
        self.kind.is_structural() && self.optimized && self.origin == MutationOrigin::User
    }
}

// ==========================================
// 事件发布 Trait
// ==========================================

/// 序列事件发布者 Trait
///
/// 返回值: `Ok(())` 表示已接收，`Err` 表示发布失败（调用方仅记录日志）
pub trait SequenceEventPublisher: Send + Sync {
    fn publish(&self, event: SequenceEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 空操作事件发布者
///
/// 用于不需要事件发布的场景（如单元测试）
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

impl SequenceEventPublisher for NoOpEventPublisher {
    fn publish(&self, event: SequenceEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            "NoOpEventPublisher: 跳过事件发布 - kind={}, revision={}",
            event.kind.as_str(),
            event.revision
        );
        Ok(())
    }
}

/// 可选的事件发布者包装
///
/// 简化 Option<Arc<dyn SequenceEventPublisher>> 的使用
#[derive(Clone)]
pub struct OptionalEventPublisher {
    inner: Option<Arc<dyn SequenceEventPublisher>>,
}

impl OptionalEventPublisher {
    pub fn with_publisher(publisher: Arc<dyn SequenceEventPublisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    /// 发布事件（失败只记录，不向上传播）
    pub fn publish(&self, event: SequenceEvent) {
        match &self.inner {
            Some(publisher) => {
                if let Err(e) = publisher.publish(event.clone()) {
                    tracing::warn!("序列事件发布失败: kind={}, error={}", event.kind.as_str(), e);
                }
            }
            None => {
                tracing::debug!(
                    "OptionalEventPublisher: 未配置发布者，跳过事件 - kind={}",
                    event.kind.as_str()
                );
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

impl Default for OptionalEventPublisher {
    fn default() -> Self {
        Self::none()
    }
}
