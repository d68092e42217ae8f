// ==========================================
// 配送路线引擎 - 跨界面同步
// ==========================================
// 职责: 排序界面 ⇄ 悬浮窗界面 的类型化消息总线
// 契约:
// - 发后即忘，最多一次；接收方未就绪时消息丢弃并记录日志，不排队不重试
// - 订阅与界面生命周期绑定（Subscription 析构即退订）
// ==========================================

use crate::domain::{Coordinates, PackageMetadata, StopAction, Waypoint, WaypointKey, WaypointSequence};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

// ==========================================
// 消息类型
// ==========================================

/// 当前目标站点（排序界面 → 悬浮窗）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPayload {
    pub address: String,
    pub coordinates: Coordinates,
    pub package: Option<PackageMetadata>,
    pub notes: Option<String>,
    pub photos: Vec<String>,
    pub favorite_name: Option<String>,
    /// 除本站外已无其他待处理站点
    pub is_last: bool,
}

impl TargetPayload {
    pub fn from_waypoint(waypoint: &Waypoint, is_last: bool) -> Self {
        Self {
            address: waypoint.address.clone(),
            coordinates: waypoint.coordinates,
            package: waypoint.package.clone(),
            notes: waypoint.notes.clone(),
            photos: waypoint.photos.clone(),
            favorite_name: waypoint.favorite_name().map(str::to_string),
            is_last,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SequencingToOverlay {
    TargetChanged(TargetPayload),
    AllStopsCompleted,
}

impl SequencingToOverlay {
    /// 由序列游标生成推送消息；无目标且仍有未完成站点时为 None
    pub fn for_sequence(sequence: &WaypointSequence) -> Option<Self> {
        match sequence.current_target() {
            Some(target) => Some(Self::TargetChanged(TargetPayload::from_waypoint(
                target,
                !sequence.has_other_pending(),
            ))),
            None if sequence.summary().all_completed() => Some(Self::AllStopsCompleted),
            None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverlayToSequencing {
    Action { action: StopAction, address: String },
    AllStopsCompleted,
}

// ==========================================
// SurfaceBus - 单向消息总线
// ==========================================

type Handler<M> = Arc<dyn Fn(M) + Send + Sync>;
type HandlerMap<M> = Mutex<HashMap<Uuid, Handler<M>>>;

/// 投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(usize),
    Dropped,
}

pub struct SurfaceBus<M> {
    name: &'static str,
    handlers: Arc<HandlerMap<M>>,
}

impl<M: Clone + Send + std::fmt::Debug + 'static> SurfaceBus<M> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 订阅；返回的 Subscription 被丢弃时自动退订
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        match self.handlers.lock() {
            Ok(mut map) => {
                map.insert(id, Arc::new(handler));
            }
            Err(e) => tracing::error!("总线订阅失败: bus={}, error={}", self.name, e),
        }
        tracing::debug!("界面已订阅: bus={}, id={}", self.name, id);

        let weak: Weak<HandlerMap<M>> = Arc::downgrade(&self.handlers);
        let name = self.name;
        Subscription {
            id,
            unsubscribe: Some(Box::new(move || {
                if let Some(handlers) = weak.upgrade() {
                    if let Ok(mut map) = handlers.lock() {
                        map.remove(&id);
                        tracing::debug!("界面已退订: bus={}, id={}", name, id);
                    }
                }
            })),
        }
    }

    /// 发布消息（同步调用处理器，处理器自行决定是否转入自己的执行上下文）
    pub fn publish(&self, message: M) -> Delivery {
        let handlers: Vec<Handler<M>> = match self.handlers.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(e) => {
                tracing::error!("总线锁获取失败: bus={}, error={}", self.name, e);
                Vec::new()
            }
        };
        if handlers.is_empty() {
            tracing::warn!("接收界面未就绪，消息已丢弃: bus={}, message={:?}", self.name, message);
            return Delivery::Dropped;
        }
        for handler in &handlers {
            handler(message.clone());
        }
        Delivery::Delivered(handlers.len())
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// 订阅句柄
pub struct Subscription {
    id: Uuid,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 显式退订（等同于 drop）
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

/// 两个方向的总线
pub struct CrossSurfaceSync {
    pub to_overlay: SurfaceBus<SequencingToOverlay>,
    pub to_sequencing: SurfaceBus<OverlayToSequencing>,
}

impl CrossSurfaceSync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            to_overlay: SurfaceBus::new("sequencing->overlay"),
            to_sequencing: SurfaceBus::new("overlay->sequencing"),
        })
    }
}

// ==========================================
// 宿主动作桥接
// ==========================================

/// 排序界面对悬浮窗动作的入站回调
pub trait HostActionBridge: Send + Sync {
    /// 地址 → 站点标识（优先匹配当前目标）
    fn resolve_address(&self, address: &str) -> Option<WaypointKey>;
    fn advance_to_next(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn mark_delivered(&self, key: &WaypointKey) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn mark_skipped(&self, key: &WaypointKey) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn all_stops_completed(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 将悬浮窗消息分派到宿主回调
pub fn dispatch_to_host(
    bridge: &dyn HostActionBridge,
    message: OverlayToSequencing,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    match message {
        OverlayToSequencing::Action { action, address } => {
            let key = bridge
                .resolve_address(&address)
                .ok_or_else(|| format!("悬浮窗动作对应的站点不存在: address={}", address))?;
            match action {
                StopAction::Done => bridge.mark_delivered(&key)?,
                StopAction::Skip => bridge.mark_skipped(&key)?,
            }
            bridge.advance_to_next()
        }
        OverlayToSequencing::AllStopsCompleted => bridge.all_stops_completed(),
    }
}

/// 排序界面就绪时挂接: 订阅悬浮窗 → 排序方向的消息
pub fn attach_host(sync: &CrossSurfaceSync, bridge: Arc<dyn HostActionBridge>) -> Subscription {
    sync.to_sequencing.subscribe(move |message| {
        if let Err(e) = dispatch_to_host(bridge.as_ref(), message) {
            tracing::warn!("悬浮窗动作处理失败: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingBridge(Mutex<Vec<String>>);

    impl HostActionBridge for RecordingBridge {
        fn resolve_address(&self, address: &str) -> Option<WaypointKey> {
            (address != "unknown").then(|| WaypointKey::from(address))
        }
        fn advance_to_next(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.lock().unwrap().push("advance".into());
            Ok(())
        }
        fn mark_delivered(&self, key: &WaypointKey) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.lock().unwrap().push(format!("delivered:{}", key));
            Ok(())
        }
        fn mark_skipped(&self, key: &WaypointKey) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.lock().unwrap().push(format!("skipped:{}", key));
            Ok(())
        }
        fn all_stops_completed(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.lock().unwrap().push("completed".into());
            Ok(())
        }
    }

    #[test]
    fn test_publish_without_subscriber_is_dropped() {
        let bus: SurfaceBus<OverlayToSequencing> = SurfaceBus::new("test");
        assert_eq!(bus.publish(OverlayToSequencing::AllStopsCompleted), Delivery::Dropped);
    }

    #[test]
    fn test_subscription_lifecycle() {
        let bus: SurfaceBus<SequencingToOverlay> = SurfaceBus::new("test");
        let received = Arc::new(Mutex::new(0usize));
        let counter = received.clone();
        let sub = bus.subscribe(move |_| *counter.lock().unwrap() += 1);

        assert_eq!(bus.publish(SequencingToOverlay::AllStopsCompleted), Delivery::Delivered(1));
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(SequencingToOverlay::AllStopsCompleted), Delivery::Dropped);
        assert_eq!(*received.lock().unwrap(), 1);
    }

    #[test]
    fn test_attach_host_dispatches_actions() {
        let sync = CrossSurfaceSync::new();
        let bridge = Arc::new(RecordingBridge::default());
        let sub = attach_host(&sync, bridge.clone());

        sync.to_sequencing.publish(OverlayToSequencing::Action {
            action: StopAction::Done,
            address: "A".into(),
        });
        sync.to_sequencing.publish(OverlayToSequencing::Action {
            action: StopAction::Skip,
            address: "unknown".into(),
        });
        sync.to_sequencing.publish(OverlayToSequencing::AllStopsCompleted);

        assert_eq!(
            *bridge.0.lock().unwrap(),
            vec!["delivered:A", "advance", "completed"]
        );
        sub.unsubscribe();
        assert_eq!(sync.to_sequencing.subscriber_count(), 0);
    }

    #[test]
    fn test_is_last_counts_pending_before_cursor() {
        use crate::domain::WaypointStatus;

        let mut seq = WaypointSequence::new();
        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            seq.add(Waypoint::new(*name, Coordinates::new(31.0 + i as f64 * 0.01, 121.0)))
                .unwrap();
        }
        let keys = seq.keys();
        seq.set_cursor(2);
        match SequencingToOverlay::for_sequence(&seq) {
            Some(SequencingToOverlay::TargetChanged(payload)) => {
                assert_eq!(payload.address, "C");
                assert!(!payload.is_last);
            }
            other => panic!("期望 TargetChanged，实际 {:?}", other),
        }

        seq.set_status(&keys[0], WaypointStatus::Delivered).unwrap();
        seq.set_status(&keys[1], WaypointStatus::Skipped).unwrap();
        match SequencingToOverlay::for_sequence(&seq) {
            Some(SequencingToOverlay::TargetChanged(payload)) => assert!(payload.is_last),
            other => panic!("期望 TargetChanged，实际 {:?}", other),
        }

        seq.set_status(&keys[2], WaypointStatus::Delivered).unwrap();
        seq.advance_cursor();
        assert_eq!(
            SequencingToOverlay::for_sequence(&seq),
            Some(SequencingToOverlay::AllStopsCompleted)
        );
        assert_eq!(SequencingToOverlay::for_sequence(&WaypointSequence::new()), None);
    }

    #[test]
    fn test_message_wire_shape() {
        let json = serde_json::to_value(OverlayToSequencing::Action {
            action: StopAction::Skip,
            address: "A".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "action");
        assert_eq!(json["action"], "skip");
    }
}
