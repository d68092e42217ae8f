// ==========================================
// 静默重优化集成测试
// ==========================================
// 覆盖: 连续变更合并为一次请求、失败保留原状态、重置取消、显式优化后旧结果作废
// ==========================================


use delivery_route_engine::app::AppState;
use delivery_route_engine::domain::{Coordinates, Waypoint};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;
use test_helpers::*;

async fn optimized_app(fixture: &RoutingFixture) -> (tempfile::NamedTempFile, AppState) {
    let (tmp, db_path) = create_test_db().unwrap();
    let app = AppState::new(db_path, fixture.services()).unwrap();
    for wp in city_stops() {
        app.route_api.add_waypoint(wp).unwrap();
    }
    app.route_api.optimize().await.unwrap();
    assert_eq!(fixture.matrix.calls(), 1);
    (tmp, app)
}

fn extra_stop(i: usize) -> Waypoint {
    Waypoint::new(format!("{} Late Rd", i), Coordinates::new(31.21 + i as f64 * 0.002, 121.45))
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_mutations_sends_one_request() {
    let fixture = RoutingFixture::new();
    let (_tmp, app) = optimized_app(&fixture).await;

    for i in 0..3 {
        app.route_api.add_waypoint(extra_stop(i)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = app.reoptimizer.stats();
    assert_eq!(stats.triggers, 3);
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.coalesced, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(fixture.matrix.calls(), 2);

    let sequence = app.route_api.sequence().unwrap();
    assert!(sequence.is_optimized());
    assert_eq!(sequence.len(), 7);
    let unique: HashSet<_> = sequence.keys().into_iter().collect();
    assert_eq!(unique.len(), 7);
    sequence.check_invariants().unwrap();

    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_order_and_notifies() {
    let fixture = RoutingFixture::new();
    let (_tmp, app) = optimized_app(&fixture).await;

    fixture.solver.fail.store(true, Ordering::SeqCst);
    let keys_before_removal = app.route_api.sequence().unwrap().keys();
    app.route_api.remove_waypoint(&keys_before_removal[1]).unwrap();
    let after_removal = app.route_api.sequence().unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = app.reoptimizer.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(fixture.notifier.messages.lock().unwrap().len(), 1);

    let sequence = app.route_api.sequence().unwrap();
    assert_eq!(sequence.keys(), after_removal.keys());
    assert!(sequence.is_optimized());

    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_cancels_pending_request() {
    let fixture = RoutingFixture::new();
    let (_tmp, app) = optimized_app(&fixture).await;

    app.route_api.add_waypoint(extra_stop(0)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    app.route_api.reset().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(app.reoptimizer.stats().requests, 0);
    assert_eq!(fixture.matrix.calls(), 1);
    assert!(app.route_api.sequence().unwrap().is_empty());

    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_explicit_optimize_supersedes_in_flight_request() {
    let fixture = RoutingFixture::new();
    let (_tmp, app) = optimized_app(&fixture).await;

    fixture.matrix.delay_ms.store(1_000, Ordering::SeqCst);
    app.route_api.add_waypoint(extra_stop(0)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(app.reoptimizer.stats().requests, 1);
    assert_eq!(fixture.matrix.calls(), 2);

    // 后台请求在途时显式优化先完成
    fixture.matrix.delay_ms.store(0, Ordering::SeqCst);
    app.route_api.optimize().await.unwrap();
    let explicit = app.route_api.sequence().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = app.reoptimizer.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.applied, 0);
    let sequence = app.route_api.sequence().unwrap();
    assert_eq!(sequence.keys(), explicit.keys());
    assert_eq!(sequence.revision(), explicit.revision());

    app.shutdown().await;
}
