//! 启动恢复测试

mod common;

use std::time::Duration;

use rust_quant_checkpoint::checkpoint::{
    Checkpointer, RecoveryOutcome, RecoverySource, Recoverer, RuntimeRegistry, StoreKind,
    StoreSlot,
};

use common::{context_in, store_with, test_config, FakeRuntime, InMemoryRepository};

/// 关系库中有运行时优先从库恢复，学习器模型字节完整
#[tokio::test]
async fn test_store_first_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let repo = InMemoryRepository::new();

    let source = FakeRuntime::populated();
    let registry = RuntimeRegistry::new();
    registry.register(source.components()).await;
    let ctx = context_in(dir.path(), registry, store_with(repo.clone())).await;
    let run_id = Checkpointer::new(ctx)
        .run_cycle()
        .await
        .run_id()
        .map(str::to_string)
        .unwrap();

    // 重启后的空运行时
    let target = FakeRuntime::empty();
    let registry = RuntimeRegistry::new();
    registry.register(target.components()).await;
    let ctx = context_in(dir.path(), registry, store_with(repo.clone())).await;
    let recoverer = Recoverer::new(ctx.clone(), test_config(dir.path()));

    match recoverer.boot().await {
        RecoveryOutcome::Restored {
            source: RecoverySource::Store,
            run_id: restored_run,
            restored,
        } => {
            assert_eq!(restored_run, run_id);
            assert_eq!(restored.positions, 2);
            assert_eq!(restored.equity_points, 3);
            assert!(restored.learner_model);
            assert!(restored.allocator && restored.queue);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let engine = target.engine.state().unwrap();
    assert_eq!(engine.positions.len(), 2);
    assert_eq!(engine.equity_curve, source.engine.state().unwrap().equity_curve);
    assert_eq!(target.learner.state().unwrap().model, Some(vec![7, 7, 7, 7]));
    assert_eq!(target.allocator.state(), source.allocator.state());
    assert_eq!(target.queue.state(), source.queue.state());
    // 未结束的运行被继续使用
    assert_eq!(ctx.active_run.run_id().await.as_deref(), Some(run_id.as_str()));
}

/// 关系库里什么都没有时回放追加日志，结果与库恢复一致（模型字节除外）
#[tokio::test]
async fn test_replay_fallback_matches_snapshot() {
    let dir = tempfile::tempdir().unwrap();

    let source = FakeRuntime::populated();
    let registry = RuntimeRegistry::new();
    registry.register(source.components()).await;
    let ctx = context_in(dir.path(), registry, StoreSlot::new()).await;
    Checkpointer::new(ctx).run_cycle().await;

    let target = FakeRuntime::empty();
    let registry = RuntimeRegistry::new();
    registry.register(target.components()).await;
    // 未配置主库，启动时打开空的 SQLite 兜底库
    let ctx = context_in(dir.path(), registry, StoreSlot::new()).await;
    let recoverer = Recoverer::new(ctx.clone(), test_config(dir.path()));

    let outcome = recoverer.boot().await;
    assert_eq!(ctx.store.kind().await, Some(StoreKind::Fallback));
    match outcome {
        RecoveryOutcome::Restored {
            source: RecoverySource::AppendLog,
            restored,
            ..
        } => {
            assert_eq!(restored.positions, 2);
            assert!(restored.learner);
            assert!(!restored.learner_model);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let expected = source.engine.state().unwrap();
    let engine = target.engine.state().unwrap();
    assert_eq!(engine.positions, expected.positions);
    assert_eq!(engine.equity_curve, expected.equity_curve);
    assert!(engine.trades.is_empty());
    assert_eq!(target.allocator.state(), source.allocator.state());
    assert_eq!(target.queue.state(), source.queue.state());

    let learner = target.learner.state().unwrap();
    assert_eq!(learner.algo, "sgd");
    assert_eq!(learner.meta, source.learner.state().unwrap().meta);
    assert!(learner.model.is_none());
}

#[tokio::test]
async fn test_cold_start_without_history() {
    let dir = tempfile::tempdir().unwrap();
    let target = FakeRuntime::empty();
    let registry = RuntimeRegistry::new();
    registry.register(target.components()).await;
    let repo = InMemoryRepository::new();
    let ctx = context_in(dir.path(), registry, store_with(repo)).await;

    let outcome = Recoverer::new(ctx, test_config(dir.path())).boot().await;
    assert_eq!(outcome, RecoveryOutcome::ColdStart);
    assert_eq!(target.engine.import_count(), 0);
}

#[tokio::test]
async fn test_resume_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let target = FakeRuntime::empty();
    let registry = RuntimeRegistry::new();
    registry.register(target.components()).await;
    let ctx = context_in(dir.path(), registry, StoreSlot::new()).await;

    let mut config = test_config(dir.path());
    config.resume_on_boot = false;
    let outcome = Recoverer::new(ctx.clone(), config).boot().await;

    assert_eq!(outcome, RecoveryOutcome::Disabled);
    // 仓储照常连接
    assert!(ctx.store.is_connected().await);
    assert_eq!(target.engine.import_count(), 0);
}

/// 组件晚于启动注册时，后台任务等到后再恢复
#[tokio::test]
async fn test_deferred_recovery_after_late_registration() {
    let dir = tempfile::tempdir().unwrap();
    let repo = InMemoryRepository::new();

    let source = FakeRuntime::populated();
    let registry = RuntimeRegistry::new();
    registry.register(source.components()).await;
    let ctx = context_in(dir.path(), registry, store_with(repo.clone())).await;
    Checkpointer::new(ctx).run_cycle().await;

    let registry = RuntimeRegistry::new();
    let ctx = context_in(dir.path(), registry.clone(), store_with(repo.clone())).await;
    let recoverer = Recoverer::new(ctx, test_config(dir.path()));
    assert_eq!(recoverer.boot().await, RecoveryOutcome::Deferred);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let target = FakeRuntime::empty();
    registry.register(target.components()).await;

    let outcome = recoverer.join_pending().await.unwrap();
    assert!(outcome.is_restored());
    assert_eq!(target.engine.state().unwrap().positions.len(), 2);
    assert!(recoverer.join_pending().await.is_none());
}

#[tokio::test]
async fn test_deferred_recovery_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context_in(
        dir.path(),
        RuntimeRegistry::new(),
        store_with(InMemoryRepository::new()),
    )
    .await;
    let mut config = test_config(dir.path());
    config.recovery_wait_attempts = 3;
    config.recovery_wait_interval = Duration::from_millis(10);

    let recoverer = Recoverer::new(ctx, config);
    assert_eq!(recoverer.boot().await, RecoveryOutcome::Deferred);
    assert_eq!(recoverer.join_pending().await, Some(RecoveryOutcome::ColdStart));
}

#[tokio::test]
async fn test_shutdown_cancels_pending_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context_in(
        dir.path(),
        RuntimeRegistry::new(),
        store_with(InMemoryRepository::new()),
    )
    .await;
    let mut config = test_config(dir.path());
    config.recovery_wait_attempts = 10_000;
    config.recovery_wait_interval = Duration::from_secs(1);

    let recoverer = Recoverer::new(ctx, config);
    assert_eq!(recoverer.boot().await, RecoveryOutcome::Deferred);
    tokio::time::timeout(Duration::from_secs(2), recoverer.shutdown())
        .await
        .unwrap();
    assert!(recoverer.join_pending().await.is_none());
}
