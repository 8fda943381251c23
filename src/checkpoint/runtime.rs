//! 运行时组件接入点
//!
//! 引擎、分配器、学习器、队列各自实现 [`Checkpointable`]，
//! 由宿主进程组装成 [`RuntimeComponents`] 注册到 [`RuntimeRegistry`]。
//! 不实现该 trait 的组件直接不放入对应槽位，检查点/恢复时跳过。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::checkpoint::model::{AllocatorState, EngineState, LearnerState, QueueState};

/// 可导出/导入状态的运行时组件
#[async_trait]
pub trait Checkpointable: Send + Sync {
    type State: Send + 'static;

    /// 导出当前内存状态
    async fn export_state(&self) -> anyhow::Result<Self::State>;

    /// 用之前导出的状态覆盖内存状态
    async fn import_state(&self, state: Self::State) -> anyhow::Result<()>;
}

pub type EngineHandle = Arc<dyn Checkpointable<State = EngineState>>;
pub type AllocatorHandle = Arc<dyn Checkpointable<State = AllocatorState>>;
pub type LearnerHandle = Arc<dyn Checkpointable<State = LearnerState>>;
pub type QueueHandle = Arc<dyn Checkpointable<State = QueueState>>;

/// 一组运行时组件，任何槽位都可以为空
#[derive(Clone, Default)]
pub struct RuntimeComponents {
    pub engine: Option<EngineHandle>,
    pub allocator: Option<AllocatorHandle>,
    pub learner: Option<LearnerHandle>,
    pub queue: Option<QueueHandle>,
    /// 新建运行时写入 runs.meta（品种池、策略集合、参数等）
    pub run_meta: Value,
}

impl RuntimeComponents {
    pub fn new(run_meta: Value) -> Self {
        Self {
            run_meta,
            ..Default::default()
        }
    }

    pub fn with_engine(mut self, engine: EngineHandle) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_allocator(mut self, allocator: AllocatorHandle) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_learner(mut self, learner: LearnerHandle) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn with_queue(mut self, queue: QueueHandle) -> Self {
        self.queue = Some(queue);
        self
    }
}

/// 运行时注册表，替代全局 worker 单例，通过构造函数注入各组件
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    inner: Arc<RwLock<Option<Arc<RuntimeComponents>>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, components: RuntimeComponents) {
        *self.inner.write().await = Some(Arc::new(components));
    }

    pub async fn unregister(&self) {
        *self.inner.write().await = None;
    }

    pub async fn current(&self) -> Option<Arc<RuntimeComponents>> {
        self.inner.read().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.inner.read().await.is_some()
    }
}

/// 当前活跃运行的 id
#[derive(Clone, Default)]
pub struct ActiveRun {
    inner: Arc<RwLock<ActiveRunState>>,
}

#[derive(Debug, Clone, Default)]
struct ActiveRunState {
    run_id: Option<String>,
    /// run_id 是否只在本地生成、尚未得到关系库确认
    provisional: bool,
}

impl ActiveRun {
    pub async fn run_id(&self) -> Option<String> {
        self.inner.read().await.run_id.clone()
    }

    pub async fn is_provisional(&self) -> bool {
        self.inner.read().await.provisional
    }

    /// 采纳关系库确认过的运行 id
    pub async fn adopt(&self, run_id: &str) {
        let mut state = self.inner.write().await;
        state.run_id = Some(run_id.to_string());
        state.provisional = false;
    }

    /// 关系库不可达时给审计日志用的临时 id
    pub async fn provisional_or_current(&self) -> String {
        let mut state = self.inner.write().await;
        if let Some(id) = &state.run_id {
            return id.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.run_id = Some(id.clone());
        state.provisional = true;
        id
    }

    pub async fn clear(&self) {
        *self.inner.write().await = ActiveRunState::default();
    }
}
