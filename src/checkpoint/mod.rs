pub mod append_log;
pub mod checkpointer;
pub mod model;
pub mod outcome;
pub mod rbatis_repository;
pub mod recoverer;
pub mod replay_fold;
pub mod repository;
pub mod runtime;
pub mod shutdown;

use std::sync::Arc;

pub use append_log::AppendLog;
pub use checkpointer::{CheckpointHealth, CheckpointLoopHandle, CheckpointPhase, Checkpointer};
pub use outcome::{
    CheckpointOutcome, CheckpointStatus, RecoveryOutcome, RecoverySource, RestoredParts,
    ShutdownReport,
};
pub use rbatis_repository::{Dialect, RbatisCheckpointRepository};
pub use recoverer::Recoverer;
pub use repository::{CheckpointRepository, StoreKind, StoreSlot};
pub use runtime::{ActiveRun, Checkpointable, RuntimeComponents, RuntimeRegistry};
pub use shutdown::{ShutdownConfig, ShutdownCoordinator};

/// 检查点子系统共享的句柄集合，各组件通过构造函数拿到同一份
#[derive(Clone)]
pub struct CheckpointContext {
    pub registry: RuntimeRegistry,
    pub store: StoreSlot,
    pub append_log: Arc<AppendLog>,
    pub active_run: ActiveRun,
}

impl CheckpointContext {
    pub fn new(registry: RuntimeRegistry, store: StoreSlot, append_log: Arc<AppendLog>) -> Self {
        Self {
            registry,
            store,
            append_log,
            active_run: ActiveRun::default(),
        }
    }
}
