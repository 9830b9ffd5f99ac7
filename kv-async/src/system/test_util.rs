use std::sync::Arc;

use crate::{
    engine::mem::MemEngine, metrics::MetricsStorage, AsyncConfig, Error, Subsystem,
    SubsystemHandle,
};

use super::lifecycle::StartTesting;

pub(super) mod recorder;

pub(crate) const KV: &str = "table:kv";
pub(crate) const RECNO: &str = "table:recno";

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A subsystem over a fresh [`MemEngine`] with a `"S"/"S"` table at [`KV`] and
/// a record-number table at [`RECNO`], counting into private metrics.
pub(crate) struct TestSystem {
    pub(crate) engine: MemEngine,
    pub(crate) handle: SubsystemHandle,
    pub(crate) metrics: &'static MetricsStorage,
}

impl TestSystem {
    pub(crate) fn start(worker_count: usize) -> Self {
        Self::start_with_testing(
            AsyncConfig {
                worker_count,
                ..AsyncConfig::default()
            },
            None,
        )
        .unwrap_or_else(|(e, _)| panic!("start failed: {e}"))
    }

    pub(crate) fn start_with_testing(
        config: AsyncConfig,
        testing: Option<StartTesting>,
    ) -> Result<Self, (Error, &'static MetricsStorage)> {
        init_tracing();
        let engine = MemEngine::new();
        engine.create_table(KV, "S", "S").unwrap();
        engine.create_table(RECNO, "r", "S").unwrap();
        // leaked; a few bytes per test
        let metrics: &'static MetricsStorage = Box::leak(Box::new(MetricsStorage::new_const()));
        match Subsystem::start_with_testing(Arc::new(engine.clone()), config, testing, metrics) {
            Ok(handle) => Ok(TestSystem {
                engine,
                handle,
                metrics,
            }),
            Err(e) => Err((e, metrics)),
        }
    }
}

impl std::ops::Deref for TestSystem {
    type Target = SubsystemHandle;

    fn deref(&self) -> &SubsystemHandle {
        &self.handle
    }
}
