//! Service container wiring the production components from [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::Result;
use crate::cache::{RenderCache, ReplayPipeline};
use crate::config::AppConfig;
use crate::daemon::{DaemonRunner, Heartbeat, RunnerOptions, SessionWorker, StateStore};
use crate::inference::{Analyzer, HttpAnalyzer};
use crate::jobs::JobStore;
use crate::render::{BrowserReplayEngine, RenderOptions, ReplayRenderer, VideoTools};
use crate::rollup::{AnalysisStore, RollupOrchestrator};
use crate::slots::SlotArbiter;
use crate::source::{HttpRecordingSource, RecordingSource};
use crate::storage::{self, ObjectStore};

pub struct ServiceContainer {
    pub config: AppConfig,
    pub jobs: Arc<JobStore>,
    pub state: Arc<StateStore>,
    pub analyses: Arc<AnalysisStore>,
    pub arbiter: Arc<SlotArbiter>,
    pub cache: Arc<RenderCache>,
    pub source: Arc<dyn RecordingSource>,
    pub analyzer: Arc<dyn Analyzer>,
    pub store: Arc<dyn ObjectStore>,
}

impl ServiceContainer {
    /// Build the HTTP collaborators and file stores described by `config`.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let source: Arc<dyn RecordingSource> = Arc::new(HttpRecordingSource::new(&config.source)?);
        let analyzer: Arc<dyn Analyzer> = Arc::new(HttpAnalyzer::new(&config.inference)?);
        Ok(Self::with_collaborators(config, source, analyzer))
    }

    /// Build around caller-supplied source and analyzer.
    pub fn with_collaborators(
        config: AppConfig,
        source: Arc<dyn RecordingSource>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        let store = storage::build_store(&config.storage);
        let slot_dir = config.slot_dir();
        let arbiter = Arc::new(SlotArbiter::from_config(&config.slots, &slot_dir));

        let renderer = ReplayRenderer::new(
            Arc::new(BrowserReplayEngine::from_config(&config.render)),
            Arc::new(VideoTools::from_config(&config.render)),
            store.clone(),
            config.work_dir(),
            RenderOptions::from(&config.render),
        );
        let pipeline = Arc::new(ReplayPipeline::new(source.clone(), store.clone(), renderer));
        let cache = Arc::new(RenderCache::new(
            config.cache_dir(),
            arbiter.clone(),
            pipeline,
            config.slots.max_render_memory_mb,
        ));

        info!(
            data_dir = %config.data_dir.display(),
            slot_dir = %slot_dir.display(),
            "Services initialized"
        );

        Self {
            jobs: Arc::new(JobStore::new(config.jobs_dir())),
            state: Arc::new(StateStore::new(config.state_path())),
            analyses: Arc::new(AnalysisStore::new(config.analysis_dir())),
            arbiter,
            cache,
            source,
            analyzer,
            store,
            config,
        }
    }

    pub fn rollup_orchestrator(&self) -> RollupOrchestrator {
        RollupOrchestrator::new(self.analyses.clone(), self.jobs.clone(), self.analyzer.clone())
    }

    pub fn session_worker(&self) -> SessionWorker {
        SessionWorker::new(
            self.jobs.clone(),
            self.cache.clone(),
            self.analyzer.clone(),
            self.analyses.clone(),
            self.state.clone(),
        )
    }

    pub fn daemon_runner(&self) -> DaemonRunner {
        let heartbeat = Heartbeat::new(
            self.source.clone(),
            self.jobs.clone(),
            self.state.clone(),
            self.config.daemon.lookback_days,
            self.config.daemon.allowed_domains.clone(),
        );
        DaemonRunner::new(
            self.jobs.clone(),
            self.state.clone(),
            self.arbiter.clone(),
            heartbeat,
            Arc::new(self.session_worker()),
            self.rollup_orchestrator(),
            RunnerOptions {
                poll_interval: Duration::from_secs(self.config.daemon.poll_interval_secs.max(1)),
                budget_mb: self.config.slots.max_render_memory_mb,
                pid_path: self.config.pid_path(),
            },
        )
    }
}
