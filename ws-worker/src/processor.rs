use std::sync::Arc;

use tracing::{error, info, instrument};
use ws_orchestrator::{Result, TeardownMode, WorkspaceService};
use ws_queue::{Job, JobKind};

/// Maps a job onto its state-machine operation.
///
/// Failures are recorded on the workspace and never returned: the job is
/// finished either way and can be acknowledged.
pub struct Processor {
    service: Arc<WorkspaceService>,
}

impl Processor {
    pub fn new(service: Arc<WorkspaceService>) -> Self {
        Self { service }
    }

    async fn dispatch(&self, job: &Job) -> Result<()> {
        let id = job.workspace_id.as_str();
        match job.kind {
            JobKind::Create | JobKind::Start => self.service.provision_and_start(id).await,
            JobKind::Stop => self.service.teardown(id, TeardownMode::Stop).await,
            JobKind::Delete => self.service.teardown(id, TeardownMode::Delete).await,
        }
    }

    #[instrument(skip(self, job), fields(workspace_id = %job.workspace_id, job = %job.kind))]
    pub async fn process(&self, job: &Job) {
        match self.dispatch(job).await {
            Ok(()) => info!("job completed"),
            Err(e) => {
                error!(error = %e, "job failed");
                self.service.set_error(&job.workspace_id, &e.to_string()).await;
            }
        }
    }
}
