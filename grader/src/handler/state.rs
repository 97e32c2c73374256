use std::sync::Arc;

use actix_web::{get, web, HttpResponse};
use uuid::Uuid;

use crate::reporter::Reporter;
use crate::worker::{JobStatus, WorkerState};

/// Everything the status endpoint needs, shared with the worker.
pub struct StatusContext {
    pub executor_uuid: Uuid,
    pub worker_state: Arc<WorkerState>,
    pub reporter: Arc<Reporter>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StateResponse {
    #[schema(value_type = String)]
    pub executor_uuid: Uuid,
    pub slots: usize,
    pub busy_slots: usize,
    pub jobs: Vec<JobStatus>,
    /// Reports waiting in the spool for the server.
    pub spool_depth: usize,
}

impl StateResponse {
    pub fn collect(context: &StatusContext) -> Self {
        let jobs = context.worker_state.snapshot();
        Self {
            executor_uuid: context.executor_uuid,
            slots: context.worker_state.slots(),
            busy_slots: jobs.len(),
            jobs,
            spool_depth: context.reporter.spool().depth(),
        }
    }
}

pub fn route(cfg: &mut web::ServiceConfig) {
    cfg.service(get_state);
}

#[utoipa::path(
    context_path = "/api/v1",
    responses(
        (status = 200, description = "Slots and jobs of this executor", body = StateResponse)
    )
)]
#[get("/state")]
pub async fn get_state(context: web::Data<StatusContext>) -> HttpResponse {
    HttpResponse::Ok().json(StateResponse::collect(&context))
}
