use actix_web::{get, web, HttpResponse, Responder};
use serde::Serialize;
use tracing::warn;

use crate::store::{JobCounts, JobStore};
use crate::worker::{Scheduler, SchedulerStats};

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    scheduler: SchedulerStats,
    jobs: JobCounts,
    retained_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn report(status: &str, scheduler: &Scheduler, store: &JobStore) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        scheduler: scheduler.stats(),
        jobs: store.counts(),
        retained_jobs: store.len(),
        error: None,
    }
}

/// Health check endpoint
///
/// Reports worker occupancy and job counts.
/// Use for load balancers and uptime monitors.
#[get("/health")]
async fn health_check(scheduler: web::Data<Scheduler>, store: web::Data<JobStore>) -> impl Responder {
    HttpResponse::Ok().json(report("healthy", &scheduler, &store))
}

/// Readiness check endpoint
///
/// Checks if the service accepts new uploads.
/// Returns 503 once shutdown has closed the scheduler.
#[get("/ready")]
async fn readiness_check(scheduler: web::Data<Scheduler>, store: web::Data<JobStore>) -> impl Responder {
    let mut response = report("ready", &scheduler, &store);
    if response.scheduler.accepting {
        return HttpResponse::Ok().json(response);
    }

    warn!("Readiness check failed: scheduler closed");
    response.status = "not_ready".to_string();
    response.error = Some("Scheduler is no longer dispatching jobs".to_string());
    HttpResponse::ServiceUnavailable().json(response)
}

/// Liveness check endpoint
///
/// Simple check that the process is alive. Does not look at the scheduler.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({"status": "alive"}))
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
