use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::AppState;
use crate::cds::{HookRejection, HookRequest};
use crate::models::{DedupKey, JobStatus, StreamKey};
use crate::scheduler::Scheduler;

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn discovery(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.adapter.discovery())
}

pub async fn hook(
    state: web::Data<AppState>,
    path: web::Path<String>,
    request: web::Json<HookRequest>,
) -> impl Responder {
    let service_id = path.into_inner();
    match state.adapter.invoke(&service_id, request.into_inner()).await {
        Ok(outcome) => HttpResponse::Ok().json(outcome.response),
        Err(rejection @ HookRejection::UnknownService(_)) => {
            HttpResponse::NotFound().json(json!({ "cards": [], "error": rejection.to_string() }))
        }
        Err(rejection @ HookRejection::WrongHook { .. }) => {
            warn!(%rejection, "rejecting hook call");
            HttpResponse::BadRequest().json(json!({ "cards": [], "error": rejection.to_string() }))
        }
    }
}

fn scheduler(state: &AppState) -> Result<&Scheduler, HttpResponse> {
    state.scheduler.as_deref().ok_or_else(|| {
        HttpResponse::ServiceUnavailable().json(json!({ "error": "scheduler is not running in this process" }))
    })
}

pub async fn get_job(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    let scheduler = match scheduler(&state) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match scheduler.job(path.into_inner()).await {
        Some(job) => HttpResponse::Ok().json(job),
        None => HttpResponse::NotFound().json(json!({ "error": "job not found" })),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

pub async fn list_jobs(state: web::Data<AppState>, filter: web::Query<JobFilter>) -> HttpResponse {
    let scheduler = match scheduler(&state) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    HttpResponse::Ok().json(scheduler.jobs(filter.status).await)
}

/// Operator reset of an abandoned stream.
pub async fn reset_stream(state: web::Data<AppState>, key: web::Json<StreamKey>) -> HttpResponse {
    let scheduler = match scheduler(&state) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let reset = scheduler.reset(&key).await;
    HttpResponse::Ok().json(json!({ "reset": reset }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveAlert {
    pub dedup_key: DedupKey,
}

pub async fn resolve_alert(state: web::Data<AppState>, body: web::Json<ResolveAlert>) -> HttpResponse {
    let scheduler = match scheduler(&state) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match scheduler.resolve_alert(&body.dedup_key).await {
        Ok(true) => HttpResponse::Ok().json(json!({ "resolved": true })),
        Ok(false) => HttpResponse::NotFound().json(json!({ "resolved": false, "error": "no open alert with that key" })),
        Err(e) => {
            warn!(error = %e, "alert resolution failed");
            HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
        }
    }
}
