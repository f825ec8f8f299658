use actix_web::{
    get, post,
    web::{scope, Data, Path, ServiceConfig},
    HttpRequest, HttpResponse, Responder,
};
use actix_web_validator::Json;

use super::dto::{ConfigResponse, JobListResponse, SubmitResponse};
use super::models::UploadRequest;
use super::service::{JobService, ServiceError};
use crate::api::auth::{GoogleAuth, SignedIn};
use crate::store::{JobId, RedirectContext};

#[get("/config")]
async fn client_config(
    req: HttpRequest,
    service: Data<JobService>,
    auth: Data<GoogleAuth>,
) -> impl Responder {
    HttpResponse::Ok().json(ConfigResponse {
        redirect_uri: auth.redirect_uri(&req),
        max_concurrent_uploads: service.max_concurrent(),
        max_bulk_items: service.max_batch(),
    })
}

#[post("/upload")]
async fn submit_upload(
    req: HttpRequest,
    SignedIn(credential): SignedIn,
    service: Data<JobService>,
    auth: Data<GoogleAuth>,
    body: Json<UploadRequest>,
) -> Result<HttpResponse, ServiceError> {
    let redirect = RedirectContext {
        redirect_uri: auth.redirect_uri(&req),
    };
    let job_ids = service.submit(&body.into_inner().items, &credential, &redirect)?;
    Ok(HttpResponse::Ok().json(SubmitResponse { job_ids }))
}

#[get("/jobs")]
async fn list_jobs(_user: SignedIn, service: Data<JobService>) -> impl Responder {
    HttpResponse::Ok().json(JobListResponse {
        jobs: service.recent(),
    })
}

#[get("/jobs/{id}")]
async fn get_job(
    _user: SignedIn,
    service: Data<JobService>,
    id: Path<JobId>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.get(id.into_inner())?;
    Ok(HttpResponse::Ok().json(job))
}

pub fn job_config(config: &mut ServiceConfig) {
    config.service(
        scope("/api")
            .service(client_config)
            .service(submit_upload)
            .service(list_jobs)
            .service(get_job),
    );
}
