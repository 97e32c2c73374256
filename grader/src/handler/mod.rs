pub mod state;

use actix_web::{get, web, HttpResponse, Responder};
use utoipa::OpenApi;

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(state::get_state),
    components(schemas(state::StateResponse, crate::worker::JobStatus))
)]
pub struct ApiDoc;

#[get("/api-docs/openapi.json")]
pub async fn openapi_json() -> impl Responder {
    HttpResponse::Ok().json(ApiDoc::openapi())
}

pub fn route(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api/v1").configure(state::route))
        .service(openapi_json);
}
