use crate::{error::AppError, pipeline::SourceRef, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub url: String,
}

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": "Pong, Hunnoi!" }))
}

/// Look a source up without downloading it, so the client can show the
/// title and thumbnail before queueing a job.
pub async fn validate_source(
    state: web::Data<AppState>,
    body: web::Json<ValidateRequest>,
) -> Result<HttpResponse, AppError> {
    let source = SourceRef::parse(&body.url)?;
    debug!(%source, "Probing source");

    let metadata = state.pipeline.retriever.probe(&source).await?;
    info!(%source, id = %metadata.id, "Source validated");
    Ok(HttpResponse::Ok().json(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobError;
    use crate::session::test_support::FakeRetriever;
    use crate::state::test_support::fake_state;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_ping() {
        let app = test::init_service(App::new().route("/ping", web::get().to(ping))).await;
        let req = test::TestRequest::get().uri("/ping").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"message": "Pong, Hunnoi!"}));
    }

    #[actix_web::test]
    async fn test_validate_returns_normalised_metadata() {
        let (state, _root) = fake_state(FakeRetriever::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/validate", web::post().to(validate_source)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/validate")
            .set_json(json!({"url": "  https://www.youtube.com/watch?v=abc&list=PL1&t=30 "}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["id"], "abc");
        assert_eq!(body["title"], "Mix from https://www.youtube.com/watch?v=abc");
        assert!(body["thumbnails"].is_null());
    }

    #[actix_web::test]
    async fn test_validate_rejects_bad_and_unavailable_sources() {
        let retriever = FakeRetriever {
            fail: Some(JobError::SourceUnavailable("video removed".to_string())),
            ..Default::default()
        };
        let (state, _root) = fake_state(retriever);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/validate", web::post().to(validate_source)),
        )
        .await;

        for url in ["ftp://example.com/a", "https://www.youtube.com/watch?v=gone"] {
            let req = test::TestRequest::post()
                .uri("/validate")
                .set_json(json!({ "url": url }))
                .to_request();
            let response = test::call_service(&app, req).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", url);
        }
    }
}
