//! Request telemetry: one log line per request and per-endpoint metrics.
//!
//! Metrics are keyed by the matched route pattern, never the raw path, so the
//! metrics map stays bounded by the route table. Requests that match no route
//! share one `<unmatched>` bucket per method.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info, warn};

pub struct RequestTelemetry;

impl<S, B> Transform<S, ServiceRequest> for RequestTelemetry
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestTelemetryMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestTelemetryMiddleware { service }))
    }
}

pub struct RequestTelemetryMiddleware<S> {
    service: S,
}

/// Metrics key for a request, e.g. `GET /hunnoi/downloads/{key:.*}`.
fn endpoint_name(method: &Method, pattern: Option<&str>) -> String {
    let method = match *method {
        Method::GET
        | Method::POST
        | Method::PUT
        | Method::DELETE
        | Method::HEAD
        | Method::OPTIONS
        | Method::PATCH
        | Method::CONNECT
        | Method::TRACE => method.as_str(),
        _ => "OTHER",
    };
    format!("{} {}", method, pattern.unwrap_or("<unmatched>"))
}

impl<S, B> Service<ServiceRequest> for RequestTelemetryMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let http_method = req.method().clone();
        let method = http_method.to_string();
        let path = req.path().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        let app_state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(state) = &app_state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;
            // Routing happens inside the wrapped service; the pattern is known only now.
            let pattern = result
                .as_ref()
                .ok()
                .and_then(|response| response.request().match_pattern());
            let endpoint = endpoint_name(&http_method, pattern.as_deref());

            let is_error = match &result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        warn!(%method, %path, %remote_addr, status = status.as_u16(), duration_ms, "Request completed with server error");
                    } else {
                        info!(%method, %path, %remote_addr, status = status.as_u16(), duration_ms, "Request completed");
                    }
                    status.is_client_error() || status.is_server_error()
                }
                Err(err) => {
                    error!(%method, %path, %remote_addr, duration_ms, error = %err, "Request failed");
                    true
                }
            };

            if let Some(state) = app_state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            result
        })
    }
}
