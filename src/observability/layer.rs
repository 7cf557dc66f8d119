//! Inbound traffic logging middleware.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{Request, Response},
};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};

use crate::observability::capture::Source;
use crate::observability::http_logging::{ExchangeRecorder, HttpLoggingHandler};

/// Layer applying [`TrafficLoggingService`].
#[derive(Debug, Clone)]
pub struct TrafficLoggingLayer {
    handler: Arc<HttpLoggingHandler>,
}

impl TrafficLoggingLayer {
    pub fn new(handler: Arc<HttpLoggingHandler>) -> Self {
        Self { handler }
    }
}

impl<S> Layer<S> for TrafficLoggingLayer {
    type Service = TrafficLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrafficLoggingService {
            inner,
            handler: self.handler.clone(),
        }
    }
}

/// Captures and logs every inbound exchange the handler selects.
#[derive(Debug, Clone)]
pub struct TrafficLoggingService<S> {
    inner: S,
    handler: Arc<HttpLoggingHandler>,
}

impl<S> Service<Request<Body>> for TrafficLoggingService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.handler.should_log(req.method(), req.uri().path()) {
            return Box::pin(inner.call(req));
        }

        let (recorder, req) = ExchangeRecorder::begin(self.handler.clone(), Source::Inbound, req);
        let req = req.map(Body::new);

        Box::pin(async move {
            match inner.call(req).await {
                Ok(response) => Ok(recorder.finish(response).map(Body::new)),
                Err(e) => {
                    recorder.fail(&e);
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::{HttpLogLevel, HttpLoggingConfig, LoggingConfig};
    use crate::observability::http_logging::MemorySink;

    fn layer(level: HttpLogLevel, sink: Arc<MemorySink>) -> TrafficLoggingLayer {
        let config = LoggingConfig {
            http: HttpLoggingConfig {
                level,
                ..Default::default()
            },
            ..Default::default()
        };
        TrafficLoggingLayer::new(Arc::new(HttpLoggingHandler::from_config(&config, sink)))
    }

    #[tokio::test]
    async fn test_echo_body_reaches_handler_and_log() {
        let sink = Arc::new(MemorySink::new());
        let svc = layer(HttpLogLevel::Full, sink.clone()).layer(tower::service_fn(
            |req: Request<Body>| async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                Ok::<_, Infallible>(Response::new(Body::from(body)))
            },
        ));

        let req = Request::builder()
            .method("POST")
            .uri("/echo")
            .body(Body::from(r#"{"msg":"hi"}"#))
            .unwrap();
        let response = svc.oneshot(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"msg":"hi"}"#);

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|(source, _)| *source == Source::Inbound));
        let request: serde_json::Value = serde_json::from_str(&records[0].1).unwrap();
        assert_eq!(request["body"]["msg"], "hi");
    }

    #[tokio::test]
    async fn test_excluded_path_is_not_logged() {
        let sink = Arc::new(MemorySink::new());
        let svc = layer(HttpLogLevel::Full, sink.clone()).layer(tower::service_fn(
            |_req: Request<Body>| async {
                let mut response = Response::new(Body::from("up"));
                *response.status_mut() = StatusCode::OK;
                Ok::<_, Infallible>(response)
            },
        ));

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = svc.oneshot(req).await.unwrap();
        response.into_body().collect().await.unwrap();
        assert!(sink.records().is_empty());
    }
}
