//! Outbound HTTP client with traffic logging.
//!
//! Calls made through [`LoggingClient`] go through the same capture,
//! obfuscation and formatting pipeline as inbound traffic, tagged with
//! `source = "outbound"`.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response},
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client, Error as ClientError},
    rt::TokioExecutor,
};

use crate::observability::capture::Source;
use crate::observability::http_logging::{ExchangeRecorder, HttpLoggingHandler};

/// HTTP client that logs every exchange the handler selects.
#[derive(Debug, Clone)]
pub struct LoggingClient {
    client: Client<HttpConnector, Body>,
    handler: Arc<HttpLoggingHandler>,
}

impl LoggingClient {
    pub fn new(handler: Arc<HttpLoggingHandler>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self::with_client(client, handler)
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client<HttpConnector, Body>, handler: Arc<HttpLoggingHandler>) -> Self {
        Self { client, handler }
    }

    /// Send `req`; the URI must be absolute.
    pub async fn request(&self, req: Request<Body>) -> Result<Response<Body>, ClientError> {
        if !self.handler.should_log(req.method(), req.uri().path()) {
            return Ok(self.client.request(req).await?.map(Body::new));
        }

        let (recorder, req) = ExchangeRecorder::begin(self.handler.clone(), Source::Outbound, req);
        match self.client.request(req.map(Body::new)).await {
            Ok(response) => Ok(recorder.finish(response).map(Body::new)),
            Err(e) => {
                tracing::warn!(error = %e, "Outbound request failed");
                recorder.fail(&e);
                Err(e)
            }
        }
    }
}
