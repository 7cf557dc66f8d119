//! Outbound client logging against a mock backend.

use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request};
use http_body_util::BodyExt;
use serde_json::Value;

use traffic_guard::config::{HttpLogLevel, LoggingConfig};
use traffic_guard::observability::{HttpLoggingHandler, LoggingClient, MemorySink, Source};

mod common;

fn client(level: HttpLogLevel) -> (LoggingClient, Arc<MemorySink>) {
    let mut config = LoggingConfig::default();
    config.http.level = level;
    let sink = Arc::new(MemorySink::new());
    let handler = Arc::new(HttpLoggingHandler::from_config(&config, sink.clone()));
    (LoggingClient::new(handler), sink)
}

async fn wait_for(sink: &MemorySink, expected: usize) -> Vec<(Source, String)> {
    for _ in 0..50 {
        if sink.records().len() >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sink.records()
}

#[tokio::test]
async fn test_outbound_exchange_is_logged() {
    let backend = common::start_mock_backend(r#"{"token":"abc","password":"pw"}"#).await;
    let (client, sink) = client(HttpLogLevel::Full);

    let request = Request::post(format!("http://{}/login?access_token=t0k", backend))
        .header("authorization", "Basic dXNlcg==")
        .body(Body::from(r#"{"password":"pw"}"#))
        .unwrap();
    let response = common::with_timeout(Duration::from_secs(5), client.request(request))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"token":"abc","password":"pw"}"#);

    let records = wait_for(&sink, 2).await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|(source, _)| *source == Source::Outbound));

    let request: Value = serde_json::from_str(&records[0].1).unwrap();
    assert_eq!(request["source"], "outbound");
    assert_eq!(request["type"], "request");
    assert_eq!(request["host"], "127.0.0.1");
    assert_eq!(request["path"], "/login");
    assert!(request["uri"].as_str().unwrap().ends_with("/login?access_token=****"));
    assert_eq!(request["headers"]["authorization"][0], "****");
    assert_eq!(request["body"]["password"], "****");

    let response: Value = serde_json::from_str(&records[1].1).unwrap();
    assert_eq!(response["type"], "response");
    assert_eq!(response["statusCode"], 200);
    assert_eq!(response["body"]["token"], "abc");
    assert_eq!(response["body"]["password"], "****");
    assert!(response["duration"].as_str().unwrap().ends_with("ms"));
}

#[tokio::test]
async fn test_error_body_logged_below_full() {
    let backend = common::start_programmable_backend(|| async {
        (500, r#"{"error":"db down"}"#.to_string())
    })
    .await;
    let (client, sink) = client(HttpLogLevel::Basic);

    let request = Request::get(format!("http://{}/status", backend))
        .body(Body::empty())
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 500);
    response.into_body().collect().await.unwrap();

    let records = wait_for(&sink, 2).await;
    let logged: Value = serde_json::from_str(&records[1].1).unwrap();
    assert_eq!(logged["statusCode"], 500);
    assert_eq!(logged["body"]["error"], "db down");
    assert!(logged.get("headers").is_none());
}

#[tokio::test]
async fn test_connection_failure_logs_request_only() {
    // Bind and drop to get a port nothing listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (client, sink) = client(HttpLogLevel::Basic);

    let request = Request::get(format!("http://{}/down", addr))
        .body(Body::empty())
        .unwrap();
    assert!(client.request(request).await.is_err());

    let records = wait_for(&sink, 1).await;
    assert_eq!(records.len(), 1);
    let logged: Value = serde_json::from_str(&records[0].1).unwrap();
    assert_eq!(logged["type"], "request");
}
