use flowline::services::PluginRuntime;
use flowline::services::http::HttpPluginRuntime;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves exactly one request with `status` and `body`, returning the request text it saw.
async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.expect("write");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request).to_string()
    });

    (format!("http://{}/plugins/", addr), handle)
}

#[tokio::test]
async fn test_http_plugin_posts_params() {
    let (endpoint, server) = serve_once("200 OK", r#"{"temperature":21}"#).await;
    let runtime = HttpPluginRuntime::new(endpoint);

    let output = runtime.invoke("weather", json!({ "city": "Oslo" })).await.expect("invoke");
    assert_eq!(output, json!({ "temperature": 21 }));

    let request = server.await.expect("server task");
    assert!(request.starts_with("POST /plugins/weather "), "{}", request);
    assert!(request.ends_with(r#"{"city":"Oslo"}"#), "{}", request);
}

#[tokio::test]
async fn test_http_plugin_error_status() {
    let (endpoint, server) = serve_once("503 Service Unavailable", "overloaded").await;
    let runtime = HttpPluginRuntime::new(endpoint);

    let err = runtime.invoke("weather", Value::Null).await.expect_err("should fail");
    let message = err.to_string();
    assert!(message.contains("HTTP 503"), "{}", message);
    assert!(message.contains("overloaded"), "{}", message);
    server.await.expect("server task");
}

#[test]
fn test_plugin_url() {
    let runtime = HttpPluginRuntime::new("http://plugins.local/api/");
    assert_eq!(runtime.url_for("echo"), "http://plugins.local/api/echo");
}
