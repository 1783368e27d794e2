//! End-to-end traffic through the HTTP engine against a local upstream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use proxy_fleet::settings::CaptureType;
use proxy_fleet::{FleetConfig, HttpEngine, LaunchSpec, ProxyInstance, ProxyRegistry};

mod common;
use common::{free_port, start_mock_upstream};

async fn start_instance() -> (Arc<ProxyRegistry>, Arc<ProxyInstance>) {
    let registry = Arc::new(ProxyRegistry::new(&FleetConfig::default(), Arc::new(HttpEngine::new())));
    let spec = LaunchSpec {
        requested_port: Some(free_port().await),
        bind_address: Some("127.0.0.1".parse().unwrap()),
        ..LaunchSpec::default()
    };
    let instance = registry.create(spec).await.unwrap();
    (registry, instance)
}

fn client_via(instance: &ProxyInstance) -> reqwest::Client {
    let proxy = reqwest::Proxy::http(format!("http://127.0.0.1:{}", instance.port())).unwrap();
    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_forwards_and_injects_headers() {
    let upstream = start_mock_upstream().await;
    let (registry, instance) = start_instance().await;
    instance
        .set_headers(&BTreeMap::from([("X-Fleet".to_string(), "yes".to_string())]))
        .unwrap();

    let res = client_via(&instance)
        .get(format!("http://{}/hello?a=1", upstream))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    let body = res.text().await.unwrap();
    assert!(body.starts_with("GET /hello?a=1 HTTP/1.1"), "upstream saw: {}", body);
    assert!(body.to_ascii_lowercase().contains("x-fleet: yes"));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_records_har_entries() {
    let upstream = start_mock_upstream().await;
    let (registry, instance) = start_instance().await;

    let mut capture = CaptureType::HEADERS.to_vec();
    capture.extend(CaptureType::ALL_CONTENT);
    capture.extend(CaptureType::COOKIES);
    let previous = instance
        .new_har(capture.into_iter().collect(), Some("start".into()), None)
        .unwrap();
    assert!(previous.is_none());

    let client = client_via(&instance);
    for path in ["/one", "/two"] {
        let res = client
            .get(format!("http://{}{}", upstream, path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
    }

    let har = instance.har(false).unwrap();
    assert_eq!(har.log.entries.len(), 2);
    let last = instance.most_recent_entry(None).unwrap().unwrap();
    assert_eq!(last.request.url, format!("http://{}/two", upstream));
    assert_eq!(last.pageref.as_deref(), Some("start"));
    assert_eq!(last.response.status, 200);
    assert!(last
        .response
        .content
        .text
        .as_deref()
        .unwrap_or_default()
        .starts_with("GET /two"));
    assert!(last.response.cookies.iter().any(|c| c.name == "session"));

    let one = instance
        .find_entries(&format!("http://{}/one", upstream).replace('.', "\\."))
        .unwrap();
    assert_eq!(one.len(), 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_blocklist_answers_without_upstream() {
    let (registry, instance) = start_instance().await;
    instance
        .add_blocklist_rule("http://blocked\\.invalid/.*", 403, None)
        .unwrap();

    // The host does not resolve; a 403 proves nothing was dispatched.
    let res = client_via(&instance)
        .get("http://blocked.invalid/page")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_connect_not_implemented() {
    let (registry, instance) = start_instance().await;

    let mut stream = TcpStream::connect(("127.0.0.1", instance.port())).await.unwrap();
    stream
        .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]);
    assert!(head.starts_with("HTTP/1.1 501"), "got: {}", head);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_delete_closes_listener_and_wait_after_traffic() {
    let upstream = start_mock_upstream().await;
    let (registry, instance) = start_instance().await;
    let port = instance.port();

    client_via(&instance)
        .get(format!("http://{}/", upstream))
        .send()
        .await
        .unwrap();
    instance
        .wait_for_quiescence(Duration::from_millis(50), Duration::from_secs(2))
        .await
        .unwrap();

    registry.delete(port).await.unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
