
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use outpost::{HostRouter, Proxy, ProxyConfig, Server};
use test_utils::{body_string, get};

type SeenHeaders = Arc<Mutex<Vec<(String, Option<String>)>>>;

/// A small upstream recording selected request headers, answering 204
/// with a couple of marker headers.
async fn recording_upstream(record: &[&'static str], seen: SeenHeaders) -> SocketAddr {
    let record: Vec<String> = record.iter().map(|s| s.to_string()).collect();
    let make = make_service_fn(move |_| {
        let record = record.clone();
        let seen = seen.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: hyper::Request<hyper::Body>| {
                let record = record.clone();
                let seen = seen.clone();
                async move {
                    let mut observed = Vec::new();
                    for name in &record {
                        let value = req
                            .headers()
                            .get(name.as_str())
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        observed.push((name.clone(), value));
                    }
                    *seen.lock().unwrap() = observed;
                    let res = hyper::Response::builder()
                        .status(204)
                        .header("x-upstream", "yes")
                        .header("x-hidden", "secret")
                        .body(hyper::Body::empty())
                        .unwrap();
                    Ok::<_, Infallible>(res)
                }
            }))
        }
    });
    let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn proxy_server(config: ProxyConfig) -> Server {
    let mut hosts = HostRouter::new();
    hosts
        .site_mut(r"/^www\.example\.com$/")
        .unwrap()
        .all("^/api", Proxy::new(config).unwrap())
        .unwrap();
    Server::new(hosts)
}

#[tokio::test]
async fn forwards_and_overlays_the_upstream_authority() {
    let seen: SeenHeaders = Arc::default();
    let addr = recording_upstream(&["host", "x-client"], seen.clone()).await;
    let server = proxy_server(ProxyConfig::new(format!("http://{}", addr)));

    let mut req = get("/api/x", "www.example.com");
    req.headers_mut().insert("x-client", "1".parse().unwrap());
    let res = server.respond(req).await;

    assert_eq!(res.status(), 204);
    assert_eq!(res.headers().get("x-upstream").unwrap(), "yes");
    let observed = seen.lock().unwrap().clone();
    // hyper fills Host from the upstream authority, not the client's host
    assert_eq!(observed[0], ("host".to_string(), Some(addr.to_string())));
    assert_eq!(observed[1], ("x-client".to_string(), Some("1".to_string())));
}

#[tokio::test]
async fn response_header_filter_applies() {
    let seen: SeenHeaders = Arc::default();
    let addr = recording_upstream(&[], seen).await;
    let server = proxy_server(ProxyConfig {
        res_headers_filter: vec![
            "connection".to_string(),
            "transfer-encoding".to_string(),
            "x-hidden".to_string(),
        ],
        ..ProxyConfig::new(format!("http://{}", addr))
    });

    let res = server.respond(get("/api/x", "www.example.com")).await;
    assert_eq!(res.status(), 204);
    assert_eq!(res.headers().get("x-upstream").unwrap(), "yes");
    assert!(res.headers().get("x-hidden").is_none());
}

#[tokio::test]
async fn request_header_filter_applies() {
    let seen: SeenHeaders = Arc::default();
    let addr = recording_upstream(&["x-secret"], seen.clone()).await;
    let server = proxy_server(ProxyConfig {
        req_headers_filter: vec!["host".to_string(), "x-secret".to_string()],
        ..ProxyConfig::new(format!("http://{}", addr))
    });

    let mut req = get("/api/x", "www.example.com");
    req.headers_mut().insert("x-secret", "hide".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(res.status(), 204);
    assert_eq!(seen.lock().unwrap()[0], ("x-secret".to_string(), None));
}

#[tokio::test]
async fn request_bodies_are_piped_upstream() {
    let make = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|req: hyper::Request<hyper::Body>| async {
            let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
            Ok::<_, Infallible>(hyper::Response::new(hyper::Body::from(bytes)))
        }))
    });
    let upstream = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = upstream.local_addr();
    tokio::spawn(upstream);

    let server = proxy_server(ProxyConfig::new(format!("http://{}", addr)));
    let req = hyper::Request::builder()
        .method("POST")
        .uri("/api/send")
        .header("host", "www.example.com")
        .body(hyper::Body::from("ping"))
        .unwrap();
    let res = server.respond(req).await;
    assert_eq!(body_string(res).await, "ping");
}

#[tokio::test]
async fn unreachable_upstreams_answer_503() {
    // bind a port, then free it again: nothing listens there now
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server = proxy_server(ProxyConfig::new(format!("http://{}", addr)));
    let res = server.respond(get("/api/x", "www.example.com")).await;
    assert_eq!(res.status(), 503);
}

#[tokio::test]
async fn slow_upstreams_hit_the_timeout() {
    let make = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|_req| async {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            Ok::<_, Infallible>(hyper::Response::new(hyper::Body::from("late")))
        }))
    });
    let upstream = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = upstream.local_addr();
    tokio::spawn(upstream);

    let server = proxy_server(ProxyConfig {
        timeout: 50,
        ..ProxyConfig::new(format!("http://{}", addr))
    });
    let res = server.respond(get("/api/x", "www.example.com")).await;
    assert_eq!(res.status(), 503);
}

#[tokio::test]
async fn the_query_string_is_preserved() {
    let make = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|req: hyper::Request<hyper::Body>| async move {
            let echoed = req.uri().path_and_query().unwrap().to_string();
            Ok::<_, Infallible>(hyper::Response::new(hyper::Body::from(echoed)))
        }))
    });
    let upstream = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = upstream.local_addr();
    tokio::spawn(upstream);

    let server = proxy_server(ProxyConfig::new(format!("http://{}", addr)));
    let res = server
        .respond(get("/api/items?page=2&sort=asc", "www.example.com"))
        .await;
    assert_eq!(body_string(res).await, "/api/items?page=2&sort=asc");
}
