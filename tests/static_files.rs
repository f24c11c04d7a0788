
use std::fs;
use std::path::Path;

use outpost::{HostRouter, Server, StaticConfig, StaticFiles};
use test_utils::{body_bytes, body_string, get};

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn server_with(config: StaticConfig) -> Server {
    let mut hosts = HostRouter::new();
    hosts
        .site_mut("*")
        .unwrap()
        .all("^/static", StaticFiles::new(config).unwrap())
        .unwrap();
    Server::new(hosts)
}

fn base_config(root: &Path) -> StaticConfig {
    StaticConfig {
        root: root.to_path_buf(),
        base: Some("/static".to_string()),
        ..StaticConfig::default()
    }
}

#[tokio::test]
async fn serves_a_file_with_its_metadata() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"hi\n");
    let server = server_with(base_config(dir.path()));

    let res = server.respond(get("/static/hello.txt", "x")).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers().get("content-length").unwrap(), "3");
    assert_eq!(res.headers().get("accept-ranges").unwrap(), "bytes");
    assert!(res.headers().contains_key("last-modified"));
    assert_eq!(res.headers().get("cache-control").unwrap(), "max-age=0");
    assert_eq!(
        res.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(body_string(res).await, "hi\n");
}

#[tokio::test]
async fn brotli_wins_over_gzip() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"plain");
    write(dir.path(), "hello.txt.br", b"BROTLI-BYTES");
    write(dir.path(), "hello.txt.gz", b"GZIP-BYTES");
    let server = server_with(base_config(dir.path()));

    let mut req = get("/static/hello.txt", "x");
    req.headers_mut()
        .insert("accept-encoding", "gzip, br".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers().get("content-encoding").unwrap(), "br");
    // the type still reflects the addressed file
    assert_eq!(res.headers().get("content-type").unwrap(), "text/plain");
    assert_eq!(body_bytes(res).await, b"BROTLI-BYTES");
}

#[tokio::test]
async fn gzip_is_used_when_brotli_is_not_accepted() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"plain");
    write(dir.path(), "hello.txt.gz", b"GZIP-BYTES");
    let server = server_with(base_config(dir.path()));

    let mut req = get("/static/hello.txt", "x");
    req.headers_mut()
        .insert("accept-encoding", "gzip".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(res.headers().get("content-encoding").unwrap(), "gzip");
    assert_eq!(body_bytes(res).await, b"GZIP-BYTES");
}

#[tokio::test]
async fn escapes_never_leave_the_root() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"hi\n");
    let server = server_with(base_config(dir.path()));

    let res = server.respond(get("/static/../etc/passwd", "x")).await;
    assert_eq!(res.status(), 403);
    let body = body_string(res).await;
    assert!(!body.contains("root:"));

    // percent-encoded traversal decodes before containment
    let res = server.respond(get("/static/%2e%2e/etc/passwd", "x")).await;
    assert_eq!(res.status(), 403);
}

#[tokio::test]
async fn range_requests_slice_the_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "data.bin", b"0123456789");
    let server = server_with(base_config(dir.path()));

    let mut req = get("/static/data.bin", "x");
    req.headers_mut()
        .insert("range", "bytes=0-3".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(res.status(), 206);
    assert_eq!(
        res.headers().get("content-range").unwrap(),
        "bytes 0-3/10"
    );
    assert_eq!(body_string(res).await, "0123");

    let mut req = get("/static/data.bin", "x");
    req.headers_mut().insert("range", "bytes=4-".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(res.status(), 206);
    assert_eq!(body_string(res).await, "456789");

    let mut req = get("/static/data.bin", "x");
    req.headers_mut().insert("range", "bytes=-2".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(
        res.headers().get("content-range").unwrap(),
        "bytes 8-9/10"
    );
    assert_eq!(body_string(res).await, "89");
}

#[tokio::test]
async fn adjacent_ranges_reassemble_the_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "data.bin", b"0123456789");
    let server = server_with(base_config(dir.path()));

    let mut assembled = String::new();
    for range in ["bytes=0-4", "bytes=5-"] {
        let mut req = get("/static/data.bin", "x");
        req.headers_mut().insert("range", range.parse().unwrap());
        assembled += &body_string(server.respond(req).await).await;
    }
    assert_eq!(assembled, "0123456789");
}

#[tokio::test]
async fn unsatisfiable_ranges_answer_416_with_a_courtesy_body() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "data.bin", b"0123456789");
    let server = server_with(base_config(dir.path()));

    let mut req = get("/static/data.bin", "x");
    req.headers_mut()
        .insert("range", "bytes=42-".parse().unwrap());
    let res = server.respond(req).await;
    assert_eq!(res.status(), 416);
    assert_eq!(res.headers().get("content-range").unwrap(), "bytes */10");
    assert_eq!(body_string(res).await, "0123456789");
}

#[tokio::test]
async fn hidden_paths_fall_through_unless_enabled() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), ".secret", b"keep out");
    let server = server_with(base_config(dir.path()));

    let res = server.respond(get("/static/.secret", "x")).await;
    assert_eq!(res.status(), 404, "hidden file falls through to 404");

    let config = StaticConfig {
        hidden: true,
        ..base_config(dir.path())
    };
    let server = server_with(config);
    let res = server.respond(get("/static/.secret", "x")).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_string(res).await, "keep out");
}

#[tokio::test]
async fn directory_requests_use_the_index() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "index.html", b"<h1>home</h1>");
    write(dir.path(), "sub/index.html", b"<h1>sub</h1>");
    let server = server_with(base_config(dir.path()));

    let res = server.respond(get("/static/", "x")).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_string(res).await, "<h1>home</h1>");

    // a directory reached without a trailing slash is formatted
    let res = server.respond(get("/static/sub", "x")).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_string(res).await, "<h1>sub</h1>");
}

#[tokio::test]
async fn extension_fallback_tries_the_configured_list() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "page.html", b"<p>page</p>");
    let config = StaticConfig {
        extensions: Some(vec!["txt".to_string(), "html".to_string()]),
        ..base_config(dir.path())
    };
    let server = server_with(config);

    let res = server.respond(get("/static/page", "x")).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_string(res).await, "<p>page</p>");
}

#[tokio::test]
async fn browsing_renders_a_listing() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "docs/a.txt", b"a");
    write(dir.path(), "docs/b.txt", b"b");
    fs::create_dir_all(dir.path().join("docs/nested")).unwrap();
    let config = StaticConfig {
        browse: true,
        index: None,
        ..base_config(dir.path())
    };
    let server = server_with(config);

    let res = server.respond(get("/static/docs/", "x")).await;
    assert_eq!(res.status(), 200);
    let body = body_string(res).await;
    assert!(body.contains("a.txt"));
    assert!(body.contains("b.txt"));
    assert!(body.contains("nested/"), "directories get a trailing slash");
    assert!(body.contains("../"), "non-root listings link the parent");
}

#[tokio::test]
async fn head_requests_send_headers_only() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"hi\n");
    let server = server_with(base_config(dir.path()));

    let req = hyper::Request::builder()
        .method("HEAD")
        .uri("/static/hello.txt")
        .header("host", "x")
        .body(hyper::Body::empty())
        .unwrap();
    let res = server.respond(req).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers().get("content-length").unwrap(), "3");
    assert!(body_string(res).await.is_empty());
}

#[tokio::test]
async fn cache_control_reflects_maxage_and_immutable() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "app.js", b"x()");
    let config = StaticConfig {
        maxage: 60_000,
        immutable: true,
        ..base_config(dir.path())
    };
    let server = server_with(config);

    let res = server.respond(get("/static/app.js", "x")).await;
    assert_eq!(
        res.headers().get("cache-control").unwrap(),
        "max-age=60, immutable"
    );
}

#[tokio::test]
async fn missing_files_are_404_and_other_methods_fall_through() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"hi\n");
    let server = server_with(base_config(dir.path()));

    let res = server.respond(get("/static/nope.txt", "x")).await;
    assert_eq!(res.status(), 404);

    let req = hyper::Request::builder()
        .method("POST")
        .uri("/static/hello.txt")
        .header("host", "x")
        .body(hyper::Body::empty())
        .unwrap();
    let res = server.respond(req).await;
    // POST is not served; the chain falls through to the outer 404
    assert_eq!(res.status(), 404);
    assert_eq!(body_string(res).await, "Not Found");
}

#[tokio::test]
async fn requests_outside_the_base_fall_through() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.txt", b"hi\n");
    let mut hosts = HostRouter::new();
    let site = hosts.site_mut("*").unwrap();
    site.all("^/", StaticFiles::new(base_config(dir.path())).unwrap())
        .unwrap();
    let server = Server::new(hosts);

    let res = server.respond(get("/elsewhere/hello.txt", "x")).await;
    assert_eq!(res.status(), 404);
}
