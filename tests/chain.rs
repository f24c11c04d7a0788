
use std::sync::Arc;

use outpost::{HostRouter, Server};
use test_utils::{body_string, get, JoinNotes, Marker, Note};

#[tokio::test]
async fn entries_compose_in_declaration_order() {
    let mut hosts = HostRouter::new();
    let site = hosts.site_mut("*").unwrap();
    site.all("^/", Note("a")).unwrap();
    site.all("^/", Note("b")).unwrap();
    site.all("^/", JoinNotes("end")).unwrap();
    let server = Server::new(hosts);

    let res = server.respond(get("/anything", "x.example")).await;
    assert_eq!(body_string(res).await, "a+b+end");
}

#[tokio::test]
async fn a_stack_composes_into_one_middleware() {
    let mut hosts = HostRouter::new();
    let site = hosts.site_mut("*").unwrap();
    let stack = site.stack("^/").unwrap();
    stack.push(Arc::new(Note("s1")));
    stack.push(Arc::new(Note("s2")));
    stack.push(Arc::new(JoinNotes("s3")));
    assert_eq!(stack.len(), 3);

    // the stack was installed once; fetching it again extends the same one
    let again = site.stack("^/").unwrap();
    again.push(Arc::new(Marker("unreachable")));
    assert_eq!(stack.len(), 4);

    let server = Server::new(hosts);
    let res = server.respond(get("/", "x.example")).await;
    // JoinNotes is terminal, the late Marker never runs
    assert_eq!(body_string(res).await, "s1+s2+s3");
}

#[tokio::test]
async fn concurrent_requests_have_independent_chains() {
    let mut hosts = HostRouter::new();
    let site = hosts.site_mut("*").unwrap();
    site.all("^/", Note("n")).unwrap();
    site.all("^/", JoinNotes("done")).unwrap();
    let server = Server::new(hosts);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            body_string(server.respond(get("/x", "x.example")).await).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), "n+done");
    }
}

#[tokio::test]
async fn fall_through_reaches_the_outer_not_found() {
    let mut hosts = HostRouter::new();
    let site = hosts.site_mut("*").unwrap();
    site.all("^/", Note("seen")).unwrap();
    let server = Server::new(hosts);

    // every middleware fell through without touching the response
    let res = server.respond(get("/x", "x.example")).await;
    assert_eq!(res.status(), 404);
    assert_eq!(body_string(res).await, "Not Found");
}
