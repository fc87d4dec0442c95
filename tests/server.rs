//! HTTP API integration tests
//!
//! Each test builds a self-contained service: a temp blueprint repository,
//! a file-backed package universe, the build queue, and the real kickstart
//! templates shipped in `share/`. Requests go through the axum router
//! exactly as they would over the wire.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

use imageforge::api::{router, AppState};
use imageforge::config::Config;
use imageforge::queue::{Queue, Worker};
use imageforge::resolver::{ResolverHandle, SourceStore};
use imageforge::store::BlueprintStore;

const GLUSTERFS_TOML: &str = r#"name = "example-glusterfs"
description = "An example GlusterFS server with samba"
version = "0.0.1"

[[packages]]
name = "samba"
version = "4.*"
"#;

struct TestServer {
    router: Router,
    state: AppState,
    _dir: TempDir,
}

fn test_server() -> TestServer {
    test_server_with_arch("x86_64")
}

fn test_server_with_arch(arch: &str) -> TestServer {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    let lib_dir = root.join("lib");
    let repo_dir = root.join("blueprints");
    fs::create_dir_all(lib_dir.join("queue/new")).unwrap();
    fs::create_dir_all(lib_dir.join("queue/run")).unwrap();
    fs::create_dir_all(lib_dir.join("results")).unwrap();

    // The shipped templates double as test fixtures.
    let share_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("share");

    // File-backed package universe with everything the qcow2 template and
    // the example blueprints need.
    let universe = root.join("universe");
    fs::create_dir_all(&universe).unwrap();
    fs::write(
        universe.join("packages.toml"),
        r#"
[[packages]]
name = "samba"
version = "4.8.1"
release = "2.fc28"
arch = "x86_64"
summary = "Server and Client software to interoperate with Windows machines"
requires = ["glibc"]
size = 2097152

[[packages]]
name = "glibc"
epoch = 1
version = "2.27"
release = "19.fc28"
arch = "x86_64"
size = 10485760

[[packages]]
name = "kernel"
version = "4.18.0"
release = "1.fc28"
arch = "x86_64"
size = 73400320

[[packages]]
name = "grub2"
version = "2.02"
release = "38.fc28"
arch = "x86_64"
size = 5242880

[[packages]]
name = "tmux"
version = "2.7"
release = "1.fc28"
arch = "x86_64"
size = 524288
"#,
    )
    .unwrap();
    let user_sources = repo_dir.join("sources");
    fs::create_dir_all(&user_sources).unwrap();
    fs::write(
        user_sources.join("test-repo.toml"),
        format!(
            "name = \"test-repo\"\ntype = \"yum-baseurl\"\nurl = \"file://{}\"\n",
            universe.display()
        ),
    )
    .unwrap();

    let os_release = root.join("os-release");
    fs::write(&os_release, "NAME=Fedora\nVERSION_ID=28\nPRETTY_NAME=\"Fedora 28\"\n").unwrap();

    let mut cfg = Config::default();
    cfg.paths.lib_dir = lib_dir.clone();
    cfg.paths.share_dir = share_dir;
    cfg.paths.repo_dir = repo_dir.clone();
    cfg.paths.os_release = os_release;
    cfg.resolver.arch = Some(arch.to_string());
    let cfg = Arc::new(cfg);

    let store = BlueprintStore::open(&repo_dir).unwrap();
    let sources = SourceStore::new(cfg.system_sources_dir(), cfg.user_sources_dir());
    let resolver = ResolverHandle::open(sources, Duration::from_secs(300)).unwrap();
    let queue = Queue::open(&lib_dir).unwrap();

    let state = AppState {
        cfg,
        store: Arc::new(Mutex::new(store)),
        resolver: Arc::new(Mutex::new(resolver)),
        queue,
    };
    TestServer {
        router: router(state.clone()),
        state,
        _dir: dir,
    }
}

async fn request(
    server: &TestServer,
    method: &str,
    uri: &str,
    body: Option<(&str, String)>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some((content_type, text)) => {
            builder = builder.header(header::CONTENT_TYPE, content_type);
            Body::from(text)
        }
        None => Body::empty(),
    };
    let response = server
        .router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn get(server: &TestServer, uri: &str) -> (StatusCode, Value) {
    request(server, "GET", uri, None).await
}

async fn post_toml(server: &TestServer, uri: &str, body: &str) -> (StatusCode, Value) {
    request(server, "POST", uri, Some(("text/x-toml", body.to_string()))).await
}

async fn post_json(server: &TestServer, uri: &str, body: Value) -> (StatusCode, Value) {
    request(server, "POST", uri, Some(("application/json", body.to_string()))).await
}

async fn delete(server: &TestServer, uri: &str) -> (StatusCode, Value) {
    request(server, "DELETE", uri, None).await
}

fn first_error_id(body: &Value) -> &str {
    body["errors"][0]["id"].as_str().unwrap_or("")
}

#[tokio::test]
async fn status_reports_backend_and_api_version() {
    let server = test_server();
    let (status, body) = get(&server, "/api/v0/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api"], "0");
    assert_eq!(body["backend"], "imageforge");
    assert_eq!(body["db_supported"], true);
    assert_eq!(body["msgs"], serde_json::json!([]));
}

#[tokio::test]
async fn blueprint_new_list_info_round_trip() {
    let server = test_server();

    let (status, body) = post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    let (status, body) = get(&server, "/api/v0/blueprints/list").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["blueprints"], serde_json::json!(["example-glusterfs"]));

    // total is authoritative even with limit=0
    let (_, body) = get(&server, "/api/v0/blueprints/list?limit=0").await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["blueprints"], serde_json::json!([]));

    let (status, body) = get(&server, "/api/v0/blueprints/info/example-glusterfs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["blueprints"][0]["name"], "example-glusterfs");
    assert_eq!(body["blueprints"][0]["version"], "0.0.1");
    assert_eq!(body["changes"][0]["changed"], false);
    assert_eq!(body["errors"], serde_json::json!([]));
}

#[tokio::test]
async fn resubmitting_a_blueprint_bumps_the_patch_version() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    let (status, body) = post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    let (_, body) = get(&server, "/api/v0/blueprints/info/example-glusterfs").await;
    assert_eq!(body["blueprints"][0]["version"], "0.0.2");
}

#[tokio::test]
async fn json_blueprint_post_works_too() {
    let server = test_server();
    let blueprint = serde_json::json!({
        "name": "example-json",
        "description": "posted as json",
        "version": "0.1.0",
        "packages": [ {"name": "tmux", "version": "*"} ],
    });
    let (status, body) = post_json(&server, "/api/v0/blueprints/new", blueprint).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    let (_, body) = get(&server, "/api/v0/blueprints/info/example-json").await;
    assert_eq!(body["blueprints"][0]["packages"][0]["name"], "tmux");
}

#[tokio::test]
async fn workspace_diff_against_newest() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;

    let ws = r#"name = "example-glusterfs"
description = "An example GlusterFS server with samba, ws version"
version = "0.3.0"

[[packages]]
name = "samba"
version = "4.*"

[[packages]]
name = "tmux"
version = "*"
"#;
    let (status, body) = post_toml(&server, "/api/v0/blueprints/workspace", ws).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    // The workspace copy shadows the head.
    let (_, body) = get(&server, "/api/v0/blueprints/info/example-glusterfs").await;
    assert_eq!(body["changes"][0]["changed"], true);
    assert_eq!(body["blueprints"][0]["version"], "0.3.0");

    let (status, body) = get(
        &server,
        "/api/v0/blueprints/diff/example-glusterfs/NEWEST/WORKSPACE",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let diff = body["diff"].as_array().unwrap();
    assert_eq!(diff.len(), 3);
    assert_eq!(
        diff[0]["old"]["Description"],
        "An example GlusterFS server with samba"
    );
    assert_eq!(
        diff[0]["new"]["Description"],
        "An example GlusterFS server with samba, ws version"
    );
    assert_eq!(diff[1]["old"]["Version"], "0.0.1");
    assert_eq!(diff[1]["new"]["Version"], "0.3.0");
    assert_eq!(diff[2]["old"], Value::Null);
    assert_eq!(diff[2]["new"]["Package"]["name"], "tmux");
    assert_eq!(diff[2]["new"]["Package"]["version"], "*");

    // Deleting the workspace restores the committed head.
    let (status, _) = delete(&server, "/api/v0/blueprints/workspace/example-glusterfs").await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&server, "/api/v0/blueprints/info/example-glusterfs").await;
    assert_eq!(body["changes"][0]["changed"], false);
    assert_eq!(body["blueprints"][0]["version"], "0.0.1");

    let (_, body) = get(
        &server,
        "/api/v0/blueprints/diff/example-glusterfs/NEWEST/WORKSPACE",
    )
    .await;
    assert_eq!(body["diff"], serde_json::json!([]));
}

#[tokio::test]
async fn changes_tag_and_undo() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;

    let (status, body) = get(&server, "/api/v0/blueprints/changes/example-glusterfs").await;
    assert_eq!(status, StatusCode::OK);
    let changes = &body["blueprints"][0];
    assert_eq!(changes["name"], "example-glusterfs");
    assert_eq!(changes["total"], 2);
    let newest_message = changes["changes"][0]["message"].as_str().unwrap();
    assert!(newest_message.contains("version 0.0.2"));

    // Tag the head, then tag again with no intervening commit: the
    // revision does not advance.
    for _ in 0..2 {
        let (status, body) = request(&server, "POST", "/api/v0/blueprints/tag/example-glusterfs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], true);
    }
    let (_, body) = get(&server, "/api/v0/blueprints/changes/example-glusterfs").await;
    assert_eq!(body["blueprints"][0]["changes"][0]["revision"], 1);

    // Undo back to the first commit.
    let first_commit = body["blueprints"][0]["changes"][1]["commit"]
        .as_str()
        .unwrap()
        .to_string();
    let (status, body) = request(
        &server,
        "POST",
        &format!("/api/v0/blueprints/undo/example-glusterfs/{first_commit}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    let (_, body) = get(&server, "/api/v0/blueprints/info/example-glusterfs").await;
    assert_eq!(body["blueprints"][0]["version"], "0.0.1");
    let (_, body) = get(&server, "/api/v0/blueprints/changes/example-glusterfs").await;
    let message = body["blueprints"][0]["changes"][0]["message"].as_str().unwrap();
    assert_eq!(
        message,
        format!("example-glusterfs.toml reverted to commit {first_commit}")
    );

    // Undo with a bogus commit id.
    let (status, body) = request(
        &server,
        "POST",
        "/api/v0/blueprints/undo/example-glusterfs/deadbeef00",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "UnknownCommit");
}

#[tokio::test]
async fn blueprint_depsolve_and_freeze() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;

    let (status, body) = get(&server, "/api/v0/blueprints/depsolve/example-glusterfs").await;
    assert_eq!(status, StatusCode::OK);
    let deps = body["blueprints"][0]["dependencies"].as_array().unwrap();
    let names: Vec<&str> = deps.iter().map(|d| d["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["glibc", "samba"]);

    let (status, body) = get(&server, "/api/v0/blueprints/freeze/example-glusterfs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["blueprints"][0]["blueprint"]["packages"][0]["version"],
        "0:4.8.1-2.fc28.x86_64"
    );
    assert_eq!(body["errors"], serde_json::json!([]));
}

#[tokio::test]
async fn deleted_blueprint_is_unknown_everywhere() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    let (status, body) = delete(&server, "/api/v0/blueprints/delete/example-glusterfs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    for uri in [
        "/api/v0/blueprints/info/example-glusterfs",
        "/api/v0/blueprints/depsolve/example-glusterfs",
        "/api/v0/blueprints/freeze/example-glusterfs",
    ] {
        let (status, body) = get(&server, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(first_error_id(&body), "UnknownBlueprint", "{uri}");
    }

    let (status, body) = get(
        &server,
        "/api/v0/blueprints/diff/example-glusterfs/NEWEST/WORKSPACE",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "UnknownBlueprint");

    let (status, body) = request(
        &server,
        "POST",
        "/api/v0/blueprints/tag/example-glusterfs",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "UnknownBlueprint");

    let (status, body) = post_json(
        &server,
        "/api/v0/compose",
        serde_json::json!({"blueprint_name": "example-glusterfs", "compose_type": "qcow2"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], false);
}

#[tokio::test]
async fn invalid_characters_are_rejected() {
    let server = test_server();
    let (status, body) = get(&server, "/api/v0/blueprints/info/bad;name").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "InvalidChars");

    let (status, body) = get(&server, "/api/v0/blueprints/list?branch=bad;branch").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "InvalidChars");

    let (status, body) = get(
        &server,
        "/api/v0/blueprints/diff/bad;name/NEWEST/WORKSPACE",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "InvalidChars");
}

#[tokio::test]
async fn projects_and_modules_endpoints() {
    let server = test_server();

    let (status, body) = get(&server, "/api/v0/projects/list?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["projects"].as_array().unwrap().len(), 2);
    assert_eq!(body["projects"][0]["name"], "glibc");

    let (status, body) = get(&server, "/api/v0/projects/info/samba").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["projects"][0]["builds"][0]["version"], "4.8.1");

    let (status, body) = get(&server, "/api/v0/projects/depsolve/samba").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["projects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["glibc", "samba"]);

    let (status, body) = get(&server, "/api/v0/projects/info/no-such-project").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "ProjectsError");

    let (status, body) = get(&server, "/api/v0/modules/list").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["modules"][0]["group_type"], "rpm");

    let (status, body) = get(&server, "/api/v0/modules/info/kernel").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["modules"][0]["name"], "kernel");
}

#[tokio::test]
async fn source_management() {
    let server = test_server();

    let (status, body) = get(&server, "/api/v0/projects/source/list").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sources"], serde_json::json!(["test-repo"]));

    // Invalid url fails synchronously, nothing is persisted.
    let (status, body) = post_json(
        &server,
        "/api/v0/projects/source/new",
        serde_json::json!({"name": "bad", "type": "yum-baseurl", "url": "not a url"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "ProjectsError");

    let (status, _) = post_json(
        &server,
        "/api/v0/projects/source/new",
        serde_json::json!({"name": "extras", "type": "yum-baseurl", "url": "https://example.com/extras/"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&server, "/api/v0/projects/source/list").await;
    assert_eq!(body["sources"], serde_json::json!(["extras", "test-repo"]));

    let (status, body) = get(&server, "/api/v0/projects/source/info/extras").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sources"]["extras"]["type"], "yum-baseurl");

    let (status, _) = delete(&server, "/api/v0/projects/source/delete/extras").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = delete(&server, "/api/v0/projects/source/delete/ghost").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "UnknownSource");
}

#[tokio::test]
async fn compose_types_respect_the_arch_denylist() {
    let server = test_server_with_arch("s390x");
    let (status, body) = get(&server, "/api/v0/compose/types").await;
    assert_eq!(status, StatusCode::OK);
    let types: std::collections::HashMap<String, bool> = body["types"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| {
            (
                t["name"].as_str().unwrap().to_string(),
                t["enabled"].as_bool().unwrap(),
            )
        })
        .collect();
    for disabled in ["alibaba", "ami", "google", "vhd", "vmdk"] {
        assert_eq!(types[disabled], false, "{disabled} enabled on s390x");
    }
    assert_eq!(types["tar"], true);
    assert_eq!(types["qcow2"], true);

    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    let (status, body) = post_json(
        &server,
        "/api/v0/compose",
        serde_json::json!({"blueprint_name": "example-glusterfs", "compose_type": "vhd"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "BadComposeType");
}

#[tokio::test]
async fn compose_lifecycle_with_test_mode() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;

    let (status, body) = post_json(
        &server,
        "/api/v0/compose?test=2",
        serde_json::json!({"blueprint_name": "example-glusterfs", "compose_type": "qcow2"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);
    let build_id = body["build_id"].as_str().unwrap().to_string();

    // Waiting in the queue.
    let (_, body) = get(&server, "/api/v0/compose/queue").await;
    assert_eq!(body["new"][0]["id"], build_id.as_str());
    assert_eq!(body["new"][0]["queue_status"], "WAITING");
    assert_eq!(body["run"], serde_json::json!([]));

    // Drive the worker one step; test mode 2 finishes immediately with a
    // fake artifact.
    let worker = Worker::new(server.state.cfg.clone(), server.state.queue.clone());
    assert!(worker.process_next());

    let (_, body) = get(&server, &format!("/api/v0/compose/status/{build_id}")).await;
    assert_eq!(body["uuids"][0]["queue_status"], "FINISHED");
    assert_eq!(body["uuids"][0]["blueprint"], "example-glusterfs");
    assert_eq!(body["uuids"][0]["compose_type"], "qcow2");

    let (_, body) = get(&server, "/api/v0/compose/finished").await;
    assert_eq!(body["finished"][0]["id"], build_id.as_str());
    let (_, body) = get(&server, "/api/v0/compose/failed").await;
    assert_eq!(body["failed"], serde_json::json!([]));

    // Filters on /compose/status/*
    let (_, body) = get(&server, "/api/v0/compose/status/*?blueprint=example-glusterfs").await;
    assert_eq!(body["uuids"][0]["id"], build_id.as_str());
    let (_, body) = get(&server, "/api/v0/compose/status/*?blueprint=other").await;
    assert_eq!(body["uuids"], serde_json::json!([]));
    let (_, body) = get(&server, "/api/v0/compose/status/*?type=tar").await;
    assert_eq!(body["uuids"], serde_json::json!([]));
    let (_, body) = get(&server, "/api/v0/compose/status/*?status=FINISHED").await;
    assert_eq!(body["uuids"][0]["id"], build_id.as_str());

    // Detailed info.
    let (status, body) = get(&server, &format!("/api/v0/compose/info/{build_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_status"], "FINISHED");
    assert_eq!(body["blueprint"]["name"], "example-glusterfs");
    assert_eq!(body["compose_type"], "qcow2");
    assert!(!body["commit"].as_str().unwrap().is_empty());
    assert!(body["deps"]["packages"].as_array().unwrap().len() >= 2);
    assert_eq!(body["config"]["image_name"], "disk.qcow2");

    // Image download.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v0/compose/image/{build_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("{build_id}-disk.qcow2")));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"TEST IMAGE");

    // Metadata tar.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v0/compose/metadata/{build_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-tar"
    );

    // Cancel is rejected for a finished build; delete removes it.
    let (status, body) = delete(&server, &format!("/api/v0/compose/cancel/{build_id}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "BuildInQueueError");

    let (status, body) = delete(&server, &format!("/api/v0/compose/delete/{build_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uuids"][0]["status"], true);

    let (_, body) = get(&server, &format!("/api/v0/compose/status/{build_id}")).await;
    assert_eq!(body["uuids"], serde_json::json!([]));
    let (status, body) = get(&server, &format!("/api/v0/compose/info/{build_id}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "UnknownUUID");
}

#[tokio::test]
async fn waiting_compose_can_be_canceled() {
    let server = test_server();
    post_toml(&server, "/api/v0/blueprints/new", GLUSTERFS_TOML).await;
    let (_, body) = post_json(
        &server,
        "/api/v0/compose?test=2",
        serde_json::json!({"blueprint_name": "example-glusterfs", "compose_type": "qcow2"}),
    )
    .await;
    let build_id = body["build_id"].as_str().unwrap().to_string();

    // Deleting a waiting build is refused; cancel first.
    let (status, body) = delete(&server, &format!("/api/v0/compose/delete/{build_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first_error_id(&body), "BuildInQueueError");

    let (status, body) = delete(&server, &format!("/api/v0/compose/cancel/{build_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);

    let (_, body) = get(&server, &format!("/api/v0/compose/status/{build_id}")).await;
    assert_eq!(body["uuids"][0]["queue_status"], "CANCELED");
    let (_, body) = get(&server, "/api/v0/compose/queue").await;
    assert_eq!(body["new"], serde_json::json!([]));
}

#[tokio::test]
async fn unknown_build_uuid_is_reported() {
    let server = test_server();
    let (status, body) = get(&server, "/api/v0/compose/info/NO-UUID-TO-SEE-HERE").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error_id(&body), "UnknownUUID");

    let (_, body) = get(&server, "/api/v0/compose/status/4b668b1a-e6b8-4dce-8828-4a8e3bef2345").await;
    assert_eq!(body["uuids"], serde_json::json!([]));
}

#[tokio::test]
async fn final_kickstart_carries_kernel_append() {
    let server = test_server();
    let blueprint = r#"name = "example-append"
description = "kernel append test"
version = "0.0.1"

[[packages]]
name = "samba"
version = "4.*"

[customizations.kernel]
append = "nosmt=force"
"#;
    post_toml(&server, "/api/v0/blueprints/new", blueprint).await;
    let (_, body) = post_json(
        &server,
        "/api/v0/compose?test=2",
        serde_json::json!({"blueprint_name": "example-append", "compose_type": "qcow2"}),
    )
    .await;
    let build_id = body["build_id"].as_str().unwrap();

    let results = server
        .state
        .cfg
        .paths
        .lib_dir
        .join("results")
        .join(build_id);
    let ks = fs::read_to_string(results.join("final-kickstart.ks")).unwrap();
    let bootloader = ks
        .lines()
        .find(|l| l.starts_with("bootloader "))
        .expect("bootloader line present");
    assert!(bootloader.contains("nosmt=force"));

    let config = fs::read_to_string(results.join("config.toml")).unwrap();
    assert!(config.contains("extra_boot_args = \"nosmt=force\""));
}
