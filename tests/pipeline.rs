//! Deployment pipeline and version lifecycle against a fake container engine

use neploy::db::{Database, Gateway, GatewayStatus, VersionStatus};
use neploy::engine::ContainerEngine;
use neploy::error::Error;
use neploy::lifecycle::LifecycleService;
use neploy::notify::{HubSettings, NotificationHub, ProgressMessage, Slot};
use neploy::pipeline::{Pipeline, PipelineSettings};
use neploy::pool::{ConnectionPool, PoolConfig};
use neploy::router::Router;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

mod common;
use common::{zip_bytes, FakeEngine};

struct Harness {
    db: Database,
    engine: Arc<FakeEngine>,
    router: Arc<Router>,
    hub: Arc<NotificationHub>,
    pipeline: Pipeline,
    lifecycle: LifecycleService,
    upload_root: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let upload_root = dir.path().join("uploads");
        let db = Database::open_in_memory().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
        let router = Arc::new(Router::new(
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            Duration::from_secs(5),
        ));
        let hub = Arc::new(NotificationHub::new(HubSettings::default()));

        let pipeline = Pipeline::new(
            db.clone(),
            Arc::clone(&dyn_engine),
            Arc::clone(&router),
            Arc::clone(&hub),
            PipelineSettings {
                upload_root: upload_root.clone(),
                domain: "localhost".into(),
                interactive: false,
            },
        );
        let lifecycle = LifecycleService::new(db.clone(), dyn_engine, Arc::clone(&router));

        Self {
            db,
            engine,
            router,
            hub,
            pipeline,
            lifecycle,
            upload_root,
            _dir: dir,
        }
    }

    fn progress(&self) -> UnboundedReceiver<String> {
        self.hub.attach(Slot::Progress).1
    }
}

fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<ProgressMessage> {
    let mut messages = Vec::new();
    while let Ok(text) = rx.try_recv() {
        messages.push(serde_json::from_str(&text).unwrap());
    }
    messages
}

fn node_project() -> hyper::body::Bytes {
    let padding = "a".repeat(2 * 1024 * 1024);
    zip_bytes(&[
        ("package.json", r#"{"name":"demo","scripts":{"start":"node index.js"}}"#),
        ("index.js", "require('http').createServer().listen(3000)"),
        ("assets/blob.txt", &padding),
    ])
}

#[tokio::test]
async fn test_upload_deploys_archive() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    let mut progress = h.progress();

    let version = h
        .pipeline
        .upload(&app.id, "demo.zip", node_project())
        .await
        .unwrap();

    let app_dir = h.upload_root.join("demo");
    assert!(app_dir.join("package.json").is_file());
    assert!(app_dir.join("assets/blob.txt").is_file());
    assert!(app_dir.join("Dockerfile").is_file());
    assert!(!h.upload_root.join("demo.zip").exists());

    assert_eq!(version.version_tag, "v1.0.0");
    assert_eq!(version.status, VersionStatus::Active);
    assert_eq!(Path::new(&version.storage_location), app_dir.as_path());

    let container = h.engine.container("neploy-demo_v1-0-0").unwrap();
    assert!(container.running);
    assert_eq!(container.port, 3000);
    assert_eq!(container.image, "neploy-demo:v1.0.0");

    let gateways = h.db.get_gateways_for_application(&app.id).unwrap();
    assert_eq!(gateways.len(), 1);
    assert_eq!(gateways[0].name, "demo-gateway");
    assert_eq!(gateways[0].path.as_deref(), Some("/demo"));
    assert_eq!(gateways[0].status, GatewayStatus::Active);
    assert_eq!(h.router.resolve("localhost", "/demo/ping").unwrap().port, 3000);

    let app = h.db.get_application(&app.id).unwrap();
    let stack = h.db.get_tech_stack(app.tech_stack_id.as_deref().unwrap()).unwrap();
    assert_eq!(stack.name, "Node.js");

    let messages = drain(&mut progress);
    let steps: Vec<u8> = messages.iter().map(|m| m.progress).collect();
    assert_eq!(steps, vec![0, 20, 40, 70, 90, 100]);
    assert_eq!(messages.last().unwrap().message, "Deployment complete!");
}

#[tokio::test]
async fn test_second_upload_bumps_patch() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();

    h.pipeline.upload(&app.id, "demo.zip", node_project()).await.unwrap();
    let second = h
        .pipeline
        .upload(&app.id, "demo.zip", node_project())
        .await
        .unwrap();

    assert_eq!(second.version_tag, "v1.0.1");
    assert_eq!(h.db.get_versions_for_application(&app.id).unwrap().len(), 2);
    assert_eq!(h.db.get_gateways_for_application(&app.id).unwrap().len(), 1);
    assert_eq!(h.router.route_count(), 1);
}

#[tokio::test]
async fn test_new_upload_replaces_previous_tree() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    h.pipeline.upload(&app.id, "demo.zip", node_project()).await.unwrap();

    let python = zip_bytes(&[
        ("requirements.txt", "flask\n"),
        ("app.py", "print('up')\n"),
        ("util.py", "X = 1\n"),
    ]);
    let second = h.pipeline.upload(&app.id, "demo.zip", python).await.unwrap();

    let app_dir = h.upload_root.join("demo");
    assert_eq!(second.version_tag, "v1.0.1");
    assert!(!app_dir.join("package.json").exists());
    assert!(!app_dir.join("assets").exists());
    assert!(app_dir.join("app.py").is_file());

    let dockerfile = std::fs::read_to_string(app_dir.join("Dockerfile")).unwrap();
    assert!(dockerfile.starts_with("FROM python"));
    assert_eq!(h.engine.container("neploy-demo_v1-0-1").unwrap().port, 8000);

    let app = h.db.get_application(&app.id).unwrap();
    let stack = h.db.get_tech_stack(app.tech_stack_id.as_deref().unwrap()).unwrap();
    assert_eq!(stack.name, "Python");
}

#[tokio::test]
async fn test_deploy_rejects_option_like_source() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();

    let url = h.pipeline.deploy(&app.id, "--upload-pack=touch /tmp/x", "main").await;
    assert!(matches!(url, Err(Error::InvalidInput(_))));

    let branch = h
        .pipeline
        .deploy(&app.id, "https://example.com/demo.git", "--orphan")
        .await;
    assert!(matches!(branch, Err(Error::InvalidInput(_))));
    assert!(h.db.get_versions_for_application(&app.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_does_not_take_over_foreign_route() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    let other = h.db.insert_application("other", "").unwrap();
    h.db.insert_gateway(&Gateway::for_path(&other.id, "hand-made", "localhost", "/demo", 9000))
        .unwrap();

    let result = h.pipeline.upload(&app.id, "demo.zip", node_project()).await;

    assert!(matches!(result, Err(Error::Conflict(_))));
    let versions = h.db.get_versions_for_application(&app.id).unwrap();
    assert_eq!(versions[0].status, VersionStatus::Error);
    assert!(h.db.get_gateways_for_application(&app.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_nested_dockerfile_builds_from_project_root() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    let archive = zip_bytes(&[
        ("deploy/Dockerfile", "FROM node:20\nCOPY . .\nEXPOSE 4000\nCMD [\"node\", \"index.js\"]\n"),
        ("package.json", "{}"),
        ("index.js", "console.log('up')"),
    ]);

    h.pipeline.upload(&app.id, "demo.zip", archive).await.unwrap();

    let app_dir = h.upload_root.join("demo");
    assert_eq!(h.engine.build_contexts(), vec![app_dir.clone()]);
    assert!(!app_dir.join("Dockerfile").exists());
    assert_eq!(h.engine.container("neploy-demo_v1-0-0").unwrap().port, 4000);
}

#[tokio::test]
async fn test_upload_rejects_non_zip() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();

    let result = h
        .pipeline
        .upload(&app.id, "demo.tar.gz", node_project())
        .await;

    assert!(matches!(result, Err(Error::InvalidInput(_))));
    assert!(h.db.get_versions_for_application(&app.id).unwrap().is_empty());
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
async fn test_build_failure_marks_version() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    h.engine.fail_builds();
    let mut progress = h.progress();

    let result = h.pipeline.upload(&app.id, "demo.zip", node_project()).await;
    assert!(matches!(result, Err(Error::Engine(_))));

    let versions = h.db.get_versions_for_application(&app.id).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, VersionStatus::Error);
    assert_eq!(h.router.route_count(), 0);

    let last = drain(&mut progress).pop().unwrap();
    assert_eq!(last.progress, 40);
    assert!(last.message.contains("build failed"));
    // Staged files stay for inspection.
    assert!(h.upload_root.join("demo/Dockerfile").is_file());
}

#[tokio::test]
async fn test_existing_container_is_reused() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    let existing = h
        .engine
        .preexisting("neploy-demo_v1-0-0", "neploy-demo:v1.0.0", 3000);

    h.pipeline.upload(&app.id, "demo.zip", node_project()).await.unwrap();

    let container = h.engine.container("neploy-demo_v1-0-0").unwrap();
    assert_eq!(container.id, existing);
    assert!(container.running);
    assert!(h.engine.calls().contains(&format!("start {}", existing)));
}

#[tokio::test]
async fn test_stop_start_delete_version() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    let version = h
        .pipeline
        .upload(&app.id, "demo.zip", node_project())
        .await
        .unwrap();
    let gateway_id = h.db.get_gateways_for_application(&app.id).unwrap()[0].id.clone();

    let stopped = h.lifecycle.stop_container(&app.id, &version.id).await.unwrap();
    assert_eq!(stopped.status, VersionStatus::Inactive);
    assert!(h.engine.container("neploy-demo_v1-0-0").is_none());
    assert_eq!(h.router.route_count(), 0);
    assert_eq!(
        h.db.get_gateway(&gateway_id).unwrap().status,
        GatewayStatus::Inactive
    );

    let missing = h.lifecycle.stop_container(&app.id, &version.id).await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    let started = h.lifecycle.start_container(&app.id, &version.id).await.unwrap();
    assert_eq!(started.status, VersionStatus::Active);
    let container = h.engine.container("neploy-demo_v1-0-0").unwrap();
    assert!(container.running);
    assert_eq!(container.port, 3000);
    assert!(h.router.resolve("localhost", "/demo").is_some());
    assert_eq!(
        h.db.get_gateway(&gateway_id).unwrap().status,
        GatewayStatus::Active
    );

    h.lifecycle.delete_version(&app.id, &version.id).await.unwrap();
    assert!(matches!(h.db.get_version(&version.id), Err(Error::NotFound(_))));
    assert!(h.engine.container("neploy-demo_v1-0-0").is_none());
    assert!(matches!(h.db.get_gateway(&gateway_id), Err(Error::NotFound(_))));
    assert_eq!(h.router.route_count(), 0);
}

#[tokio::test]
async fn test_version_of_other_application_not_found() {
    let h = Harness::new();
    let app = h.db.insert_application("demo", "").unwrap();
    let other = h.db.insert_application("other", "").unwrap();
    let version = h
        .pipeline
        .upload(&app.id, "demo.zip", node_project())
        .await
        .unwrap();

    let result = h.lifecycle.stop_container(&other.id, &version.id).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        status.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&status.stderr)
    );
}

/// A local repository on branch `main` tagged v1.0.0 and v1.1.0
fn go_repo(dir: &Path) -> String {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(dir.join("go.mod"), "module example.com/api\n\ngo 1.22\n").unwrap();
    std::fs::write(dir.join("main.go"), "package main\n\nfunc main() {}\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
    git(dir, &["tag", "v1.0.0"]);
    std::fs::write(dir.join("README.md"), "api\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "readme"]);
    git(dir, &["tag", "v1.1.0"]);
    format!("file://{}", dir.display())
}

#[tokio::test]
async fn test_deploy_latest_tag_from_git() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let h = Harness::new();
    let repo_dir = tempfile::tempdir().unwrap();
    let url = go_repo(&repo_dir.path().join("repo"));
    let app = h.db.insert_application("My Api", "").unwrap();

    let version = h.pipeline.deploy(&app.id, &url, "main").await.unwrap();

    let version_path = h.upload_root.join("my-api").join("v1.1.0");
    assert_eq!(version.version_tag, "v1.1.0");
    assert_eq!(version.status, VersionStatus::Active);
    assert_eq!(Path::new(&version.storage_location), version_path.as_path());
    assert!(version_path.join("Dockerfile").is_file());
    assert!(version_path.join("README.md").is_file());

    let gateways = h.db.get_gateways_for_application(&app.id).unwrap();
    assert_eq!(gateways[0].path.as_deref(), Some("/my-api"));
    assert_eq!(gateways[0].status, GatewayStatus::Active);
    assert_eq!(h.router.resolve("localhost", "/my-api/ping").unwrap().port, 8080);
    assert!(h.engine.container("neploy-my-api_v1-1-0").unwrap().running);
}
