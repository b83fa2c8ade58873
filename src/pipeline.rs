//! Deployment pipeline
//!
//! Turns a git branch or an uploaded archive into a running container published
//! on the gateway: acquire the source, detect the stack, settle the Dockerfile
//! and its port, record the version, build, run and route. Progress is
//! broadcast on the hub at each milestone. A failure is broadcast as the last
//! progress message, marks an already recorded version as `error` and is
//! returned to the caller; staged files are left in place.

use crate::config::Config;
use crate::db::{Application, ApplicationVersion, Database, Gateway, GatewayStatus, VersionStatus};
use crate::detector::{self, Stack};
use crate::dockerfile;
use crate::engine::{forward_logs, ContainerEngine};
use crate::error::{Error, Result};
use crate::git;
use crate::notify::NotificationHub;
use crate::router::Router;
use hyper::body::Bytes;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^A-Za-z0-9-]").expect("invalid slug pattern"));

/// Directory and container friendly projection of an application name
pub fn sanitize(name: &str) -> String {
    NON_SLUG
        .replace_all(&name.replace(' ', "-"), "")
        .to_lowercase()
}

/// `neploy-<app>_v<tag without leading v, dots as dashes>`
pub fn container_name(app_name: &str, tag: &str) -> String {
    let version = tag.strip_prefix('v').unwrap_or(tag).replace('.', "-");
    format!("neploy-{}_v{}", sanitize(app_name), version)
}

pub fn image_tag(app_name: &str, tag: &str) -> String {
    format!("neploy-{}:{}", sanitize(app_name), tag)
}

pub(crate) fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidInput(format!("non UTF-8 path {}", path.display())))
}

fn blocking_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Unpack `archive` into `dest`, rejecting entries that would land outside it
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        Error::InvalidInput(format!(
            "{} is not a valid zip archive: {}",
            archive.display(),
            e
        ))
    })?;

    std::fs::create_dir_all(dest)?;
    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::InvalidInput(format!(
                "archive entry '{}' escapes the target directory",
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        files += 1;
    }
    Ok(files)
}

/// Empty `dir` of a previous upload, sparing the git checkouts in `keep`
fn clear_upload_tree(dir: &Path, keep: &[PathBuf]) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if keep.iter().any(|k| k == &path) {
            continue;
        }
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    debug!(path = %dir.display(), "Cleared previous upload");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub upload_root: PathBuf,
    /// Domain of the gateway each deployment publishes
    pub domain: String,
    /// Confirm the exposed port with the interactive client
    pub interactive: bool,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        let root = &config.storage.upload_root;
        Self {
            upload_root: std::path::absolute(root).unwrap_or_else(|_| root.clone()),
            domain: config.gateway.domain.clone(),
            interactive: config.deploy.interactive,
        }
    }
}

/// Progress of one pipeline run
struct Run<'a> {
    hub: &'a NotificationHub,
    progress: u8,
    version_id: Option<String>,
}

impl<'a> Run<'a> {
    fn new(hub: &'a NotificationHub) -> Self {
        Self {
            hub,
            progress: 0,
            version_id: None,
        }
    }

    fn step(&mut self, progress: u8, message: &str) {
        self.progress = progress;
        self.hub.broadcast_progress(progress, message);
    }
}

pub struct Pipeline {
    db: Database,
    engine: Arc<dyn ContainerEngine>,
    router: Arc<Router>,
    hub: Arc<NotificationHub>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        db: Database,
        engine: Arc<dyn ContainerEngine>,
        router: Arc<Router>,
        hub: Arc<NotificationHub>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            engine,
            router,
            hub,
            settings,
        }
    }

    /// Deploy the latest tag of `repo_url` (cloned at `branch`) for an application
    pub async fn deploy(
        &self,
        application_id: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<ApplicationVersion> {
        let mut run = Run::new(&self.hub);
        let result = self
            .deploy_from_git(&mut run, application_id, repo_url, branch)
            .await;
        self.settle(run, result)
    }

    /// Deploy an uploaded zip archive for an application
    pub async fn upload(
        &self,
        application_id: &str,
        filename: &str,
        archive: Bytes,
    ) -> Result<ApplicationVersion> {
        let mut run = Run::new(&self.hub);
        let result = self
            .deploy_from_archive(&mut run, application_id, filename, archive)
            .await;
        self.settle(run, result)
    }

    fn settle(&self, run: Run<'_>, result: Result<ApplicationVersion>) -> Result<ApplicationVersion> {
        let err = match result {
            Ok(version) => return Ok(version),
            Err(err) => err,
        };

        error!(error = %err, progress = run.progress, "Deployment failed");
        run.hub.broadcast_progress(run.progress, &err.to_string());
        if let Some(version_id) = run.version_id {
            if let Err(e) = self.db.update_version_status(&version_id, VersionStatus::Error) {
                warn!(version_id = %version_id, error = %e, "Failed to mark version as errored");
            }
        }
        Err(err)
    }

    async fn deploy_from_git(
        &self,
        run: &mut Run<'_>,
        application_id: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<ApplicationVersion> {
        git::validate_source(repo_url, branch)?;
        let app = self.db.get_application(application_id)?;

        let tags = git::list_remote_tags(repo_url).await?;
        let tag = git::latest_tag(&tags).unwrap_or(git::INITIAL_TAG).to_string();
        info!(app = %app.name, tag = %tag, repo = repo_url, branch, "Deploying from git");

        let base = self.settings.upload_root.join(sanitize(&app.name));
        let version_path = base.join(&tag);
        tokio::fs::create_dir_all(&base).await?;
        if tokio::fs::try_exists(&version_path).await? {
            debug!(path = %version_path.display(), "Removing previous checkout");
            tokio::fs::remove_dir_all(&version_path).await?;
        }

        git::clone_branch(repo_url, branch, &version_path).await?;
        set_dir_mode(&version_path)?;

        self.build_and_publish(run, &app, &tag, &version_path).await
    }

    async fn deploy_from_archive(
        &self,
        run: &mut Run<'_>,
        application_id: &str,
        filename: &str,
        archive: Bytes,
    ) -> Result<ApplicationVersion> {
        let file_name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.to_ascii_lowercase().ends_with(".zip"))
            .ok_or_else(|| {
                Error::InvalidInput(format!("'{}' is not a .zip archive", filename))
            })?
            .to_string();

        let app = self.db.get_application(application_id)?;
        let root = self.settings.upload_root.clone();
        tokio::fs::create_dir_all(&root).await?;

        let zip_path = root.join(&file_name);
        tokio::fs::write(&zip_path, &archive).await?;
        info!(app = %app.name, archive = %zip_path.display(), size = archive.len(), "Saved upload");

        let app_dir = root.join(sanitize(&app.name));
        let checkouts: Vec<PathBuf> = self
            .db
            .get_versions_for_application(&app.id)?
            .into_iter()
            .map(|v| PathBuf::from(v.storage_location))
            .filter(|p| p != &app_dir)
            .collect();
        let files = {
            let zip_path = zip_path.clone();
            let app_dir = app_dir.clone();
            tokio::task::spawn_blocking(move || {
                clear_upload_tree(&app_dir, &checkouts)?;
                extract_zip(&zip_path, &app_dir)
            })
            .await
            .map_err(blocking_error)??
        };
        tokio::fs::remove_file(&zip_path).await?;
        debug!(files, dest = %app_dir.display(), "Extracted upload");

        let existing: Vec<String> = self
            .db
            .get_versions_for_application(&app.id)?
            .into_iter()
            .map(|v| v.version_tag)
            .collect();
        let tag = git::next_patch_tag(&existing);

        self.build_and_publish(run, &app, &tag, &app_dir).await
    }

    async fn detect_stack(dir: &Path) -> Result<Stack> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || detector::detect(&dir))
            .await
            .map_err(blocking_error)?
    }

    /// Stages shared by both sources, once the tree is staged in `dir`
    async fn build_and_publish(
        &self,
        run: &mut Run<'_>,
        app: &Application,
        tag: &str,
        dir: &Path,
    ) -> Result<ApplicationVersion> {
        let location = path_str(dir)?;

        let stack = Self::detect_stack(dir).await?;
        let tech_stack = self.db.find_or_create_tech_stack(stack.name())?;
        self.db.set_application_tech_stack(&app.id, &tech_stack.id)?;
        self.db.set_application_storage(&app.id, location)?;
        info!(app = %app.name, stack = %stack, "Detected stack");

        run.step(0, "Checking for Dockerfile...");
        let dockerfile = match dockerfile::find_dockerfile(dir) {
            Some(path) => {
                debug!(path = %path.display(), "Using existing Dockerfile");
                path
            }
            None => dockerfile::synthesize(dir, stack)?,
        };

        let port_text =
            dockerfile::negotiate_port(&dockerfile, self.settings.interactive, &self.hub).await?;
        let port = port_text
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::InvalidInput(format!("'{}' is not a valid port", port_text)))?;
        run.step(20, "Dockerfile ready");

        if let Some(previous) = self.db.find_version_by_tag(&app.id, tag)? {
            debug!(version_id = %previous.id, tag, "Replacing version with the same tag");
            self.db.delete_version(&previous.id)?;
        }
        let version = self
            .db
            .insert_version(&ApplicationVersion::new(&app.id, tag, location))?;
        run.version_id = Some(version.id.clone());

        run.step(40, "Building image...");
        let image = image_tag(&app.name, tag);
        self.engine.build(dir, &dockerfile, &image).await?;

        run.step(70, "Starting container...");
        let name = container_name(&app.name, tag);
        let container_id = self.create_or_reuse(&image, &name, port).await?;
        self.engine.start(&container_id).await?;
        forward_logs(Arc::clone(&self.engine), container_id, name);

        run.step(90, "Publishing route...");
        let slug = sanitize(&app.name);
        let wanted = Gateway::for_path(
            &app.id,
            &format!("{}-gateway", slug),
            &self.settings.domain,
            &format!("/{}", slug),
            port,
        );
        let key = wanted.to_route().key();
        if let Some(owner) = self.db.find_gateway_by_route_key(&key)? {
            if owner.name != wanted.name {
                return Err(Error::Conflict(format!(
                    "route {} is already published by gateway '{}'",
                    key, owner.name
                )));
            }
        }
        let gateway = self.db.upsert_gateway(&wanted)?;
        if let Err(e) = self.router.add_route(gateway.to_route()) {
            self.db.update_gateway_status(&gateway.id, GatewayStatus::Error)?;
            return Err(e);
        }

        run.step(100, "Deployment complete!");
        info!(app = %app.name, tag, port, "Deployment complete");
        Ok(version)
    }

    /// Create the container, or adopt the one already holding its name
    async fn create_or_reuse(&self, image: &str, name: &str, port: u16) -> Result<String> {
        match self.engine.create(image, name, port).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_in_use() => {
                info!(container = name, "Container name in use, reusing existing container");
                self.engine
                    .resolve_by_name(name)
                    .await?
                    .ok_or_else(|| Error::Engine(format!("container {} vanished", name)))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("My Api"), "my-api");
        assert_eq!(sanitize("Shop_Front (beta)!"), "shopfront-beta");
        assert_eq!(sanitize("already-ok-42"), "already-ok-42");
    }

    #[test]
    fn test_naming() {
        assert_eq!(container_name("My Api", "v1.1.0"), "neploy-my-api_v1-1-0");
        assert_eq!(container_name("demo", "2.0.0"), "neploy-demo_v2-0-0");
        assert_eq!(image_tag("My Api", "v1.1.0"), "neploy-my-api:v1.1.0");
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("demo.zip");
        write_zip(
            &archive,
            &[("package.json", "{}"), ("src/index.js", "console.log(1)")],
        );

        let dest = dir.path().join("demo");
        assert_eq!(extract_zip(&archive, &dest).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(dest.join("package.json")).unwrap(), "{}");
        assert!(dest.join("src/index.js").is_file());
    }

    #[test]
    fn test_extract_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../evil.txt", "x")]);

        let err = extract_zip(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_clear_upload_tree_spares_checkouts() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("demo");
        std::fs::create_dir_all(app_dir.join("v1.1.0")).unwrap();
        std::fs::create_dir_all(app_dir.join("src")).unwrap();
        std::fs::write(app_dir.join("package.json"), "{}").unwrap();
        std::fs::write(app_dir.join("src/index.js"), "").unwrap();

        clear_upload_tree(&app_dir, &[app_dir.join("v1.1.0")]).unwrap();

        assert!(app_dir.join("v1.1.0").is_dir());
        assert!(!app_dir.join("package.json").exists());
        assert!(!app_dir.join("src").exists());
        clear_upload_tree(&dir.path().join("missing"), &[]).unwrap();
    }

    #[test]
    fn test_extract_rejects_non_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fake.zip");
        std::fs::write(&archive, "not a zip").unwrap();

        let err = extract_zip(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
