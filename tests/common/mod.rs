//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use hyper::body::Bytes;
use neploy::engine::{ContainerEngine, LogStream};
use neploy::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub id: String,
    pub image: String,
    pub port: u16,
    pub running: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u32,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<String>,
    build_contexts: Vec<PathBuf>,
    fail_builds: bool,
}

/// In-memory container engine; stopped containers vanish the way auto-removed ones do
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_builds(&self) {
        self.state.lock().fail_builds = true;
    }

    /// Pretend a container with this name already exists
    pub fn preexisting(&self, name: &str, image: &str, port: u16) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("existing-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                image: image.to_string(),
                port,
                running: false,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn build_contexts(&self) -> Vec<PathBuf> {
        self.state.lock().build_contexts.clone()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(name).cloned()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn name_of(state: &FakeState, id: &str) -> Option<String> {
        state
            .containers
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(name, _)| name.clone())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build(&self, context: &Path, dockerfile: &Path, image_tag: &str) -> Result<()> {
        self.record(format!("build {}", image_tag));
        self.state.lock().build_contexts.push(context.to_path_buf());
        if !dockerfile.is_file() {
            return Err(Error::Engine(format!("missing {}", dockerfile.display())));
        }
        if self.state.lock().fail_builds {
            return Err(Error::Engine("build failed".into()));
        }
        Ok(())
    }

    async fn create(&self, image_tag: &str, name: &str, exposed_port: u16) -> Result<String> {
        self.record(format!("create {}", name));
        let mut state = self.state.lock();
        if state.containers.contains_key(name) {
            return Err(Error::ContainerInUse(format!(
                "Conflict. The container name \"/{}\" is already in use",
                name
            )));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                image: image_tag.to_string(),
                port: exposed_port,
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id));
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id)
            .ok_or_else(|| Error::Engine(format!("no such container: {}", id)))?;
        if let Some(container) = state.containers.get_mut(&name) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record(format!("stop {}", id));
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id)
            .ok_or_else(|| Error::Engine(format!("no such container: {}", id)))?;
        state.containers.remove(&name);
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.record(format!("pause {}", id));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record(format!("remove {}", id));
        let mut state = self.state.lock();
        match Self::name_of(&state, id) {
            Some(name) => {
                state.containers.remove(&name);
                Ok(())
            }
            None => Err(Error::Engine(format!("no such container: {}", id))),
        }
    }

    async fn resolve_by_name(&self, name: &str) -> Result<Option<String>> {
        Ok(self.state.lock().containers.get(name).map(|c| c.id.clone()))
    }

    async fn logs(&self, _id: &str) -> Result<LogStream> {
        let lines: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"listening\n"))];
        Ok(Box::pin(futures::stream::iter(lines)))
    }
}

/// Wait until something accepts connections on `addr`
pub async fn wait_for(addr: SocketAddr) -> bool {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Write a zip archive of `(name, content)` pairs and return its bytes
pub fn zip_bytes(entries: &[(&str, &str)]) -> Bytes {
    use std::io::Write;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    Bytes::from(cursor.into_inner())
}
