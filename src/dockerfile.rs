//! Dockerfile synthesis and exposed-port negotiation

use crate::detector::Stack;
use crate::error::{Error, Result};
use crate::notify::{ActionMessage, Input, NotificationHub, Severity};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Port assumed when a Dockerfile has no EXPOSE line
pub const DEFAULT_PORT: &str = "3000";

/// A built-in Dockerfile recipe
#[derive(Debug)]
pub struct Template {
    pub base_image: &'static str,
    pub workdir: &'static str,
    /// Instructions run before the source tree is copied in
    pub install: &'static [&'static str],
    pub build: Option<&'static str>,
    pub cmd: &'static [&'static str],
    pub port: u16,
    pub env: &'static [(&'static str, &'static str)],
}

const NODE: Template = Template {
    base_image: "node:18-alpine",
    workdir: "/app",
    install: &["COPY package*.json ./", "RUN npm install"],
    build: None,
    cmd: &["npm", "start"],
    port: 3000,
    env: &[("NODE_ENV", "production")],
};

const PYTHON: Template = Template {
    base_image: "python:3.11-slim",
    workdir: "/app",
    install: &[
        "COPY requirements.txt ./",
        "RUN pip install --no-cache-dir -r requirements.txt",
    ],
    build: None,
    cmd: &["python", "app.py"],
    port: 8000,
    env: &[("PYTHONUNBUFFERED", "1")],
};

const GO: Template = Template {
    base_image: "golang:1.21-alpine",
    workdir: "/app",
    install: &["COPY go.mod go.sum* ./", "RUN go mod download"],
    build: Some("go build -o main ."),
    cmd: &["./main"],
    port: 8080,
    env: &[],
};

pub fn template_for(stack: Stack) -> Option<&'static Template> {
    match stack {
        Stack::NodeJs => Some(&NODE),
        Stack::Python => Some(&PYTHON),
        Stack::Go => Some(&GO),
        _ => None,
    }
}

impl Template {
    pub fn render(&self) -> String {
        let mut out = format!("FROM {}\n\nWORKDIR {}\n\n", self.base_image, self.workdir);
        for line in self.install {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("\nCOPY . .\n");
        if let Some(build) = self.build {
            out.push_str(&format!("RUN {build}\n"));
        }
        out.push('\n');
        for (key, value) in self.env {
            out.push_str(&format!("ENV {key}={value}\n"));
        }
        out.push_str(&format!("EXPOSE {}\n\n", self.port));

        let cmd = self
            .cmd
            .iter()
            .map(|part| format!("\"{part}\""))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("CMD [{cmd}]\n"));
        out
    }
}

/// Render the template for `stack` into `dir/Dockerfile`
pub fn synthesize(dir: &Path, stack: Stack) -> Result<PathBuf> {
    let template = template_for(stack).ok_or_else(|| Error::NoTemplateForStack(stack.to_string()))?;
    let path = dir.join("Dockerfile");
    write_file(&path, template.render().as_bytes())?;

    info!(path = %path.display(), stack = %stack, "Generated Dockerfile");
    Ok(path)
}

/// First file literally named `Dockerfile` under `dir`
pub fn find_dockerfile(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == "Dockerfile")
        .map(|entry| entry.into_path())
}

fn is_expose(line: &str) -> bool {
    let mut words = line.split_whitespace();
    words
        .next()
        .map(|w| w.eq_ignore_ascii_case("EXPOSE"))
        .unwrap_or(false)
        && words.next().is_some()
}

/// Port from the first EXPOSE line, or [`DEFAULT_PORT`]
pub fn exposed_port(content: &str) -> String {
    content
        .lines()
        .find(|line| is_expose(line))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|port| port.split('/').next().unwrap_or(port).to_string())
        .unwrap_or_else(|| DEFAULT_PORT.to_string())
}

/// Rewrite the first EXPOSE line, appending one when there is none
pub fn set_exposed_port(content: &str, port: &str) -> String {
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if !replaced && is_expose(line) {
                replaced = true;
                format!("EXPOSE {port}")
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        lines.push(format!("EXPOSE {port}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Settle the port a Dockerfile exposes
///
/// Without `interactive` the parsed port is returned as is. Otherwise the
/// interactive client is asked to confirm it and the Dockerfile is rewritten
/// with the answer.
pub async fn negotiate_port(
    dockerfile: &Path,
    interactive: bool,
    hub: &NotificationHub,
) -> Result<String> {
    let content = tokio::fs::read_to_string(dockerfile).await?;
    let candidate = exposed_port(&content);
    if !interactive {
        debug!(port = %candidate, "Using port from Dockerfile");
        return Ok(candidate);
    }

    let answers = hub
        .ask(ActionMessage {
            severity: Severity::Critical,
            action: "expose".to_string(),
            title: "Exposed port".to_string(),
            message: format!(
                "Which port does the application listen on? The Dockerfile suggests {candidate}."
            ),
            inputs: vec![Input::text("port", &candidate).with_value(candidate.clone())],
        })
        .await?;

    let port = answers
        .get("port")
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::InvalidInput("answer is missing 'port'".into()))?;
    if port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
        return Err(Error::InvalidInput(format!("'{port}' is not a valid port")));
    }

    let rewritten = set_exposed_port(&content, &port);
    let path = dockerfile.to_path_buf();
    tokio::task::spawn_blocking(move || write_file(&path, rewritten.as_bytes()))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    info!(port = %port, "Exposed port confirmed by operator");
    Ok(port)
}

/// Write a file readable by everyone and writable by the owner
pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}
