//! Technology stack detection
//!
//! Classifies a project tree by tallying indicator files. An exact filename
//! indicator (`go.mod`, `package.json`, ...) claims a file before any extension
//! indicator can, and filename hits outrank plain extension hits when stacks are
//! compared. Remaining ties go to the stack listed first in [`INDICATORS`].

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Canonical stack names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stack {
    Vue,
    React,
    Svelte,
    Python,
    Go,
    Rust,
    Php,
    Java,
    TypeScript,
    NodeJs,
    Angular,
}

impl Stack {
    pub fn name(&self) -> &'static str {
        match self {
            Stack::Vue => "Vue",
            Stack::React => "React",
            Stack::Svelte => "Svelte",
            Stack::Python => "Python",
            Stack::Go => "Go",
            Stack::Rust => "Rust",
            Stack::Php => "PHP",
            Stack::Java => "Java",
            Stack::TypeScript => "TypeScript",
            Stack::NodeJs => "Node.js",
            Stack::Angular => "Angular",
        }
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Indicator {
    stack: Stack,
    filenames: &'static [&'static str],
    extensions: &'static [&'static str],
}

const INDICATORS: &[Indicator] = &[
    Indicator { stack: Stack::Vue, filenames: &[], extensions: &["vue"] },
    Indicator { stack: Stack::React, filenames: &[], extensions: &["jsx", "tsx"] },
    Indicator { stack: Stack::Svelte, filenames: &[], extensions: &["svelte"] },
    Indicator { stack: Stack::Python, filenames: &["requirements.txt"], extensions: &["py"] },
    Indicator { stack: Stack::Go, filenames: &["go.mod"], extensions: &["go"] },
    Indicator { stack: Stack::Rust, filenames: &["Cargo.toml"], extensions: &["rs"] },
    Indicator { stack: Stack::Php, filenames: &["composer.json"], extensions: &["php"] },
    Indicator {
        stack: Stack::Java,
        filenames: &["pom.xml", "build.gradle"],
        extensions: &["java"],
    },
    Indicator { stack: Stack::TypeScript, filenames: &[], extensions: &["ts"] },
    Indicator {
        stack: Stack::NodeJs,
        filenames: &["package.json", "server.js", "app.js", "index.js"],
        extensions: &["js"],
    },
    Indicator { stack: Stack::Angular, filenames: &["app.module.ts"], extensions: &[] },
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    filenames: usize,
    extensions: usize,
}

impl Tally {
    fn total(&self) -> usize {
        self.filenames + self.extensions
    }
}

/// Index into INDICATORS of the stack a file name points at, and whether it
/// matched by exact name
fn classify(file_name: &str) -> Option<(usize, bool)> {
    if let Some(i) = INDICATORS.iter().position(|ind| ind.filenames.contains(&file_name)) {
        return Some((i, true));
    }

    let (stem, ext) = file_name.rsplit_once('.')?;
    let by_prefix = match ext {
        "json" if stem.starts_with("composer") => Some(Stack::Php),
        "toml" if stem.starts_with("Cargo") => Some(Stack::Rust),
        _ => None,
    };
    if let Some(stack) = by_prefix {
        return INDICATORS.iter().position(|ind| ind.stack == stack).map(|i| (i, true));
    }

    INDICATORS
        .iter()
        .position(|ind| ind.extensions.contains(&ext))
        .map(|i| (i, false))
}

/// Detect the dominant stack of the tree rooted at `dir`
pub fn detect(dir: &Path) -> Result<Stack> {
    let mut tallies = [Tally::default(); INDICATORS.len()];

    let walker = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some((index, exact)) = classify(name) {
            if exact {
                tallies[index].filenames += 1;
            } else {
                tallies[index].extensions += 1;
            }
        }
    }

    // max_by_key keeps the last maximum, so walk the table backwards
    let (index, tally) = tallies
        .iter()
        .enumerate()
        .rev()
        .max_by_key(|(_, t)| (t.filenames, t.total()))
        .ok_or_else(|| Error::NoStackDetected(dir.display().to_string()))?;

    if tally.total() == 0 {
        return Err(Error::NoStackDetected(dir.display().to_string()));
    }

    let stack = INDICATORS[index].stack;
    debug!(
        dir = %dir.display(),
        stack = %stack,
        filename_hits = tally.filenames,
        total_hits = tally.total(),
        "Detected stack"
    );
    Ok(stack)
}
