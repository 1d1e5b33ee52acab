//! Engine artifact resolution.
//!
//! Each packaging model gets its own [`EngineLocator`]:
//! - **NativeDirLocator**: executable extracted into the app's native-library
//!   directory (Android `nativeLibraryDir`)
//! - **LinkedLocator**: engine linked into the app binary (iOS framework)
//! - **FixedPathLocator**: explicit path (desktop, development)
//!
//! Resolution is a read-only filesystem probe and may be repeated freely.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::process::InProcessEngine;

/// Target the engine was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PlatformId {
    pub os: &'static str,
    pub arch: &'static str,
}

impl PlatformId {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// Handle to an engine linked into the application.
#[derive(Clone)]
pub struct LinkedEngine {
    name: String,
    engine: Arc<dyn InProcessEngine>,
}

impl LinkedEngine {
    pub fn new(name: impl Into<String>, engine: Arc<dyn InProcessEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn engine(&self) -> &Arc<dyn InProcessEngine> {
        &self.engine
    }
}

impl fmt::Debug for LinkedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedEngine")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ArtifactLocation {
    Executable(PathBuf),
    Linked(LinkedEngine),
}

/// A resolved engine. Immutable; re-resolved only on a cold start.
#[derive(Debug, Clone)]
pub struct EngineArtifact {
    pub platform: PlatformId,
    pub location: ArtifactLocation,
    pub version: Option<String>,
}

impl EngineArtifact {
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            ArtifactLocation::Executable(path) => Some(path),
            ArtifactLocation::Linked(_) => None,
        }
    }
}

impl fmt::Display for EngineArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            ArtifactLocation::Executable(path) => write!(f, "{} ({})", path.display(), self.platform),
            ArtifactLocation::Linked(linked) => write!(f, "linked:{} ({})", linked.name, self.platform),
        }
    }
}

/// Platform capability that finds the engine to run.
pub trait EngineLocator: Send + Sync {
    fn resolve(&self) -> Result<EngineArtifact>;
}

fn check_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| BridgeError::ArtifactNotFound(format!("{}: {e}", path.display())))?;
    if !metadata.is_file() {
        return Err(BridgeError::ArtifactNotExecutable {
            path: path.to_path_buf(),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(BridgeError::ArtifactNotExecutable {
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Finds the engine among the files of a native-library directory.
pub struct NativeDirLocator {
    dir: PathBuf,
    stem: String,
    platform: PlatformId,
    version: Option<String>,
}

impl NativeDirLocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stem: "pikafish".to_string(),
            platform: PlatformId::current(),
            version: None,
        }
    }

    pub fn with_stem(mut self, stem: impl Into<String>) -> Self {
        self.stem = stem.into();
        self
    }

    pub fn with_platform(mut self, platform: PlatformId) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// File names accepted as the engine, most specific first.
    pub fn candidates(&self) -> Vec<String> {
        let (stem, arch) = (&self.stem, self.platform.arch);
        let exe = if self.platform.os == "windows" { ".exe" } else { "" };
        vec![
            format!("lib{stem}_{arch}.so"),
            format!("{stem}-{arch}{exe}"),
            format!("lib{stem}.so"),
            format!("{stem}{exe}"),
        ]
    }
}

impl EngineLocator for NativeDirLocator {
    fn resolve(&self) -> Result<EngineArtifact> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            BridgeError::ArtifactNotFound(format!("{}: {e}", self.dir.display()))
        })?;

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            tracing::debug!(dir = %self.dir.display(), file = %name, "Native library directory entry");
            names.push(name);
        }

        let candidates = self.candidates();
        let Some(found) = candidates.iter().find(|c| names.contains(c)) else {
            return Err(BridgeError::ArtifactNotFound(format!(
                "none of {candidates:?} in {}",
                self.dir.display()
            )));
        };

        let path = self.dir.join(found);
        check_executable(&path)?;
        tracing::info!(path = %path.display(), platform = %self.platform, "Resolved engine artifact");

        Ok(EngineArtifact {
            platform: self.platform,
            location: ArtifactLocation::Executable(path),
            version: self.version.clone(),
        })
    }
}

/// Resolves a single explicit engine path.
pub struct FixedPathLocator {
    path: PathBuf,
}

impl FixedPathLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EngineLocator for FixedPathLocator {
    fn resolve(&self) -> Result<EngineArtifact> {
        check_executable(&self.path)?;
        Ok(EngineArtifact {
            platform: PlatformId::current(),
            location: ArtifactLocation::Executable(self.path.clone()),
            version: None,
        })
    }
}

/// Resolves to an engine linked into the application.
pub struct LinkedLocator {
    engine: LinkedEngine,
    version: Option<String>,
}

impl LinkedLocator {
    pub fn new(name: impl Into<String>, engine: Arc<dyn InProcessEngine>) -> Self {
        Self {
            engine: LinkedEngine::new(name, engine),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl EngineLocator for LinkedLocator {
    fn resolve(&self) -> Result<EngineArtifact> {
        Ok(EngineArtifact {
            platform: PlatformId::current(),
            location: ArtifactLocation::Linked(self.engine.clone()),
            version: self.version.clone(),
        })
    }
}
