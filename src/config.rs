//! Build configuration for the bytecode backend.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Options controlling document emission. CLI flags override values read
/// from a project's `doof.toml`.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Emit the debug section (source map, function/variable records)
    pub emit_debug: bool,
    /// Fixed value for the document's generatedAt field; defaults to the
    /// unix timestamp at invocation
    pub generated_at: Option<String>,
    /// Output path for the document
    pub output: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            emit_debug: true,
            generated_at: None,
            output: None,
        }
    }
}

impl BuildOptions {
    pub fn generated_at(&self) -> String {
        match &self.generated_at {
            Some(value) => value.clone(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs().to_string())
                .unwrap_or_else(|_| "0".to_string()),
        }
    }

    /// Load the `[build]` table from a `doof.toml` in the given directory.
    pub fn load(dir: &Path) -> Result<Self, String> {
        let path = dir.join("doof.toml");
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    /// Load `doof.toml` when present, otherwise the defaults.
    pub fn load_or_default(dir: &Path) -> Self {
        if dir.join("doof.toml").exists() {
            Self::load(dir).unwrap_or_default()
        } else {
            Self::default()
        }
    }

    fn from_toml_str(content: &str) -> Result<Self, String> {
        let file: ManifestFile =
            toml::from_str(content).map_err(|e| format!("failed to parse doof.toml: {}", e))?;
        Ok(Self {
            emit_debug: file.build.debug,
            generated_at: file.build.generated_at,
            output: file.build.output,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    build: BuildTable,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct BuildTable {
    debug: bool,
    generated_at: Option<String>,
    output: Option<PathBuf>,
}

impl Default for BuildTable {
    fn default() -> Self {
        Self {
            debug: true,
            generated_at: None,
            output: None,
        }
    }
}
