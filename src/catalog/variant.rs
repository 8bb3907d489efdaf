use std::path::{Path, PathBuf};

/// Role of one downloadable artifact within a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Main,
    Shard,
    Projection,
}

/// One file to acquire for a variant.
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    pub url: String,
    pub kind: ArtifactKind,
    /// Declared byte size, when the catalog knows it exactly. Only the main
    /// file of a single-file variant carries one; shard sizes are approximate.
    pub declared_size: Option<u64>,
}

impl ArtifactSource {
    /// Final on-disk file name, derived from the source URL (artifacts are
    /// stored under their source filenames).
    #[must_use]
    pub fn file_name(&self) -> String {
        let last = self.url.rsplit('/').next().unwrap_or(&self.url);
        let clean = last.split(['?', '#']).next().unwrap_or(last).trim();
        if clean.is_empty() {
            "model.gguf".to_string()
        } else {
            clean.to_string()
        }
    }

    /// Final path inside the storage directory.
    #[must_use]
    pub fn final_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(self.file_name())
    }

    /// Path of the in-flight partial file for this artifact.
    #[must_use]
    pub fn temp_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(format!("{}.part", self.file_name()))
    }
}

/// One downloadable build of a model: a specific size/quantization combination.
///
/// Constructed once from catalog data with all tiers already merged; never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct ModelVariant {
    pub id: String,
    pub family: String,
    pub size_label: String,
    /// Maximum combined prompt+generation tokens this build supports.
    pub max_context: u32,
    /// Total declared size across all artifacts.
    pub file_size_bytes: u64,
    /// KV-cache bytes retained per 1000 tokens of context.
    pub kv_bytes_per_1k: u64,
    /// Multiplier applied to the file size to estimate resident weights.
    pub overhead_multiplier: f64,
    pub quantization: String,
    pub full_precision: bool,
    /// SHA-256 of the main artifact, when the catalog pins one.
    pub sha256: Option<String>,
    /// Extra engine launch arguments, resolved across catalog tiers.
    pub launch_args: Vec<String>,
    pub main_url: String,
    pub shard_urls: Vec<String>,
    pub projection_url: Option<String>,
}

impl ModelVariant {
    /// Declared size in whole mebibytes.
    #[must_use]
    pub fn file_size_mb(&self) -> f64 {
        self.file_size_bytes as f64 / (1024.0 * 1024.0)
    }

    /// True when the variant is a single artifact with an exactly-known size.
    #[must_use]
    pub fn is_single_file(&self) -> bool {
        self.shard_urls.is_empty() && self.projection_url.is_none()
    }

    /// Every artifact this variant needs, main file first.
    #[must_use]
    pub fn sources(&self) -> Vec<ArtifactSource> {
        let single = self.is_single_file();
        let mut out = vec![ArtifactSource {
            url: self.main_url.clone(),
            kind: ArtifactKind::Main,
            declared_size: single.then_some(self.file_size_bytes),
        }];
        for url in &self.shard_urls {
            out.push(ArtifactSource {
                url: url.clone(),
                kind: ArtifactKind::Shard,
                declared_size: None,
            });
        }
        if let Some(url) = &self.projection_url {
            out.push(ArtifactSource {
                url: url.clone(),
                kind: ArtifactKind::Projection,
                declared_size: None,
            });
        }
        out
    }

    /// Final paths of every required local file.
    #[must_use]
    pub fn required_files(&self, models_dir: &Path) -> Vec<PathBuf> {
        self.sources()
            .iter()
            .map(|s| s.final_path(models_dir))
            .collect()
    }

    /// Installed means every required file (main + shards + projection) is
    /// present. Computed by scan, never cached, so out-of-band filesystem
    /// changes are tolerated.
    #[must_use]
    pub fn is_installed(&self, models_dir: &Path) -> bool {
        self.required_files(models_dir).iter().all(|p| p.exists())
    }
}
