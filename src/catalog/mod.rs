//! Static model catalog.
//!
//! The catalog file is an immutable input: a JSON document with three nested
//! tiers (family → size → build) where descriptive fields may appear at any
//! tier. All tiers are merged into flat [`ModelVariant`] descriptors once, at
//! load time, in a fixed order: build overrides size overrides family for
//! scalar fields; launch arguments concatenate family → size → build.

pub mod variant;

pub use variant::{ArtifactKind, ArtifactSource, ModelVariant};

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{KeepError, Result};

#[derive(Debug, Deserialize)]
struct RawCatalog {
    families: Vec<RawFamily>,
}

#[derive(Debug, Deserialize)]
struct RawFamily {
    name: String,
    #[serde(default)]
    overhead_multiplier: Option<f64>,
    #[serde(default)]
    kv_bytes_per_1k: Option<u64>,
    #[serde(default)]
    launch_args: Vec<String>,
    #[serde(default)]
    projection_url: Option<String>,
    sizes: Vec<RawSize>,
}

#[derive(Debug, Deserialize)]
struct RawSize {
    label: String,
    #[serde(default)]
    max_context: Option<u32>,
    #[serde(default)]
    overhead_multiplier: Option<f64>,
    #[serde(default)]
    kv_bytes_per_1k: Option<u64>,
    #[serde(default)]
    launch_args: Vec<String>,
    #[serde(default)]
    projection_url: Option<String>,
    builds: Vec<RawBuild>,
}

#[derive(Debug, Deserialize)]
struct RawBuild {
    id: String,
    quantization: String,
    #[serde(default)]
    full_precision: bool,
    file_size_bytes: u64,
    url: String,
    #[serde(default)]
    shard_urls: Vec<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    max_context: Option<u32>,
    #[serde(default)]
    overhead_multiplier: Option<f64>,
    #[serde(default)]
    kv_bytes_per_1k: Option<u64>,
    #[serde(default)]
    launch_args: Vec<String>,
    #[serde(default)]
    projection_url: Option<String>,
}

/// Loaded, normalized catalog. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Catalog {
    variants: Vec<ModelVariant>,
}

impl Catalog {
    /// Load and normalize a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            KeepError::Catalog(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse catalog JSON and resolve all tiers.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawCatalog = serde_json::from_str(json)
            .map_err(|e| KeepError::Catalog(format!("invalid catalog JSON: {e}")))?;

        let mut variants = Vec::new();
        for family in &raw.families {
            for size in &family.sizes {
                for build in &size.builds {
                    variants.push(resolve(family, size, build)?);
                }
            }
        }

        // Variant ids are the global key for jobs and status maps.
        for i in 1..variants.len() {
            let id = &variants[i].id;
            if variants[..i].iter().any(|v| &v.id == id) {
                return Err(KeepError::Catalog(format!("duplicate variant id '{id}'")));
            }
        }

        Ok(Self { variants })
    }

    #[must_use]
    pub fn variants(&self) -> &[ModelVariant] {
        &self.variants
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&ModelVariant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Find a variant or fail with a `NotFound` error naming the id.
    pub fn get(&self, id: &str) -> Result<&ModelVariant> {
        self.find(id)
            .ok_or_else(|| KeepError::NotFound(format!("model '{id}' not in catalog")))
    }
}

/// Merge one build with its enclosing tiers. Innermost `Some` wins for
/// scalars; launch args concatenate outermost-first so inner tiers append.
fn resolve(family: &RawFamily, size: &RawSize, build: &RawBuild) -> Result<ModelVariant> {
    let max_context = build
        .max_context
        .or(size.max_context)
        .ok_or_else(|| {
            KeepError::Catalog(format!(
                "build '{}' resolves no max_context at any tier",
                build.id
            ))
        })?;

    let overhead_multiplier = build
        .overhead_multiplier
        .or(size.overhead_multiplier)
        .or(family.overhead_multiplier)
        .unwrap_or(1.0);

    let kv_bytes_per_1k = build
        .kv_bytes_per_1k
        .or(size.kv_bytes_per_1k)
        .or(family.kv_bytes_per_1k)
        .unwrap_or(0);

    let projection_url = build
        .projection_url
        .clone()
        .or_else(|| size.projection_url.clone())
        .or_else(|| family.projection_url.clone());

    let mut launch_args = family.launch_args.clone();
    launch_args.extend(size.launch_args.iter().cloned());
    launch_args.extend(build.launch_args.iter().cloned());

    Ok(ModelVariant {
        id: build.id.clone(),
        family: family.name.clone(),
        size_label: size.label.clone(),
        max_context,
        file_size_bytes: build.file_size_bytes,
        kv_bytes_per_1k,
        overhead_multiplier,
        quantization: build.quantization.clone(),
        full_precision: build.full_precision,
        sha256: build.sha256.clone(),
        launch_args,
        main_url: build.url.clone(),
        shard_urls: build.shard_urls.clone(),
        projection_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "families": [
            {
                "name": "testfam",
                "overhead_multiplier": 1.1,
                "kv_bytes_per_1k": 1048576,
                "launch_args": ["--flash-attn"],
                "sizes": [
                    {
                        "label": "7b",
                        "max_context": 32768,
                        "launch_args": ["--parallel", "1"],
                        "builds": [
                            {
                                "id": "testfam-7b-q4",
                                "quantization": "Q4_K_M",
                                "file_size_bytes": 4000000000,
                                "url": "https://host/testfam-7b-q4.gguf"
                            },
                            {
                                "id": "testfam-7b-f16",
                                "quantization": "F16",
                                "full_precision": true,
                                "file_size_bytes": 14000000000,
                                "url": "https://host/testfam-7b-f16.gguf",
                                "overhead_multiplier": 1.2,
                                "max_context": 16384,
                                "launch_args": ["--no-mmap"]
                            }
                        ]
                    },
                    {
                        "label": "vision-7b",
                        "max_context": 8192,
                        "projection_url": "https://host/mmproj.gguf",
                        "builds": [
                            {
                                "id": "testfam-vision-7b-q4",
                                "quantization": "Q4_K_M",
                                "file_size_bytes": 4500000000,
                                "url": "https://host/vision-7b-q4.gguf"
                            }
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_family_fields_inherited() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let v = catalog.find("testfam-7b-q4").unwrap();
        assert_eq!(v.family, "testfam");
        assert_eq!(v.max_context, 32768);
        assert!((v.overhead_multiplier - 1.1).abs() < 1e-9);
        assert_eq!(v.kv_bytes_per_1k, 1_048_576);
    }

    #[test]
    fn test_build_overrides_outer_tiers() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let v = catalog.find("testfam-7b-f16").unwrap();
        assert!((v.overhead_multiplier - 1.2).abs() < 1e-9);
        assert_eq!(v.max_context, 16384);
        assert!(v.full_precision);
    }

    #[test]
    fn test_launch_args_concatenate_outermost_first() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let v = catalog.find("testfam-7b-f16").unwrap();
        assert_eq!(
            v.launch_args,
            vec!["--flash-attn", "--parallel", "1", "--no-mmap"]
        );
    }

    #[test]
    fn test_projection_attached_at_size_tier() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let v = catalog.find("testfam-vision-7b-q4").unwrap();
        assert_eq!(
            v.projection_url.as_deref(),
            Some("https://host/mmproj.gguf")
        );
        assert!(!v.is_single_file());
    }

    #[test]
    fn test_missing_max_context_is_an_error() {
        let bad = r#"{"families":[{"name":"f","sizes":[{"label":"s","builds":[
            {"id":"x","quantization":"Q4","file_size_bytes":1,"url":"https://h/x.gguf"}
        ]}]}]}"#;
        assert!(Catalog::from_json(bad).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dup = r#"{"families":[{"name":"f","sizes":[{"label":"s","max_context":8192,"builds":[
            {"id":"x","quantization":"Q4","file_size_bytes":1,"url":"https://h/a.gguf"},
            {"id":"x","quantization":"Q8","file_size_bytes":2,"url":"https://h/b.gguf"}
        ]}]}]}"#;
        assert!(Catalog::from_json(dup).is_err());
    }

    #[test]
    fn test_get_unknown_id() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert!(catalog.get("nope").is_err());
    }
}
