//! Product definitions, loaded once from `<config_dir>/products/*.toml`.
//!
//! The catalog is built before the listener starts and never mutated
//! afterwards, so request handlers share it behind an `Arc` without locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::env::ReadEnv;
use crate::error::ConfigError;
use crate::token::{TokenSettings, TokenStrategy};

pub const PRODUCTS_DIR: &str = "products";
pub const PRODUCT_FILE_EXTENSION: &str = "toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProductFile {
    #[serde(default)]
    script: Option<PathBuf>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    max_concurrent_pipelines: Option<usize>,
    token: TokenSettings,
}

/// A named upload target.
#[derive(Debug)]
pub struct Product {
    name: String,
    script: Option<PathBuf>,
    token: TokenStrategy,
    timeout: Duration,
    max_concurrent_pipelines: Option<usize>,
    pipeline_slots: Option<Arc<Semaphore>>,
}

impl Product {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` means the product has no pipeline step.
    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    pub fn token(&self) -> &TokenStrategy {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_concurrent_pipelines(&self) -> Option<usize> {
        self.max_concurrent_pipelines
    }

    /// Waits for a free pipeline slot when the product limits concurrency.
    ///
    /// Returns `None` for unconstrained products. The slot is released when
    /// the permit is dropped.
    pub async fn acquire_pipeline_slot(&self) -> Option<OwnedSemaphorePermit> {
        let slots = self.pipeline_slots.as_ref()?;
        Arc::clone(slots).acquire_owned().await.ok()
    }
}

#[derive(Debug, Default)]
pub struct ProductCatalog {
    products: HashMap<String, Arc<Product>>,
}

impl ProductCatalog {
    /// Loads every `*.toml` file under `<config_dir>/products/`.
    ///
    /// Fails on the first invalid product; a partially valid catalog is never
    /// returned.
    pub fn load<E: ReadEnv>(
        config_dir: &Path,
        env: &E,
        default_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(config_dir).map_err(|source| ConfigError::ConfigDir {
            path: config_dir.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ConfigError::NotADirectory(config_dir.to_path_buf()));
        }

        let products_dir = config_dir.join(PRODUCTS_DIR);
        if !products_dir.is_dir() {
            warn!(dir = %products_dir.display(), "No products directory, catalog is empty");
            return Ok(Self::default());
        }

        let read_dir_err = |source: std::io::Error| ConfigError::ConfigDir {
            path: products_dir.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&products_dir).map_err(read_dir_err)? {
            let path = entry.map_err(read_dir_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == PRODUCT_FILE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut products = HashMap::with_capacity(paths.len());
        for path in paths {
            let product = load_product(&path, config_dir, env, default_timeout)?;
            debug!(product = %product.name, file = %path.display(), "Product loaded");
            products.insert(product.name.clone(), Arc::new(product));
        }

        Ok(Self { products })
    }

    /// The returned handle can outlive the request that looked it up.
    pub fn lookup(&self, name: &str) -> Option<Arc<Product>> {
        self.products.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Product> {
        self.products.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// Product names double as URL path segments and file stems.
pub fn is_valid_product_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

fn load_product<E: ReadEnv>(
    path: &Path,
    config_dir: &Path,
    env: &E,
    default_timeout: Duration,
) -> Result<Product, ConfigError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !is_valid_product_name(&stem) {
        return Err(ConfigError::InvalidProductName(stem));
    }
    let name = stem;

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadProduct {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ProductFile = toml::from_str(&raw).map_err(|source| ConfigError::ParseProduct {
        path: path.to_path_buf(),
        source,
    })?;

    let token = file.token.resolve(&name, env)?;

    let script = file
        .script
        .filter(|script| !script.as_os_str().is_empty())
        .map(|script| {
            if script.is_relative() {
                config_dir.join(script)
            } else {
                script
            }
        });
    if let Some(script) = &script
        && !script.is_file()
    {
        warn!(product = %name, script = %script.display(), "Pipeline script does not exist yet");
    }

    let timeout = match file.timeout_secs {
        Some(0) => return Err(ConfigError::invalid(&name, "timeout_secs must be >= 1")),
        Some(secs) => Duration::from_secs(secs),
        None => default_timeout,
    };

    let max_concurrent_pipelines = match file.max_concurrent_pipelines {
        Some(0) => {
            return Err(ConfigError::invalid(
                &name,
                "max_concurrent_pipelines must be >= 1",
            ));
        }
        other => other,
    };

    Ok(Product {
        name,
        script,
        token,
        timeout,
        max_concurrent_pipelines,
        pipeline_slots: max_concurrent_pipelines.map(|n| Arc::new(Semaphore::new(n))),
    })
}
