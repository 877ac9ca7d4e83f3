//! `trogon-intake product new <name>`: writes a product file template.

use std::fs::{DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::catalog::{PRODUCT_FILE_EXTENSION, PRODUCTS_DIR, is_valid_product_name};

/// Creates `<config_dir>/products/<name>.toml` with a fresh static token.
///
/// Refuses to overwrite an existing product.
pub fn new_product(config_dir: &Path, name: &str) -> Result<PathBuf> {
    if !is_valid_product_name(name) {
        bail!("invalid product name {name:?}: use ASCII letters, digits, '.', '_' or '-'");
    }

    let dir = config_dir.join(PRODUCTS_DIR);
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o740);
    }
    builder.create(&dir).with_context(|| {
        format!("Failed to create products directory {}", dir.display())
    })?;

    let path = dir.join(format!("{name}.{PRODUCT_FILE_EXTENSION}"));
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = match options.open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            bail!("A product named {name} already exists at {}", path.display());
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Cannot open file {} for writing", path.display())
            });
        }
    };

    let template = product_template(name, &generate_token());
    file.write_all(template.as_bytes()).with_context(|| {
        format!("An error occurred while writing to file {}", path.display())
    })?;

    Ok(path)
}

fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn product_template(name: &str, token: &str) -> String {
    format!(
        r#"# Product "{name}".
#
# Upload with:
#   curl -H "Authorization: Bearer <token>" -F artifact=@build.tar.gz \
#        http://localhost:8080/v1/upload/{name}

# Executable run once per upload with ARTIFACT_PATH set to the staged file.
# Relative paths resolve against the config directory. Leave empty to only
# accept the upload.
script = ""

# Seconds before the script is terminated. Defaults to INTAKE_PIPELINE_TIMEOUT_SECS.
# timeout_secs = 600

# Uncomment to run at most this many pipelines for {name} at once.
# max_concurrent_pipelines = 1

[token]
# "none" accepts every upload; "static" requires the value below
# (or value_env = "SOME_VAR" to read it from the environment).
strategy = "static"
value = "{token}"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProductCatalog;
    use crate::env::InMemoryEnv;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn scaffolded_product_loads_with_a_static_token() {
        let dir = TempDir::new().unwrap();

        let path = new_product(dir.path(), "web").unwrap();
        assert_eq!(path, dir.path().join("products").join("web.toml"));

        let catalog =
            ProductCatalog::load(dir.path(), &InMemoryEnv::new(), Duration::from_secs(60)).unwrap();
        let web = catalog.lookup("web").unwrap();
        assert_eq!(web.token().kind(), "static");
        assert_eq!(web.script(), None);
        assert!(!web.token().verify(None));
    }

    #[test]
    fn refuses_to_overwrite_existing_product() {
        let dir = TempDir::new().unwrap();
        let path = new_product(dir.path(), "web").unwrap();
        let original = std::fs::read_to_string(&path).unwrap();

        let err = new_product(dir.path(), "web").unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        assert!(new_product(dir.path(), "../escape").is_err());
        assert!(new_product(dir.path(), "").is_err());
        assert!(!dir.path().join("products").exists());
    }

    #[test]
    fn each_product_gets_its_own_token() {
        assert_ne!(generate_token(), generate_token());
        assert_eq!(generate_token().len(), 32);
    }

    #[cfg(unix)]
    #[test]
    fn product_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = new_product(dir.path(), "web").unwrap();

        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
