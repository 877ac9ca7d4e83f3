//! Startup errors. Any of these aborts the process before the listener binds.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config directory {}: {source}", path.display())]
    ConfigDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("cannot read product file {}: {source}", path.display())]
    ReadProduct {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse product file {}: {source}", path.display())]
    ParseProduct {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid product name {0:?}: only ASCII letters, digits, '.', '_' and '-' are allowed")]
    InvalidProductName(String),

    #[error("product {product}: {reason}")]
    InvalidProduct { product: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(product: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProduct {
            product: product.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_product_display_names_the_product() {
        let err = ConfigError::invalid("web", "timeout_secs must be >= 1");
        assert_eq!(err.to_string(), "product web: timeout_secs must be >= 1");
    }

    #[test]
    fn parse_error_keeps_source() {
        let source = toml::from_str::<toml::Table>("not = [valid").unwrap_err();
        let err = ConfigError::ParseProduct {
            path: PathBuf::from("/etc/trogon-intake/products/web.toml"),
            source,
        };
        assert!(
            err.to_string()
                .starts_with("cannot parse product file /etc/trogon-intake/products/web.toml")
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
