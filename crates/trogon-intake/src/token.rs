use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::env::ReadEnv;
use crate::error::ConfigError;

/// The `[token]` table of a product file, as written on disk.
///
/// An unknown `strategy` fails deserialization, so it surfaces as a
/// [`ConfigError`] while the catalog loads rather than on a request.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TokenSettings {
    None,
    Static {
        #[serde(default)]
        value: Option<String>,
        /// Name of an environment variable holding the secret.
        #[serde(default)]
        value_env: Option<String>,
    },
}

impl TokenSettings {
    /// Resolves the settings into a ready-to-use strategy, reading
    /// `value_env` through `env`.
    pub fn resolve<E: ReadEnv>(
        &self,
        product: &str,
        env: &E,
    ) -> Result<TokenStrategy, ConfigError> {
        match self {
            Self::None => Ok(TokenStrategy::None),
            Self::Static { value, value_env } => {
                let secret = match (value, value_env) {
                    (Some(value), None) => value.clone(),
                    (None, Some(var)) => env.var(var).map_err(|_| {
                        let reason = format!("token.value_env names unset variable {var}");
                        ConfigError::invalid(product, reason)
                    })?,
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::invalid(
                            product,
                            "token.value and token.value_env are mutually exclusive",
                        ));
                    }
                    (None, None) => {
                        return Err(ConfigError::invalid(
                            product,
                            "static token strategy needs token.value or token.value_env",
                        ));
                    }
                };
                if secret.is_empty() {
                    return Err(ConfigError::invalid(
                        product,
                        "static token must not be empty",
                    ));
                }
                Ok(TokenStrategy::Static { secret })
            }
        }
    }
}

/// How a product authorizes uploads.
///
/// Closed set: adding a strategy means adding a variant here and handling it
/// in [`TokenStrategy::verify`].
#[derive(Clone)]
pub enum TokenStrategy {
    /// Every request is authorized. Only for intentionally public products.
    None,
    /// The presented credential must equal `secret`.
    Static { secret: String },
}

impl TokenStrategy {
    /// Decides whether `presented` authorizes a request.
    ///
    /// The static comparison runs in constant time with respect to the
    /// secret's contents.
    pub fn verify(&self, presented: Option<&str>) -> bool {
        match self {
            Self::None => true,
            Self::Static { secret } => presented
                .is_some_and(|token| token.as_bytes().ct_eq(secret.as_bytes()).into()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Static { .. } => "static",
        }
    }
}

impl std::fmt::Debug for TokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Static { .. } => f.debug_struct("Static").field("secret", &"<redacted>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::InMemoryEnv;

    fn static_token(secret: &str) -> TokenStrategy {
        TokenStrategy::Static {
            secret: secret.to_string(),
        }
    }

    #[test]
    fn none_accepts_anything() {
        let strategy = TokenStrategy::None;
        assert!(strategy.verify(None));
        assert!(strategy.verify(Some("")));
        assert!(strategy.verify(Some("whatever")));
    }

    #[test]
    fn static_accepts_exact_secret() {
        assert!(static_token("s3cr3t").verify(Some("s3cr3t")));
    }

    #[test]
    fn static_rejects_one_character_difference() {
        let strategy = static_token("s3cr3t");
        assert!(!strategy.verify(Some("s3cr3T")));
        assert!(!strategy.verify(Some("s3cr3")));
        assert!(!strategy.verify(Some("s3cr3tt")));
    }

    #[test]
    fn static_rejects_missing_credential() {
        assert!(!static_token("s3cr3t").verify(None));
        assert!(!static_token("s3cr3t").verify(Some("")));
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", static_token("hunter2"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn deserializes_known_strategies() {
        let none: TokenSettings = toml::from_str(r#"strategy = "none""#).unwrap();
        assert!(matches!(none, TokenSettings::None));

        let fixed: TokenSettings =
            toml::from_str("strategy = \"static\"\nvalue = \"abc\"").unwrap();
        assert!(matches!(
            fixed,
            TokenSettings::Static { value: Some(ref v), value_env: None } if v == "abc"
        ));
    }

    #[test]
    fn unknown_strategy_fails_to_deserialize() {
        let result = toml::from_str::<TokenSettings>(r#"strategy = "oauth""#);
        assert!(result.is_err());
    }

    #[test]
    fn resolve_reads_secret_from_env() {
        let env = InMemoryEnv::new();
        env.set("WEB_TOKEN", "from-env");
        let settings = TokenSettings::Static {
            value: None,
            value_env: Some("WEB_TOKEN".to_string()),
        };

        let strategy = settings.resolve("web", &env).unwrap();
        assert!(strategy.verify(Some("from-env")));
    }

    #[test]
    fn resolve_rejects_unset_env_var() {
        let settings = TokenSettings::Static {
            value: None,
            value_env: Some("MISSING_TOKEN".to_string()),
        };

        let err = settings.resolve("web", &InMemoryEnv::new()).unwrap_err();
        assert!(err.to_string().contains("MISSING_TOKEN"));
    }

    #[test]
    fn resolve_rejects_empty_and_ambiguous_secrets() {
        let env = InMemoryEnv::new();
        let empty = TokenSettings::Static {
            value: Some(String::new()),
            value_env: None,
        };
        let neither = TokenSettings::Static {
            value: None,
            value_env: None,
        };
        let both = TokenSettings::Static {
            value: Some("a".to_string()),
            value_env: Some("B".to_string()),
        };

        assert!(empty.resolve("web", &env).is_err());
        assert!(neither.resolve("web", &env).is_err());
        assert!(both.resolve("web", &env).is_err());
    }
}
