//! # trogon-intake
//!
//! Authenticated artifact intake. CI systems upload a build artifact for a
//! named product; the server hands it to that product's pipeline script and
//! reports whether the script succeeded.
//!
//! ## How it works
//!
//! 1. A caller sends `POST /v1/upload/{product}` with a multipart field
//!    `artifact` and a token (`Authorization: Bearer <token>` or `?token=`).
//! 2. The product is looked up in the catalog loaded at startup from
//!    `<config_dir>/products/*.toml`; the token is checked against the
//!    product's strategy (`none` or `static`).
//! 3. The artifact is streamed into a fresh temporary directory.
//! 4. The product's script runs once with `ARTIFACT_PATH` pointing at the
//!    staged file. Exit code 0 is success.
//! 5. The temporary directory is removed, whatever the outcome.
//!
//! ## Responses
//!
//! | Outcome | Status | `error` code |
//! |---|---|---|
//! | script succeeded (or none configured) | 200 | n/a |
//! | malformed upload | 400 | 1 |
//! | bad or missing token | 401 | 3 |
//! | unknown product | 400 | 4 |
//! | staging failed or internal error | 500 | 5 |
//! | script failed | 422 | 8 |
//! | script timed out | 422 | 9 |
//!
//! ## Configuration (env vars)
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `INTAKE_PORT` | `8080` | HTTP listening port |
//! | `INTAKE_CONFIG_DIR` | `/etc/trogon-intake` | Directory holding `products/` |
//! | `INTAKE_STAGING_DIR` | OS temp dir | Parent of per-request staging directories |
//! | `INTAKE_MAX_UPLOAD_BYTES` | `536870912` | Upload body limit |
//! | `INTAKE_PIPELINE_TIMEOUT_SECS` | `600` | Default pipeline timeout |

pub mod catalog;
pub mod config;
pub mod env;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod scaffold;
pub mod server;
pub mod signal;
pub mod staging;
pub mod token;

pub use catalog::{Product, ProductCatalog};
pub use config::IntakeConfig;
pub use error::ConfigError;
pub use lifecycle::{LifecycleError, run};
pub use token::TokenStrategy;
