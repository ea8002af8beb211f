use std::path::PathBuf;

use thiserror::Error;

use crate::inference::ArtifactPaths;
use crate::store::firestore::FIRESTORE_URL;
use crate::store::{FirestoreAuth, FirestoreConfig, ServiceAccountKey, StoreBackend};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable not found")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("FIREBASE_CREDENTIALS is not valid service account JSON: {0}")]
    Credentials(#[from] serde_json::Error),

    #[error("FIREBASE_CREDENTIALS has an empty {0}")]
    IncompleteCredentials(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Worker count; actix picks one per core when unset.
    pub workers: Option<usize>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server: ServerConfig,
    pub artifacts: ArtifactPaths,
    pub store: StoreBackend,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let port = parse_var(&lookup, "PORT")?.unwrap_or(8080);
        let workers = parse_var(&lookup, "WORKERS")?;
        let server = ServerConfig {
            host: var_or("HOST", "127.0.0.1"),
            port,
            workers,
        };

        let artifacts = ArtifactPaths {
            model: PathBuf::from(var_or("MODEL_PATH", "model.onnx")),
            encoders: PathBuf::from(var_or("ENCODERS_PATH", "encoders.json")),
            label_mapping: PathBuf::from(var_or("LABEL_MAPPING_PATH", "label_mapping.json")),
        };

        let store = match var_or("DOCUMENT_STORE", "firestore").as_str() {
            "firestore" => {
                let credentials = lookup("FIREBASE_CREDENTIALS")
                    .filter(|c| !c.trim().is_empty())
                    .ok_or(ConfigError::Missing("FIREBASE_CREDENTIALS"))?;
                let key = parse_credentials(&credentials)?;
                let (base_url, auth) = match lookup("FIRESTORE_EMULATOR_HOST") {
                    Some(host) => (format!("http://{}", host), FirestoreAuth::Emulator),
                    None => (FIRESTORE_URL.to_string(), FirestoreAuth::ServiceAccount(key.clone())),
                };
                StoreBackend::Firestore(FirestoreConfig {
                    project_id: key.project_id,
                    base_url,
                    auth,
                })
            }
            "memory" => StoreBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    name: "DOCUMENT_STORE",
                    value: other.to_string(),
                })
            }
        };

        Ok(Config {
            server,
            artifacts,
            store,
        })
    }
}

/// A service account key with every field signing needs present.
fn parse_credentials(credentials: &str) -> Result<ServiceAccountKey, ConfigError> {
    let key: ServiceAccountKey = serde_json::from_str(credentials)?;
    for (name, value) in [
        ("project_id", &key.project_id),
        ("client_email", &key.client_email),
        ("private_key", &key.private_key),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::IncompleteCredentials(name));
        }
    }
    Ok(key)
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::auth::testing::{key, key_json};
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn firestore_requires_credentials() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing("FIREBASE_CREDENTIALS"))));
    }

    #[test]
    fn credentials_select_service_account_auth() {
        let credentials = key_json("https://oauth2.googleapis.com/token");
        let cfg = config(&[("FIREBASE_CREDENTIALS", &credentials)]).unwrap();
        assert_eq!(
            cfg.store,
            StoreBackend::Firestore(FirestoreConfig {
                project_id: "glaucoma-app".into(),
                base_url: FIRESTORE_URL.into(),
                auth: FirestoreAuth::ServiceAccount(key("https://oauth2.googleapis.com/token")),
            })
        );
    }

    #[test]
    fn emulator_host_switches_to_emulator_auth() {
        let credentials = key_json("https://oauth2.googleapis.com/token");
        let cfg = config(&[
            ("FIREBASE_CREDENTIALS", &credentials),
            ("FIRESTORE_EMULATOR_HOST", "localhost:8081"),
        ])
        .unwrap();
        assert_eq!(
            cfg.store,
            StoreBackend::Firestore(FirestoreConfig {
                project_id: "glaucoma-app".into(),
                base_url: "http://localhost:8081".into(),
                auth: FirestoreAuth::Emulator,
            })
        );
    }

    #[test]
    fn credentials_without_signing_fields_are_rejected() {
        assert!(matches!(
            config(&[("FIREBASE_CREDENTIALS", r#"{"type": "service_account", "project_id": "glaucoma-app"}"#)]),
            Err(ConfigError::Credentials(_))
        ));

        let mut blank_email: serde_json::Value =
            serde_json::from_str(&key_json("https://oauth2.googleapis.com/token")).unwrap();
        blank_email["client_email"] = "".into();
        assert!(matches!(
            config(&[("FIREBASE_CREDENTIALS", &blank_email.to_string())]),
            Err(ConfigError::IncompleteCredentials("client_email"))
        ));
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        assert!(matches!(
            config(&[("FIREBASE_CREDENTIALS", "{not json")]),
            Err(ConfigError::Credentials(_))
        ));
    }

    #[test]
    fn memory_store_needs_no_credentials_and_uses_defaults() {
        let cfg = config(&[("DOCUMENT_STORE", "memory")]).unwrap();
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.server.bind_address(), "127.0.0.1:8080");
        assert_eq!(cfg.server.workers, None);
        assert_eq!(cfg.artifacts.model, PathBuf::from("model.onnx"));
        assert_eq!(cfg.artifacts.label_mapping, PathBuf::from("label_mapping.json"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = config(&[("DOCUMENT_STORE", "memory"), ("PORT", "eighty")]).unwrap_err();
        assert_eq!(err.to_string(), "PORT has an invalid value 'eighty'");
    }

    #[test]
    fn unknown_store_backend_is_rejected() {
        assert!(matches!(
            config(&[("DOCUMENT_STORE", "postgres")]),
            Err(ConfigError::Invalid { name: "DOCUMENT_STORE", .. })
        ));
    }
}
