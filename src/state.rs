use std::sync::Arc;

use crate::inference::ModelArtifacts;
use crate::store::DocumentStore;

/// Everything the handlers share. Built once after the store client and the
/// model artifacts loaded; the server is never started without it.
pub struct AppState {
    pub artifacts: ModelArtifacts,
    pub store: Arc<dyn DocumentStore>,
}

impl AppState {
    pub fn new(artifacts: ModelArtifacts, store: Arc<dyn DocumentStore>) -> Self {
        Self { artifacts, store }
    }
}
