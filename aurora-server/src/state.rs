use std::sync::Arc;

use aurora_core::Database;
use aurora_core::reconcile::Engine;

/// Shared application state for the API surface.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn db(&self) -> &Database {
        self.engine.db()
    }
}
