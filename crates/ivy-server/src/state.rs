//! Shared handler state.

use ivy_core::service::ServiceCtx;

/// Everything the HTTP layer needs, cloned per handler invocation.
#[derive(Clone)]
pub struct AppState {
    pub ctx: ServiceCtx,
}
