use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{Router, Supervisor};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub router: Arc<Router>,
    pub shutdown: CancellationToken,
}
