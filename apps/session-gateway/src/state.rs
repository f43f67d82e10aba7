use std::time::Instant;

use crate::manager::SessionManager;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    manager: SessionManager,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            start: Instant::now(),
            manager,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }
}
