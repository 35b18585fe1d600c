//! Hub configuration.

/// Configuration for the sync hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of events in one push request.
    pub max_push_batch: usize,
    /// Maximum number of objects in an uploaded document.
    pub max_document_objects: usize,
    /// Number of recent events included in the debug status.
    pub status_recent_events: usize,
}

impl HubConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_push_batch: 500,
            max_document_objects: 10_000,
            status_recent_events: 10,
        }
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the maximum uploaded document size.
    pub fn with_max_document_objects(mut self, max: usize) -> Self {
        self.max_document_objects = max;
        self
    }

    /// Sets how many recent events the debug status shows.
    pub fn with_status_recent_events(mut self, count: usize) -> Self {
        self.status_recent_events = count;
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = HubConfig::default();
        assert_eq!(config.max_push_batch, 500);
        assert_eq!(config.status_recent_events, 10);
    }

    #[test]
    fn config_builder() {
        let config = HubConfig::new()
            .with_max_push_batch(2)
            .with_max_document_objects(5)
            .with_status_recent_events(3);

        assert_eq!(config.max_push_batch, 2);
        assert_eq!(config.max_document_objects, 5);
        assert_eq!(config.status_recent_events, 3);
    }
}
