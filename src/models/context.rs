use std::collections::HashSet;

/// Per-call selection hints supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub session_id: Option<String>,
    pub target_country: Option<String>,
    pub target_region: Option<String>,
    /// Backends to skip, e.g. ones that already failed this request
    pub excluded_ids: HashSet<String>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Bind the context to a freshly generated session id
    pub fn with_new_session(self) -> Self {
        self.with_session(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.target_country = Some(country.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.target_region = Some(region.into());
        self
    }

    pub fn exclude(&mut self, backend_id: impl Into<String>) {
        self.excluded_ids.insert(backend_id.into());
    }

    pub fn is_excluded(&self, backend_id: &str) -> bool {
        self.excluded_ids.contains(backend_id)
    }

    pub fn has_location_target(&self) -> bool {
        self.target_country.is_some() || self.target_region.is_some()
    }
}
