//! Events that tell the master a builder may have new work.

/// Build request activity routed into the distributor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildRequestEvent {
    /// A buildset was created with requests for these builders.
    New { builder_names: Vec<String> },
    /// A request was released by a master and is pending again.
    Unclaimed { builder_name: String },
}

impl BuildRequestEvent {
    pub fn builder_names(&self) -> Vec<String> {
        match self {
            BuildRequestEvent::New { builder_names } => builder_names.clone(),
            BuildRequestEvent::Unclaimed { builder_name } => vec![builder_name.clone()],
        }
    }
}
