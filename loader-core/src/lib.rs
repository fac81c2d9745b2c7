pub mod error;
pub use error::{LoaderError, LoaderResult};

pub mod config;
pub use config::{LoadedConfig, LoaderConfig};

pub mod logging;

pub mod host;

pub mod model {
    pub mod entity;
    pub use entity::{Context, EntityRecord, EntityRef, HierarchyEntry, PublishRecord, ThumbnailRef};

    pub mod filter;
    pub use filter::{FilterOperator, FilterPredicate};

    pub mod tab;
    pub use tab::{TabDefinition, TabKind};

    pub mod tree;
    pub use tree::{FetchState, NodeId, Tree, TreeNode};
}

pub mod builder {
    pub mod grouping;

    pub mod plan;
}

pub mod publish {
    pub mod pipeline;
    pub use pipeline::PublishRequest;
}

pub mod actions {
    pub mod mapping;
    pub use mapping::ActionMapping;

    pub mod dispatcher;
    pub use dispatcher::ActionDispatcher;
}

pub mod cache {
    pub mod thumbnail_cache;
}

pub mod controller {
    pub mod coordinator;
    pub use coordinator::{FetchCoordinator, FetchKey, FetchTicket};
}

pub mod tasks {
    pub mod fetch_task;
}

pub mod session;
pub use session::{Expansion, LoaderEvent, LoaderSession, PublishLookup};

#[cfg(test)]
pub(crate) mod testing;
