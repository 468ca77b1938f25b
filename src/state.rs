//! Application state management
//!
//! Holds the registry, the orchestrator and the projectors whose read-back
//! side the HTTP layer exposes directly.

use crate::config::TargetsConfig;
use crate::lifecycle::Orchestrator;
use crate::projection::{CacheProjector, DocumentProjector, GraphProjector, Projector, SearchProjector};
use crate::schema::SchemaRegistry;
use crate::source::{Extractor, SourceStore};
use crate::targets::{CacheStore, DocumentStore, GraphStore, SearchStore};
use std::sync::Arc;

/// One connected store per target family
pub struct TargetStores {
    pub graph: Arc<dyn GraphStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub search: Arc<dyn SearchStore>,
    pub cache: Arc<dyn CacheStore>,
}

#[cfg(test)]
impl TargetStores {
    /// In-process adapters for every family
    pub fn in_memory() -> Self {
        use crate::targets::{MemoryCache, MemoryDocuments, MemoryGraph, MemorySearch};
        Self {
            graph: Arc::new(MemoryGraph::new()),
            documents: Arc::new(MemoryDocuments::new()),
            search: Arc::new(MemorySearch::new()),
            cache: Arc::new(MemoryCache::new()),
        }
    }
}

/// Application state shared across all handlers
pub struct AppState {
    pub registry: Arc<SchemaRegistry>,

    /// Drives every build and teardown
    pub orchestrator: Orchestrator,

    pub graph: Arc<GraphProjector>,
    pub documents: Arc<DocumentProjector>,
    pub search: Arc<SearchProjector>,
    pub cache: Arc<CacheProjector>,
}

impl AppState {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        source: Arc<dyn SourceStore>,
        stores: TargetStores,
        targets: &TargetsConfig,
    ) -> Self {
        let graph = Arc::new(GraphProjector::new(registry.clone(), stores.graph));
        let documents = Arc::new(DocumentProjector::new(
            registry.clone(),
            stores.documents,
            targets.document.collection.clone(),
        ));
        let search = Arc::new(SearchProjector::new(
            stores.search,
            targets.search.index.clone(),
            &targets.search.language,
        ));
        let cache = Arc::new(CacheProjector::new(registry.clone(), stores.cache));

        let projectors: Vec<Arc<dyn Projector>> = vec![
            graph.clone() as Arc<dyn Projector>,
            documents.clone() as Arc<dyn Projector>,
            search.clone() as Arc<dyn Projector>,
            cache.clone() as Arc<dyn Projector>,
        ];
        let extractor = Extractor::new(registry.clone(), source);

        Self {
            registry,
            orchestrator: Orchestrator::new(extractor, projectors),
            graph,
            documents,
            search,
            cache,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        self.orchestrator.extractor()
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
