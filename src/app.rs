//! Wiring of the shared services from a loaded configuration.

use std::sync::Arc;

use anyhow::Context;
use dimse::{DimseScu, ScuOperations, StoreListener, StoreScp};
use reqwest::Client;

use crate::collab::LocalImport;
use crate::config::{Config, ConfigError, QueryKind};
use crate::events::EventBus;
use crate::http::build_http_client;
use crate::loader::ImageDisplayLoader;
use crate::model::HierarchyModel;
use crate::query::{CFindClient, QidoClient, QueryResolver, QueryService};
use crate::scheduler::RetrievalScheduler;
use crate::storage::{FilesystemStorage, StorageBackend};
use crate::transport::{FirstNodeChooser, TransportDeps, TransportRegistry, WebNodeChooser};

/// Long-lived services shared by every request
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub events: EventBus,
    pub model: Arc<HierarchyModel>,
    pub scheduler: RetrievalScheduler,
    pub storage: Arc<dyn StorageBackend>,
    pub client: Client,
    pub scu: Arc<dyn ScuOperations>,
    pub query: Arc<dyn QueryService>,
}

impl Services {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let client = build_http_client(&config.download).context("cannot build the HTTP client")?;
        let scu: Arc<dyn ScuOperations> = Arc::new(DimseScu::new(config.dimse.clone()));
        Self::with_backends(config, client, scu)
    }

    /// Build around a given HTTP client and DIMSE client
    pub fn with_backends(
        config: Config,
        client: Client,
        scu: Arc<dyn ScuOperations>,
    ) -> anyhow::Result<Self> {
        let storage = FilesystemStorage::new(&config.download.temp_dir)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let query: Arc<dyn QueryService> = match config.retrieve.query {
            QueryKind::Qido => Arc::new(QidoClient::with_client(client.clone(), &config.archive)),
            QueryKind::Cfind => {
                let node = config
                    .archive
                    .dimse
                    .clone()
                    .ok_or_else(|| ConfigError::MissingDimseNode("C-FIND".into()))?;
                Arc::new(CFindClient::new(Arc::clone(&scu), node))
            }
        };
        let events = EventBus::new();
        let scheduler =
            RetrievalScheduler::with_events(config.download.concurrent_series, events.clone());

        Ok(Self {
            model: Arc::new(HierarchyModel::new(events.clone())),
            config: Arc::new(config),
            events,
            scheduler,
            storage: Arc::new(storage),
            client,
            scu,
            query,
        })
    }

    pub fn resolver(&self) -> QueryResolver {
        QueryResolver::new(
            Arc::clone(&self.query),
            Arc::clone(&self.model),
            self.config.archive.base_url.clone(),
        )
        .with_show_whole_study(self.config.archive.show_whole_study)
    }

    pub fn loader(&self, import: Arc<dyn LocalImport>) -> ImageDisplayLoader {
        ImageDisplayLoader::new(
            Arc::clone(&self.config),
            self.resolver(),
            self.scheduler.clone(),
            self.client.clone(),
            Arc::clone(&self.storage),
            import,
        )
    }

    /// `storescp` listener on the configured port and storage directory
    pub fn store_listener(&self) -> Arc<dyn StoreListener> {
        Arc::new(StoreScp::new(
            self.config.dimse.clone(),
            self.config.dimse.storage_dir.clone(),
        ))
    }

    pub fn registry(
        &self,
        listener: Option<Arc<dyn StoreListener>>,
        chooser: Option<Arc<dyn WebNodeChooser>>,
    ) -> TransportRegistry {
        TransportRegistry::new(TransportDeps {
            config: Arc::clone(&self.config),
            scu: Arc::clone(&self.scu),
            listener,
            scheduler: self.scheduler.clone(),
            storage: Arc::clone(&self.storage),
            model: Arc::clone(&self.model),
            query: Arc::clone(&self.query),
            chooser: chooser.unwrap_or_else(|| Arc::new(FirstNodeChooser)),
        })
    }
}
