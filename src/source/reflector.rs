//! List-then-watch change source built on the `kube` runtime watcher.

use std::future::{self, Future};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client};

use super::{ChangeSource, EventStream};
use crate::error::SourceError;
use crate::model::{ChangeEvent, Snapshot};
use crate::target::ResourceKey;

/// Watches a single `Endpoints` object through the Kubernetes API.
///
/// The watcher lists the object, then watches from the listed resource
/// version. When the version expires it relists, and the fresh state is
/// emitted as one [`ChangeEvent::Added`] snapshot. A list that finds no
/// object is reported as [`ChangeEvent::Deleted`]. Watch errors are
/// reported while the watcher retries with backoff.
#[derive(Clone)]
pub struct ReflectorSource {
    client: Client,
}

impl ReflectorSource {
    /// Creates a source using the given client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ChangeSource for ReflectorSource {
    fn subscribe(
        &self,
        key: &ResourceKey,
    ) -> impl Future<Output = Result<EventStream, SourceError>> + Send {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &key.namespace);
        let config = WatcherConfig::default().fields(&format!("metadata.name={}", key.name));

        tracing::debug!("starting Kubernetes endpoints watch for {key}");

        let mut cache = ReflectorCache::default();
        let events = watcher::watcher(api, config)
            .default_backoff()
            .filter_map(move |event| future::ready(cache.apply(event)));

        future::ready(Ok(events.boxed()))
    }
}

/// Local mirror of the watched object.
#[derive(Debug, Default)]
struct ReflectorCache {
    current: Option<Endpoints>,
    listed: Option<Endpoints>,
}

impl ReflectorCache {
    /// Applies a watcher event and returns the change to emit, if any.
    fn apply(
        &mut self,
        event: Result<Event<Endpoints>, watcher::Error>,
    ) -> Option<ChangeEvent> {
        let event = match event {
            Ok(event) => event,
            Err(e) => return Some(ChangeEvent::Error(e.into())),
        };

        match event {
            Event::Init => {
                tracing::debug!("Kubernetes watcher (re)listing endpoints");
                self.listed = None;
                None
            }

            Event::InitApply(endpoints) => {
                self.listed = Some(endpoints);
                None
            }

            Event::InitDone => {
                // An empty list proves the object does not exist.
                let Some(endpoints) = self.listed.take() else {
                    self.current = None;
                    return Some(ChangeEvent::Deleted(Snapshot::default()));
                };

                let snapshot = Snapshot::from(&endpoints);
                self.current = Some(endpoints);
                Some(ChangeEvent::Added(snapshot))
            }

            Event::Apply(endpoints) => {
                let snapshot = Snapshot::from(&endpoints);
                let event = if self.current.is_some() {
                    ChangeEvent::Modified(snapshot)
                } else {
                    ChangeEvent::Added(snapshot)
                };

                self.current = Some(endpoints);
                Some(event)
            }

            Event::Delete(endpoints) => {
                self.current = None;
                Some(ChangeEvent::Deleted(Snapshot::from(&endpoints)))
            }
        }
    }
}
