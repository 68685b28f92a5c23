//! Change source that decodes a single long-lived watch response.

use std::future::Future;
use std::pin::Pin;

use futures::io::{AsyncBufRead, AsyncBufReadExt};
use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Client;
use kube::api::WatchParams;
use serde::Deserialize;

use super::{ChangeSource, EventStream};
use crate::error::SourceError;
use crate::model::{ChangeEvent, Snapshot};
use crate::target::ResourceKey;

/// Opens the response body of a watch on one resource.
pub trait Connector: Send + Sync + 'static {
    /// Body reader. Dropping it must close the underlying connection.
    type Reader: AsyncBufRead + Send + Unpin + 'static;

    /// Starts a watch scoped to the resource identified by `key`.
    fn connect(
        &self,
        key: &ResourceKey,
    ) -> impl Future<Output = Result<Self::Reader, SourceError>> + Send;
}

/// Watches `Endpoints` over the Kubernetes API with a raw streaming request.
#[derive(Clone)]
pub struct KubeConnector {
    client: Client,
}

impl KubeConnector {
    /// Creates a connector using the given client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Connector for KubeConnector {
    type Reader = Pin<Box<dyn AsyncBufRead + Send>>;

    async fn connect(&self, key: &ResourceKey) -> Result<Self::Reader, SourceError> {
        let url = format!("/api/v1/namespaces/{}/endpoints", key.namespace);
        let params = WatchParams::default().fields(&format!("metadata.name={}", key.name));
        let request = kube::core::Request::new(url).watch(&params, "0")?;

        tracing::debug!("starting Kubernetes endpoints stream for {key}");

        let body = self.client.request_stream(request).await?;
        Ok(Box::pin(body))
    }
}

/// Decodes newline-delimited JSON watch events from a [`Connector`].
///
/// A clean end of the body ends the stream silently. A truncated event,
/// a read error, an undecodable line or a server `ERROR` event is reported
/// as one [`ChangeEvent::Error`], after which the stream ends.
#[derive(Clone)]
pub struct StreamSource<C> {
    connector: C,
}

impl<C: Connector> StreamSource<C> {
    /// Creates a source reading from `connector`.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

impl<C: Connector> ChangeSource for StreamSource<C> {
    async fn subscribe(&self, key: &ResourceKey) -> Result<EventStream, SourceError> {
        let reader = self.connector.connect(key).await?;
        Ok(decode_events(reader).boxed())
    }
}

/// A watch event as sent on the wire.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "SCREAMING_SNAKE_CASE")]
enum WireEvent {
    Added(Endpoints),
    Modified(Endpoints),
    Deleted(Endpoints),
    Error(Status),
}

impl From<WireEvent> for ChangeEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::Added(endpoints) => Self::Added(Snapshot::from(&endpoints)),
            WireEvent::Modified(endpoints) => Self::Modified(Snapshot::from(&endpoints)),
            WireEvent::Deleted(endpoints) => Self::Deleted(Snapshot::from(&endpoints)),
            WireEvent::Error(status) => Self::Error(SourceError::Status {
                code: status.code,
                message: status.message.unwrap_or_default(),
            }),
        }
    }
}

/// Turns a response body into a stream of change events.
fn decode_events<R>(reader: R) -> impl futures::Stream<Item = ChangeEvent> + Send + 'static
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    stream::unfold(Some(reader), |reader| async move {
        let mut reader = reader?;
        let mut line = String::new();

        loop {
            line.clear();

            let read = match reader.read_line(&mut line).await {
                Ok(read) => read,
                Err(e) => return Some((ChangeEvent::Error(e.into()), None)),
            };

            if read == 0 {
                tracing::debug!("watch stream closed normally");
                return None;
            }

            if line.trim().is_empty() {
                continue;
            }

            let terminated = line.ends_with('\n');

            return match serde_json::from_str::<WireEvent>(&line) {
                Ok(event @ WireEvent::Error(_)) => Some((event.into(), None)),
                Ok(event) => Some((event.into(), Some(reader))),
                Err(_) if !terminated => Some((ChangeEvent::Error(SourceError::UnexpectedEof), None)),
                Err(e) => Some((ChangeEvent::Error(e.into()), None)),
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::io::Cursor;
    use parking_lot::Mutex;

    use super::*;

    const ADDED: &str = r#"{"type":"ADDED","object":{"apiVersion":"v1","kind":"Endpoints","metadata":{"name":"service","resourceVersion":"1"},"subsets":[{"addresses":[{"ip":"10.0.0.1"}],"ports":[{"name":"grpc","port":50051}]}]}}"#;
    const MODIFIED: &str = r#"{"type":"MODIFIED","object":{"apiVersion":"v1","kind":"Endpoints","metadata":{"name":"service","resourceVersion":"2"},"subsets":[{"addresses":[{"ip":"10.0.0.1"},{"ip":"10.0.0.2"}],"ports":[{"name":"grpc","port":50051}]}]}}"#;
    const DELETED: &str = r#"{"type":"DELETED","object":{"apiVersion":"v1","kind":"Endpoints","metadata":{"name":"service","resourceVersion":"3"}}}"#;
    const GONE: &str = r#"{"type":"ERROR","object":{"apiVersion":"v1","kind":"Status","code":410,"message":"too old resource version"}}"#;

    async fn collect(body: String) -> Vec<ChangeEvent> {
        decode_events(Cursor::new(body.into_bytes())).collect().await
    }

    fn version(event: &ChangeEvent) -> Option<&str> {
        match event {
            ChangeEvent::Added(s) | ChangeEvent::Modified(s) | ChangeEvent::Deleted(s) => {
                s.resource_version.as_deref()
            }
            ChangeEvent::Error(_) => None,
        }
    }

    #[tokio::test]
    async fn decodes_events_in_order() {
        let events = collect(format!("{ADDED}\n{MODIFIED}\n{DELETED}\n")).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ChangeEvent::Added(_)));
        assert!(matches!(events[1], ChangeEvent::Modified(_)));
        assert!(matches!(events[2], ChangeEvent::Deleted(_)));
        assert_eq!(version(&events[0]), Some("1"));
        assert_eq!(version(&events[1]), Some("2"));
        assert_eq!(version(&events[2]), Some("3"));
    }

    #[tokio::test]
    async fn decodes_snapshot_contents() {
        let events = collect(format!("{MODIFIED}\n")).await;

        let ChangeEvent::Modified(snapshot) = &events[0] else {
            panic!("unexpected event {:?}", events[0]);
        };

        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].addresses.len(), 2);
        assert_eq!(snapshot.groups[0].ports[0].number, 50051);
    }

    #[tokio::test]
    async fn clean_eof_ends_silently() {
        assert!(collect(String::new()).await.is_empty());

        let events = collect(format!("{ADDED}\n\n")).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn final_event_without_newline_is_accepted() {
        let events = collect(ADDED.to_string()).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChangeEvent::Added(_)));
    }

    #[tokio::test]
    async fn truncated_event_is_unexpected_eof() {
        let events = collect(format!("{ADDED}\n{}", &MODIFIED[..40])).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            ChangeEvent::Error(SourceError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn garbage_is_decode_error_and_ends_stream() {
        let events = collect(format!("not json\n{ADDED}\n")).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChangeEvent::Error(SourceError::Decode(_))));
    }

    #[tokio::test]
    async fn unknown_event_type_is_decode_error() {
        let events = collect("{\"type\":\"BOOKMARK\",\"object\":{}}\n".to_string()).await;

        assert!(matches!(events[0], ChangeEvent::Error(SourceError::Decode(_))));
    }

    #[tokio::test]
    async fn server_error_event_ends_stream() {
        let events = collect(format!("{ADDED}\n{GONE}\n{MODIFIED}\n")).await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            ChangeEvent::Error(SourceError::Status { code, message }) => {
                assert_eq!(*code, Some(410));
                assert_eq!(message, "too old resource version");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    struct FakeConnector {
        bodies: Mutex<VecDeque<String>>,
    }

    impl Connector for FakeConnector {
        type Reader = Cursor<Vec<u8>>;

        async fn connect(&self, _key: &ResourceKey) -> Result<Self::Reader, SourceError> {
            let body = self.bodies.lock().pop_front().unwrap_or_default();
            Ok(Cursor::new(body.into_bytes()))
        }
    }

    #[tokio::test]
    async fn each_subscription_reads_its_own_body() {
        let source = StreamSource::new(FakeConnector {
            bodies: Mutex::new(VecDeque::from([format!("{ADDED}\n"), format!("{MODIFIED}\n")])),
        });
        let key = ResourceKey {
            namespace: "ns".to_string(),
            name: "service".to_string(),
        };

        let first: Vec<_> = source.subscribe(&key).await.unwrap().collect().await;
        let second: Vec<_> = source.subscribe(&key).await.unwrap().collect().await;

        assert_eq!(version(&first[0]), Some("1"));
        assert_eq!(version(&second[0]), Some("2"));
    }
}
