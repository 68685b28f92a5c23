//! Change sources deliver ordered change events for one named resource.
//!
//! Two strategies are provided:
//!
//! - [`ReflectorSource`] lists the resource, then watches it incrementally,
//!   relisting when the resource version expires. Transport errors are
//!   reported as [`ChangeEvent::Error`] while the watch retries on its own.
//! - [`StreamSource`] decodes one long-lived watch response. It ends the
//!   stream on clean EOF and reports unexpected closure as a single
//!   [`ChangeEvent::Error`] before ending.
//!
//! A subscription is closed by dropping its stream, which also aborts any
//! read in flight.

use std::future::Future;

use futures::stream::BoxStream;

use crate::error::SourceError;
use crate::model::ChangeEvent;
use crate::target::ResourceKey;

mod reflector;
mod stream;

pub use reflector::ReflectorSource;
pub use stream::{Connector, KubeConnector, StreamSource};

/// An ordered stream of change events for one resource.
pub type EventStream = BoxStream<'static, ChangeEvent>;

/// Transport that delivers the state of one named resource.
pub trait ChangeSource: Send + Sync + 'static {
    /// Opens a subscription to exactly the resource identified by `key`.
    ///
    /// The stream ending means the subscription is gone; the caller decides
    /// whether to resubscribe.
    fn subscribe(
        &self,
        key: &ResourceKey,
    ) -> impl Future<Output = Result<EventStream, SourceError>> + Send;
}
