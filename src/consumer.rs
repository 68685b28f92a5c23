//! Consumers of resolved address lists.
//!
//! A resolver always hands its consumer the complete current list. Sinks
//! must tolerate repeated identical lists and empty lists.

use std::collections::HashSet;
use std::future::{self, Future};
use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::model::ResolvedAddress;

/// The consumer went away; the resolver stops publishing.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("address consumer closed")]
pub struct ConsumerClosed;

/// Receives full replacement address lists.
pub trait AddressSink: Send + 'static {
    /// Replaces the consumer's address list with `addresses`.
    fn publish(
        &mut self,
        addresses: Vec<ResolvedAddress>,
    ) -> impl Future<Output = Result<(), ConsumerClosed>> + Send;
}

impl AddressSink for watch::Sender<Vec<ResolvedAddress>> {
    fn publish(
        &mut self,
        addresses: Vec<ResolvedAddress>,
    ) -> impl Future<Output = Result<(), ConsumerClosed>> + Send {
        future::ready(self.send(addresses).map_err(|_| ConsumerClosed))
    }
}

impl AddressSink for mpsc::Sender<Vec<ResolvedAddress>> {
    async fn publish(&mut self, addresses: Vec<ResolvedAddress>) -> Result<(), ConsumerClosed> {
        self.send(addresses).await.map_err(|_| ConsumerClosed)
    }
}

/// Feeds full address lists into a tonic balance channel.
///
/// The channel expects incremental `Change::Insert` and `Change::Remove`
/// events, so the sink remembers which addresses it has inserted and sends
/// only the difference. The `build` function creates the `Endpoint` for each
/// new address.
///
/// # Example
///
/// ```ignore
/// use std::net::SocketAddr;
/// use tonic::transport::{Channel, Endpoint};
/// use tonic_kuberesolver::BalanceChannel;
///
/// let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
/// let sink = BalanceChannel::new(tx, |addr| {
///     Endpoint::from_shared(format!("http://{addr}")).unwrap()
/// });
/// ```
pub struct BalanceChannel<F> {
    tx: mpsc::Sender<Change<SocketAddr, Endpoint>>,
    build: F,
    known: HashSet<SocketAddr>,
}

impl<F> BalanceChannel<F>
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    /// Creates a sink for the sender returned by `Channel::balance_channel`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Change<SocketAddr, Endpoint>>, build: F) -> Self {
        Self {
            tx,
            build,
            known: HashSet::new(),
        }
    }
}

impl<F> AddressSink for BalanceChannel<F>
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    async fn publish(&mut self, addresses: Vec<ResolvedAddress>) -> Result<(), ConsumerClosed> {
        let current: HashSet<SocketAddr> = addresses.iter().map(|a| a.addr).collect();

        let removed: Vec<SocketAddr> = self.known.difference(&current).copied().collect();
        for addr in removed {
            tracing::debug!("removing endpoint: {addr}");
            self.tx
                .send(Change::Remove(addr))
                .await
                .map_err(|_| ConsumerClosed)?;
            self.known.remove(&addr);
        }

        for addr in current {
            if self.known.contains(&addr) {
                continue;
            }

            tracing::debug!("adding endpoint: {addr}");
            self.tx
                .send(Change::Insert(addr, (self.build)(addr)))
                .await
                .map_err(|_| ConsumerClosed)?;
            self.known.insert(addr);
        }

        Ok(())
    }
}
