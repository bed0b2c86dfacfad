use std::future::Future;

use tokio::sync::mpsc;

use super::types::SignalingError;

/// Raw publications delivered to one subscription, in publish order
pub type Inbound = mpsc::UnboundedReceiver<String>;

/// A publish/subscribe broadcast transport.
///
/// Topics isolate groups sharing one fabric. A subscriber never receives its
/// own publications.
pub trait Fabric: Send + Sync + 'static {
    type Link: TopicLink;

    fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<(Self::Link, Inbound), SignalingError>> + Send;
}

/// Publishing side of one topic subscription
pub trait TopicLink: Send + Sync + 'static {
    fn publish(&self, payload: String) -> impl Future<Output = Result<(), SignalingError>> + Send;

    /// Stop receiving; safe to call more than once.
    fn unsubscribe(&self) -> impl Future<Output = ()> + Send;
}
