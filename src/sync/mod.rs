//! Delivery of queued mutations and the environment hooks it depends on.

mod background;
mod connectivity;
mod processor;
mod transport;

pub use background::{BackgroundSync, ChannelBackgroundSync, NoopBackgroundSync};
pub use connectivity::Connectivity;
pub use processor::{
  is_retryable_status, AttemptResult, DrainOutcome, ItemOutcome, ItemReport, SyncProcessor,
  SyncReport,
};
pub use transport::{HttpTransport, OutboundRequest, Transport, TransportError, TransportResponse};
