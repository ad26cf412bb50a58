//! Metrics pipeline: counter catalog polling on one side, binary UDP
//! samples towards the collector on the other.

pub mod manager;
pub mod packet;
pub mod store;
pub mod transport;

pub use manager::{ManagerState, MetricConfigManager, PollSettings};
pub use store::{MetricDefinition, MetricStore, MetricStoreError, MetricType, RestMetricStore};
pub use transport::{CounterTransport, TransportError};
