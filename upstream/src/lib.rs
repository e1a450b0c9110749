//! Resilient access to the gateway's upstream services.
//!
//! The upstreams are independently owned and only partially specified, so
//! nothing here assumes a single contract:
//!
//! * [`registry`] holds the immutable endpoint table built at start-up.
//! * [`fetcher`] performs one bounded call and classifies the outcome.
//! * [`resolver`] turns a logical operation into an ordered list of request
//!   shapes and tries them until one is accepted.
//! * [`health`] and [`metrics`] fan out across every endpoint and fold the
//!   partial results into one document.
//!
//! All network I/O goes through the [`transport::Transport`] trait so the
//! whole layer can run against [`transport::FakeTransport`] in tests.

pub mod exposition;
pub mod fetcher;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod transport;

pub use fetcher::{AttemptOutcome, Classification, FetchRequest, Fetcher, ResponseBody};
pub use health::{HealthAggregator, HealthReport, HealthSummary, OverallStatus, ServiceHealth};
pub use metrics::{MetricField, MetricsAggregator, MetricsTotals, SourceKind};
pub use registry::{AuthToken, EndpointDescriptor, EndpointRegistry, RegistryError};
pub use resolver::{LogicalOp, PatternResolver, ResolveError, ResolveRequest};
pub use transport::{Method, ReqwestTransport, Transport, TransportFailure};
