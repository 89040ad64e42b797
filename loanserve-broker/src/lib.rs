#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Broker topology management, consumer framework, and DLQ maintenance
//! (spec 4.1, 4.7). Wire layer is `lapin` (AMQP 0-9-1); the in-memory
//! doubles in each module let the rest of the workspace exercise broker
//! behavior without a live connection.

pub mod consumer;
pub mod dlq;
pub mod topology;

pub use consumer::ConsumerError;
pub use consumer::ConsumerResult;
pub use consumer::DeliveryDisposition;
pub use consumer::MessageContext;
pub use consumer::Outcome as ConsumerOutcome;
pub use consumer::ProcessedMessageStore;
pub use consumer::RetryConfig;
pub use dlq::DlqAnalysis;
pub use dlq::DlqEntry;
pub use dlq::DlqError;
pub use dlq::DlqFilter;
pub use dlq::DlqRepublisher;
pub use dlq::DlqResult;
pub use dlq::DlqStore;
pub use dlq::InMemoryDlqStore;
#[cfg(feature = "lapin-store")]
pub use dlq::LapinDlqRepublisher;
pub use topology::BrokerTopology;
pub use topology::DeclareReport;
pub use topology::ExchangeKind;
#[cfg(feature = "management-http")]
pub use topology::HttpManagementClient;
#[cfg(feature = "lapin-store")]
pub use topology::LapinTopologyManager;
pub use topology::ManagementClient;
pub use topology::MigrationAction;
pub use topology::Mismatch;
pub use topology::QueueOutcome;
pub use topology::QueueType;
pub use topology::TopologyError;
pub use topology::TopologyManager;
pub use topology::TopologyResult;
pub use topology::ValidationReport;
pub use topology::default_topology;
pub use topology::validate as validate_topology;
