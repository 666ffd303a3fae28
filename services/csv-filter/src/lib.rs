//! CSV Filter Service
//!
//! Filters tabular datasets held in S3 down to the rows matching a set of
//! dimension values. Requests arrive over HTTP or from Kafka; each one is
//! fetched, filtered into a scratch file, uploaded to the intermediate
//! bucket and announced to the transform stage.
//!
//! ## Architecture
//!
//! ```text
//!  POST /filter        Kafka
//!  ┌──────────────┐   ┌──────────────┐
//!  │ HTTP API     │   │ filter-      │
//!  │              │   │ request      │
//!  └──────────────┘   └──────────────┘
//!         │                  │
//!         └────────┬─────────┘
//!                  ▼
//!          ┌──────────────┐    GetObject    ┌──────────────┐
//!          │ Filter       │◀────────────────│ Source       │
//!          │ Service      │                 │ bucket       │
//!          └──────────────┘                 └──────────────┘
//!                  │
//!                  ▼
//!          ┌──────────────┐
//!          │ Dimension    │──▶ scratch file
//!          │ Processor    │
//!          └──────────────┘
//!                  │ PutObject
//!                  ▼
//!          ┌──────────────┐                 ┌──────────────┐
//!          │ Intermediate │────────────────▶│ transform-   │
//!          │ bucket       │  notification   │ request      │
//!          └──────────────┘                 └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod filter;
pub mod kafka_consumer;
pub mod location;
pub mod model;
pub mod producer;
pub mod service;
pub mod storage;

pub use api::{start_api_server, AppState};
pub use config::Config;
pub use filter::{CsvProcessor, DimensionLocations, DimensionProcessor, FilterSummary, ProcessError};
pub use kafka_consumer::{DispatchOutcome, FilterRequestConsumer};
pub use location::{LocationError, ObjectLocation};
pub use model::{DimensionFilters, FilterRequest, FilterResponse, TransformRequest};
pub use producer::{DeliveryResult, KafkaPublisher, NotificationPublisher, ProducerError};
pub use service::{FilterOutcome, FilterService, FilterSettings, PipelineError};
pub use storage::{ObjectReader, ObjectStore, S3Store, StorageError};
