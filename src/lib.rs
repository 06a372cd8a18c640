//! TMTC - Telemetry/Telecommand Processing Model Engine
//!
//! The processing core of a monitoring and control system. Decoded parameter
//! samples, event occurrences and activity progress reports are propagated
//! through a dependency graph of system-entity processors; every batch
//! produces immutable, uniquely sequenced snapshots that are archived and
//! pushed to subscribers. An activity scheduler releases activities on
//! absolute time, predecessor completion or events, arbitrating declared
//! resources between them.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tmtc::{Config, ProcessingModel, SchedulerService};
//!
//! # async fn run() -> tmtc::Result<()> {
//! tmtc::init();
//!
//! let config = Config::from_file("tmtc.yaml")?;
//! let model = ProcessingModel::builder(config.definition.clone())
//!     .engine(config.engine.clone())
//!     .build()?;
//! let scheduler = SchedulerService::for_model(&config.scheduler, model.clone());
//!
//! scheduler.shutdown().await;
//! model.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE TYPES
// ============================================================================

/// Error taxonomy shared by the model and the scheduler
pub mod error;

/// Typed values carried by parameters, events and activity arguments
pub mod value;

/// Dotted hierarchical entity names
pub mod path;

/// Time source, replaceable in tests
pub mod clock;

/// Per-kind monotonic id generation
pub mod sequencer;

/// Immutable snapshots produced by processing
pub mod data;

/// Inputs accepted from producers and activity handlers
pub mod input;

/// Static processing definition, expressions, calibrations and checks
pub mod definition;

// ============================================================================
// PROCESSING ENGINE
// ============================================================================

/// Dependency graph of system entities
pub mod graph;

/// Parameter, event, activity and container processors
pub mod processors;

pub mod operation;

/// One prepared processing batch
pub mod task;

/// Entity-id admission gate
pub mod working_set;

/// Single logical timer queue
pub mod timer;

/// Admission queue, dispatcher loop and worker pool
pub mod dispatcher;

/// Activity handler registry
pub mod handler;

// ============================================================================
// OUTPUTS
// ============================================================================

/// Archive seam with in-memory and JSON-lines implementations
pub mod storage;

/// Per-subscriber delivery
pub mod subscription;

/// Data item and scheduler snapshot filters
pub mod filter;

// ============================================================================
// FACADES
// ============================================================================

/// External API of the processing model
pub mod model;

/// Activity scheduler
pub mod scheduler;

/// Engine, scheduler and definition configuration
pub mod config;

// ============================================================================
// PUBLIC RE-EXPORTS
// ============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, EngineConfig, SchedulerConfig};
pub use data::{
    ActivityOccurrenceData, ActivityOccurrenceReport, ActivityOccurrenceState, ActivityReportState, AlarmState,
    DataItem, EventData, ParameterData, Status, SystemEntity, Validity,
};
pub use definition::ProcessingDefinition;
pub use dispatcher::{BatchResult, StatsSnapshot};
pub use error::{ProcessingError, Result};
pub use filter::{DataItemFilter, ScheduledActivityDataFilter};
pub use handler::{ActivityHandler, ActivityInvocation};
pub use input::{ActivityArgument, ActivityProgress, ActivityRequest, EventOccurrence, ParameterSample};
pub use model::{ProcessingModel, ProcessingModelBuilder};
pub use path::EntityPath;
pub use scheduler::{
    ActivityExecutor, ConflictStrategy, CreationConflictStrategy, ScheduledActivityData, SchedulerService,
    SchedulingRequest, SchedulingState, Trigger,
};
pub use sequencer::{DataKind, Sequencer};
pub use storage::{Archive, JsonLinesArchive, MemoryArchive, RetrievalDirection, RetrievalQuery};
pub use subscription::{Filter, Subscriber};
pub use value::{Value, ValueType};

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// TMTC version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// INITIALIZATION
// ============================================================================

/// Install the `tracing` subscriber.
///
/// `RUST_LOG` is honoured; without it the crate logs at info level. Calling
/// it again, or after another subscriber was installed, does nothing.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tmtc=info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
    {
        tracing::info!("TMTC {} initialized", VERSION);
    }
}
