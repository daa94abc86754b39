pub mod artifact;
pub mod cohort;
pub mod context;
pub mod dataset;
pub mod error;
pub mod flows;
pub mod invocation;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod scoring;
pub mod settings;
pub mod stages;
pub mod validation;

pub use artifact::ArtifactExchange;
pub use cohort::{CohortAssigner, CohortLabel};
pub use context::{RunContext, RunIdentity};
pub use error::{ArtifactError, FlowError};
pub use flows::{FlowOrchestrator, FlowReport};
pub use pipeline::{PipelineExecutor, StageOutcome, StageRegistry};
pub use settings::Settings;
