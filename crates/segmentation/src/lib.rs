//! Computed-properties engine: segment and user-property definitions, their
//! evaluation, incremental assignment computation, and the query/export
//! surface over the results.

pub mod builder;
pub mod computed;
pub mod definition;
pub mod engine;
pub mod evaluator;
pub mod export;
pub mod periods;
pub mod predicates;
pub mod query;
pub mod registry;
pub mod store;

pub use builder::SegmentBuilder;
pub use computed::{evaluate_user_property, UserPropertyDefinition};
pub use definition::{DefinitionError, SegmentDefinition, SegmentNode, SegmentTree};
pub use engine::{AssignmentEngine, ComputeReport, ComputeWindow, RunOutcome};
pub use evaluator::{evaluate_segment, EvalContext, EvaluationError, ManualMembership};
pub use export::SegmentsFile;
pub use periods::{Freshness, StalenessTracker, StepPeriod, STALE_AFTER_SECS};
pub use query::{AssignmentQueries, RecentlyUpdatedUser};
pub use registry::{
    DefinitionRegistry, Segment, SegmentStatus, UpsertSegment, UpsertUserProperty,
    UpsertValidationError, UserProperty,
};
pub use store::Stores;
