//! ABOUTME: Komposition validation, compilation to a build-plan DAG, execution
//! ABOUTME: Topological execute with output chaining and partial cleanup

pub mod compiler;
pub mod executor;
pub mod komposition;
pub mod plan;

pub use compiler::{decompile, CompiledPlan, Compiler};
pub use executor::{ExecutedPlan, PartialOutputs, PlanExecutor, ProgressEvent, ProgressSink};
pub use komposition::{
    AudioSpec, Komposition, KompositionMetadata, MusicalRole, Segment, SegmentParams,
    ValidationIssue, ValidationReport, DURATION_EPSILON_S,
};
pub use plan::{BuildPlan, NodeInput, PlanNode, Produces, SegmentBinding};
