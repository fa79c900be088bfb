pub mod aggregate;
pub mod error;
pub mod model;
pub mod requirements;
pub mod rewrite;
pub mod source;
pub mod xml;

pub use aggregate::aggregate_state_for_path;
pub use error::TopologyError;
pub use model::{
    CollectionPlacement, Requirement, RequirementKind, RuntimeCollection, RuntimeTask, Topology,
    ROOT_GROUP,
};
pub use requirements::{extract, ExtractedRequirements};
pub use rewrite::reduce_groups;
pub use source::resolve_topology_file;
