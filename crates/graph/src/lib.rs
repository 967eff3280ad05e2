pub mod artifacts;
pub mod changeset;
pub mod neo4j_import;

pub use artifacts::{ArtifactWriter, DocumentArtifact};
pub use changeset::{GraphChangeSet, GraphEdge, GraphNode, NodeLabel};
pub use neo4j_import::{ImportStats, Neo4jImporter};
