use anyhow::{Context, Result};
use neo4rs::{BoltList, BoltMap, BoltNull, BoltString, BoltType, Graph, Query};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use extract::{ExtractionRun, RetryPolicy};

use crate::changeset::{GraphChangeSet, GraphEdge, NodeLabel, Properties};

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ImportStats {
    pub nodes: usize,
    pub edges: usize,
}

impl ImportStats {
    fn add(&mut self, other: ImportStats) {
        self.nodes += other.nodes;
        self.edges += other.edges;
    }
}

/// Applies change-sets to Neo4j with `MERGE`, so re-importing a run is idempotent.
pub struct Neo4jImporter {
    graph: Graph,
    retry: RetryPolicy,
}

impl Neo4jImporter {
    pub fn new(graph: Graph, retry: RetryPolicy) -> Self {
        Self { graph, retry }
    }

    pub async fn connect(uri: &str, user: &str, password: &str, retry: RetryPolicy) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .context(format!("Failed to connect to Neo4j at {}", uri))?;
        Ok(Self::new(graph, retry))
    }

    /// One uniqueness constraint per node label on `id`
    pub async fn init_schema(&self) -> Result<()> {
        for label in NodeLabel::ALL {
            let statement = format!(
                "CREATE CONSTRAINT {}_id IF NOT EXISTS FOR (n:{}) REQUIRE n.id IS UNIQUE",
                label.as_str().to_lowercase(),
                label.as_str()
            );
            self.run("init_schema", || Query::new(statement.clone())).await?;
        }
        info!("Neo4j constraints created");
        Ok(())
    }

    pub async fn apply(&self, changes: &GraphChangeSet) -> Result<ImportStats> {
        for node in &changes.nodes {
            let statement = node_statement(node.label);
            self.run("merge_node", || {
                Query::new(statement.clone())
                    .param("id", node.id.clone())
                    .param("props", properties_to_bolt(&node.properties))
            })
            .await
            .context(format!("Failed to merge {} node {}", node.label.as_str(), node.id))?;
        }

        for edge in &changes.edges {
            let statement = edge_statement(edge);
            self.run("merge_edge", || {
                Query::new(statement.clone())
                    .param("from_id", edge.from_id.clone())
                    .param("to_id", edge.to_id.clone())
                    .param("props", properties_to_bolt(&edge.properties))
            })
            .await
            .context(format!(
                "Failed to merge {} edge {} -> {}",
                edge.edge_type, edge.from_id, edge.to_id
            ))?;
        }

        debug!(nodes = changes.nodes.len(), edges = changes.edges.len(), "Change-set applied");
        Ok(ImportStats {
            nodes: changes.nodes.len(),
            edges: changes.edges.len(),
        })
    }

    /// The codebook first, then one change-set per completed document.
    pub async fn import_run(&self, run: &ExtractionRun) -> Result<ImportStats> {
        let mut stats = self.apply(&GraphChangeSet::for_schemas(&run.schemas)).await?;
        for result in run.results() {
            stats.add(self.apply(&GraphChangeSet::for_document(result)).await?);
        }
        info!(
            run_id = %run.run_id,
            nodes = stats.nodes,
            edges = stats.edges,
            "Run imported into Neo4j"
        );
        Ok(stats)
    }

    async fn run<F>(&self, operation: &str, build: F) -> Result<()>
    where
        F: Fn() -> Query,
    {
        let graph = &self.graph;
        self.retry
            .retry(operation, || {
                let query = build();
                async move { graph.run(query).await }
            })
            .await
            .map_err(anyhow::Error::from)
    }
}

pub fn node_statement(label: NodeLabel) -> String {
    format!("MERGE (n:{} {{id: $id}}) SET n += $props", label.as_str())
}

/// Edge endpoints are matched, never created; an edge to a missing node is a no-op.
pub fn edge_statement(edge: &GraphEdge) -> String {
    format!(
        "MATCH (a:{} {{id: $from_id}}) MATCH (b:{} {{id: $to_id}}) MERGE (a)-[r:{}]->(b) SET r += $props",
        edge.from_label.as_str(),
        edge.to_label.as_str(),
        edge.edge_type
    )
}

pub fn properties_to_bolt(properties: &Properties) -> BoltType {
    let mut map = BoltMap::new();
    for (key, value) in properties {
        map.put(BoltString::from(key.as_str()), value_to_bolt(value));
    }
    BoltType::Map(map)
}

/// Neo4j properties cannot be maps; nested objects are stored as JSON text.
fn value_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => BoltType::from(s.clone()),
        Value::Array(items) => {
            let mut list = BoltList::new();
            for item in items {
                list.push(match item {
                    Value::Object(_) | Value::Array(_) => BoltType::from(item.to_string()),
                    scalar => value_to_bolt(scalar),
                });
            }
            BoltType::List(list)
        }
        Value::Object(_) => BoltType::from(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::THEMATIC_CONNECTION;
    use serde_json::json;

    #[test]
    fn test_statements() {
        assert_eq!(
            node_statement(NodeLabel::Quote),
            "MERGE (n:Quote {id: $id}) SET n += $props"
        );

        let edge = GraphEdge {
            edge_type: THEMATIC_CONNECTION.to_string(),
            from_label: NodeLabel::Quote,
            from_id: "d:q0002".to_string(),
            to_label: NodeLabel::Quote,
            to_id: "d:q0001".to_string(),
            properties: Properties::new(),
        };
        assert_eq!(
            edge_statement(&edge),
            "MATCH (a:Quote {id: $from_id}) MATCH (b:Quote {id: $to_id}) \
             MERGE (a)-[r:THEMATIC_CONNECTION]->(b) SET r += $props"
        );
    }

    #[test]
    fn test_property_conversion() {
        let mut properties = Properties::new();
        properties.insert("count".to_string(), json!(3));
        properties.insert("rate".to_string(), json!(0.5));
        properties.insert("tags".to_string(), json!(["a", "b"]));
        properties.insert("nested".to_string(), json!({"k": 1}));

        let BoltType::Map(map) = properties_to_bolt(&properties) else {
            panic!("expected a map");
        };
        assert_eq!(map.value.len(), 4);
        assert!(matches!(map.value.get(&BoltString::from("count")), Some(BoltType::Integer(_))));
        assert!(matches!(map.value.get(&BoltString::from("rate")), Some(BoltType::Float(_))));
        assert!(matches!(map.value.get(&BoltString::from("tags")), Some(BoltType::List(_))));
        assert!(matches!(map.value.get(&BoltString::from("nested")), Some(BoltType::String(_))));
    }
}
