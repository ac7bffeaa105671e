use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::{query, BoltInteger, BoltMap, BoltString, BoltType, Query};
use thiserror::Error;
use tracing::{info, warn};

use followgraph_common::EntityId;

use crate::GraphClient;

/// Largest number of statements sent to the store in one request.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// An idempotent graph mutation. Every variant is a MERGE, so replaying a
/// batch after a partial failure is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStatement {
    /// `MERGE (:Person {id})`
    MergePerson(EntityId),
    /// `MERGE (follower)-[:FOLLOWS]->(followee)`, merging both endpoints.
    MergeFollows {
        follower: EntityId,
        followee: EntityId,
    },
}

/// Statements for one expanded entity: its own node, then an inbound edge per
/// follower, then an outbound edge per friend.
pub fn expansion_statements(
    entity: EntityId,
    followers: &[EntityId],
    friends: &[EntityId],
) -> Vec<GraphStatement> {
    let mut statements = Vec::with_capacity(1 + followers.len() + friends.len());
    statements.push(GraphStatement::MergePerson(entity));
    statements.extend(followers.iter().map(|&f| GraphStatement::MergeFollows {
        follower: f,
        followee: entity,
    }));
    statements.extend(friends.iter().map(|&f| GraphStatement::MergeFollows {
        follower: entity,
        followee: f,
    }));
    statements
}

/// Failure reported by the graph store for a single request.
#[derive(Debug, Clone, Error)]
#[error("[{}] {message}", .code.as_deref().unwrap_or("unknown"))]
pub struct GraphStoreError {
    /// Store status code, e.g. `Neo.ClientError.Schema.ConstraintValidationFailed`.
    pub code: Option<String>,
    pub message: String,
}

impl From<neo4rs::Error> for GraphStoreError {
    fn from(err: neo4rs::Error) -> Self {
        match &err {
            neo4rs::Error::Neo4j(e) => GraphStoreError {
                code: Some(e.code().to_string()),
                message: e.message().to_string(),
            },
            _ => GraphStoreError {
                code: None,
                message: err.to_string(),
            },
        }
    }
}

/// A batch aborted partway. Chunks before `chunk` were committed.
#[derive(Debug, Error)]
#[error("graph batch failed at chunk {chunk}/{chunks} after {applied} statements: {source}")]
pub struct GraphWriteError {
    /// 1-based index of the failing chunk.
    pub chunk: usize,
    pub chunks: usize,
    /// Statements committed by earlier chunks.
    pub applied: usize,
    pub source: GraphStoreError,
}

/// Executes one chunk of statements as a single store request.
#[async_trait]
pub trait ChunkExecutor: Send + Sync {
    async fn execute_chunk(&self, chunk: &[GraphStatement]) -> Result<(), GraphStoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub statements: usize,
    pub chunks: usize,
}

/// Splits statement lists into chunks of at most [`MAX_BATCH_SIZE`] and runs
/// them in order, stopping at the first failure.
#[derive(Clone)]
pub struct GraphBatchWriter {
    executor: Arc<dyn ChunkExecutor>,
}

impl GraphBatchWriter {
    pub fn new(executor: Arc<dyn ChunkExecutor>) -> Self {
        Self { executor }
    }

    /// Writer backed by a live Neo4j connection.
    pub fn neo4j(client: GraphClient) -> Self {
        Self::new(Arc::new(Neo4jExecutor::new(client)))
    }

    pub async fn execute_batch(
        &self,
        statements: &[GraphStatement],
    ) -> Result<BatchReport, GraphWriteError> {
        let chunks = statements.len().div_ceil(MAX_BATCH_SIZE);
        info!(
            statements = statements.len(),
            chunks, "Executing graph batch"
        );

        let mut applied = 0;
        for (i, chunk) in statements.chunks(MAX_BATCH_SIZE).enumerate() {
            if let Err(source) = self.executor.execute_chunk(chunk).await {
                warn!(
                    chunk = i + 1,
                    chunks,
                    code = source.code.as_deref().unwrap_or("unknown"),
                    message = source.message.as_str(),
                    "Graph chunk failed"
                );
                return Err(GraphWriteError {
                    chunk: i + 1,
                    chunks,
                    applied,
                    source,
                });
            }
            applied += chunk.len();
        }

        Ok(BatchReport {
            statements: applied,
            chunks,
        })
    }
}

/// Runs each chunk inside one transaction: node merges, then edge merges,
/// each as a single UNWIND query.
pub struct Neo4jExecutor {
    client: GraphClient,
}

impl Neo4jExecutor {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkExecutor for Neo4jExecutor {
    async fn execute_chunk(&self, chunk: &[GraphStatement]) -> Result<(), GraphStoreError> {
        let queries = chunk_queries(chunk);
        if queries.is_empty() {
            return Ok(());
        }

        let mut txn = self.client.graph.start_txn().await?;
        for q in queries {
            if let Err(e) = txn.run(q).await {
                if let Err(rollback) = txn.rollback().await {
                    warn!(error = %rollback, "Rollback after failed chunk also failed");
                }
                return Err(e.into());
            }
        }
        txn.commit().await?;
        Ok(())
    }
}

fn chunk_queries(chunk: &[GraphStatement]) -> Vec<Query> {
    let mut persons: Vec<i64> = Vec::new();
    let mut edges: Vec<BoltType> = Vec::new();

    for statement in chunk {
        match *statement {
            GraphStatement::MergePerson(id) => persons.push(id.get()),
            GraphStatement::MergeFollows { follower, followee } => {
                edges.push(BoltType::Map(BoltMap::from_iter(vec![
                    (
                        BoltString::from("follower"),
                        BoltType::Integer(BoltInteger::new(follower.get())),
                    ),
                    (
                        BoltString::from("followee"),
                        BoltType::Integer(BoltInteger::new(followee.get())),
                    ),
                ])));
            }
        }
    }

    let mut queries = Vec::new();
    if !persons.is_empty() {
        queries.push(
            query("UNWIND $ids AS id MERGE (:Person {id: id})").param("ids", persons),
        );
    }
    if !edges.is_empty() {
        queries.push(
            query(
                "UNWIND $edges AS edge
                 MERGE (f:Person {id: edge.follower})
                 MERGE (t:Person {id: edge.followee})
                 MERGE (f)-[:FOLLOWS]->(t)",
            )
            .param("edges", edges),
        );
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records chunk sizes; fails the chunk at `fail_at` (1-based).
    struct Recorder {
        sizes: Mutex<Vec<usize>>,
        fail_at: Option<usize>,
    }

    impl Recorder {
        fn new(fail_at: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                sizes: Mutex::new(Vec::new()),
                fail_at,
            })
        }

        fn sizes(&self) -> Vec<usize> {
            self.sizes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChunkExecutor for Recorder {
        async fn execute_chunk(&self, chunk: &[GraphStatement]) -> Result<(), GraphStoreError> {
            let mut sizes = self.sizes.lock().unwrap();
            if self.fail_at == Some(sizes.len() + 1) {
                return Err(GraphStoreError {
                    code: Some("Neo.TransientError.General.OutOfMemoryError".into()),
                    message: "boom".into(),
                });
            }
            sizes.push(chunk.len());
            Ok(())
        }
    }

    fn persons(n: usize) -> Vec<GraphStatement> {
        (0..n as i64)
            .map(|i| GraphStatement::MergePerson(EntityId(i)))
            .collect()
    }

    #[tokio::test]
    async fn exactly_max_batch_is_one_chunk() {
        let rec = Recorder::new(None);
        let writer = GraphBatchWriter::new(rec.clone());

        let report = writer.execute_batch(&persons(MAX_BATCH_SIZE)).await.unwrap();

        assert_eq!(report.chunks, 1);
        assert_eq!(rec.sizes(), vec![MAX_BATCH_SIZE]);
    }

    #[tokio::test]
    async fn one_over_max_splits_in_order() {
        let rec = Recorder::new(None);
        let writer = GraphBatchWriter::new(rec.clone());

        let report = writer
            .execute_batch(&persons(MAX_BATCH_SIZE + 1))
            .await
            .unwrap();

        assert_eq!(report.chunks, 2);
        assert_eq!(report.statements, MAX_BATCH_SIZE + 1);
        assert_eq!(rec.sizes(), vec![MAX_BATCH_SIZE, 1]);
    }

    #[tokio::test]
    async fn failure_on_second_chunk_keeps_first_applied() {
        let rec = Recorder::new(Some(2));
        let writer = GraphBatchWriter::new(rec.clone());

        let err = writer
            .execute_batch(&persons(2 * MAX_BATCH_SIZE + 5))
            .await
            .unwrap_err();

        assert_eq!(err.chunk, 2);
        assert_eq!(err.chunks, 3);
        assert_eq!(err.applied, MAX_BATCH_SIZE);
        assert_eq!(
            err.source.code.as_deref(),
            Some("Neo.TransientError.General.OutOfMemoryError")
        );
        // Third chunk never attempted.
        assert_eq!(rec.sizes(), vec![MAX_BATCH_SIZE]);
    }

    #[tokio::test]
    async fn empty_batch_executes_nothing() {
        let rec = Recorder::new(None);
        let writer = GraphBatchWriter::new(rec.clone());

        let report = writer.execute_batch(&[]).await.unwrap();

        assert_eq!(report, BatchReport::default());
        assert!(rec.sizes().is_empty());
    }

    #[test]
    fn expansion_orders_node_then_followers_then_friends() {
        let me = EntityId(1);
        let stmts = expansion_statements(me, &[EntityId(2), EntityId(3)], &[EntityId(4)]);

        assert_eq!(
            stmts,
            vec![
                GraphStatement::MergePerson(me),
                GraphStatement::MergeFollows {
                    follower: EntityId(2),
                    followee: me
                },
                GraphStatement::MergeFollows {
                    follower: EntityId(3),
                    followee: me
                },
                GraphStatement::MergeFollows {
                    follower: me,
                    followee: EntityId(4)
                },
            ]
        );
    }

    #[test]
    fn chunk_queries_groups_nodes_and_edges() {
        let stmts = expansion_statements(EntityId(1), &[EntityId(2)], &[]);
        assert_eq!(chunk_queries(&stmts).len(), 2);
        assert_eq!(chunk_queries(&persons(3)).len(), 1);
        assert!(chunk_queries(&[]).is_empty());
    }
}
