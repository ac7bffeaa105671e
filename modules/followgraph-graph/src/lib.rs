pub mod client;
pub mod migrate;
pub mod writer;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use writer::{
    expansion_statements, BatchReport, ChunkExecutor, GraphBatchWriter, GraphStatement,
    GraphStoreError, GraphWriteError, Neo4jExecutor, MAX_BATCH_SIZE,
};
