use neo4rs::{query, ConfigBuilder, Graph};

/// Thin wrapper around neo4rs::Graph providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    /// Connect to Neo4j with the given credentials.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(10)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }

    /// Count `Person` nodes and `FOLLOWS` edges. Used by health checks and tests.
    pub async fn counts(&self) -> Result<(i64, i64), neo4rs::Error> {
        let q = query(
            "OPTIONAL MATCH (p:Person) WITH count(p) AS persons
             OPTIONAL MATCH (:Person)-[f:FOLLOWS]->(:Person)
             RETURN persons, count(f) AS follows",
        );
        let mut stream = self.graph.execute(q).await?;
        if let Some(row) = stream.next().await? {
            let persons: i64 = row.get("persons").unwrap_or(0);
            let follows: i64 = row.get("follows").unwrap_or(0);
            return Ok((persons, follows));
        }
        Ok((0, 0))
    }
}
