use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

use crate::config::AppConfig;
use crate::graph::GraphStore;
use crate::models::{GraphNode, GraphStats};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    // Graph::new es perezoso: comprobamos la conectividad de verdad.
    graph.run(query("RETURN 1")).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints básicos para las etiquetas usadas en el grafo:
/// :Document, :Entity y :Chunk
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Document.id único
        "CREATE CONSTRAINT doc_id IF NOT EXISTS
         FOR (d:Document)
         REQUIRE d.id IS UNIQUE",
        // Entity.name único (clave natural)
        "CREATE CONSTRAINT entity_name IF NOT EXISTS
         FOR (e:Entity)
         REQUIRE e.name IS UNIQUE",
        // Chunk.id único
        "CREATE CONSTRAINT chunk_id IF NOT EXISTS
         FOR (c:Chunk)
         REQUIRE c.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}

/// Almacén del grafo de conocimiento sobre Neo4j. Todas las escrituras usan
/// `MERGE`, por lo que reingestar no duplica nodos ni relaciones.
pub struct Neo4jGraphStore {
    graph: Arc<Graph>,
}

impl Neo4jGraphStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    async fn count(&self, cypher: &str) -> crate::error::Result<usize> {
        let mut cursor = self.graph.execute(query(cypher)).await?;
        let count = match cursor.next().await? {
            Some(row) => row.get::<i64>("n").unwrap_or_default(),
            None => 0,
        };
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    fn name(&self) -> &str {
        "Neo4j"
    }

    async fn upsert_document(&self, id: &str, filename: &str, page: u32) -> crate::error::Result<()> {
        self.graph
            .run(
                query(
                    "MERGE (d:Document {id: $id})
                     SET d.filename = $filename, d.page = $page",
                )
                .param("id", id)
                .param("filename", filename)
                .param("page", page as i64),
            )
            .await?;
        Ok(())
    }

    async fn upsert_entity_mention(&self, document_id: &str, entity_name: &str) -> crate::error::Result<()> {
        self.graph
            .run(
                query(
                    "MATCH (d:Document {id: $id})
                     MERGE (e:Entity {name: $name})
                     MERGE (d)-[:MENTIONS]->(e)",
                )
                .param("id", document_id)
                .param("name", entity_name),
            )
            .await?;
        Ok(())
    }

    async fn query_mentions(
        &self,
        entity_name: &str,
        k: usize,
    ) -> crate::error::Result<Vec<(GraphNode, GraphNode)>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {name: $name})<-[:MENTIONS]-(d:Document)
                     RETURN e.name AS name, d.id AS id, d.filename AS filename, d.page AS page
                     LIMIT $k",
                )
                .param("name", entity_name)
                .param("k", k as i64),
            )
            .await?;

        let mut pairs = Vec::new();
        while let Some(row) = cursor.next().await? {
            let (Some(name), Some(id)) = (row.get::<String>("name"), row.get::<String>("id")) else {
                continue;
            };
            let filename: String = row.get("filename").unwrap_or_default();
            let page = row.get::<i64>("page").unwrap_or_default().max(0) as u32;
            pairs.push((
                GraphNode::Entity { name },
                GraphNode::Document { id, filename, page },
            ));
        }
        Ok(pairs)
    }

    async fn stats(&self) -> crate::error::Result<GraphStats> {
        Ok(GraphStats {
            documents: self.count("MATCH (d:Document) RETURN count(d) AS n").await?,
            entities: self.count("MATCH (e:Entity) RETURN count(e) AS n").await?,
            mentions: self
                .count("MATCH (:Document)-[r:MENTIONS]->(:Entity) RETURN count(r) AS n")
                .await?,
        })
    }

    async fn reset(&self) -> crate::error::Result<()> {
        self.graph
            .run(query("MATCH (n) WHERE n:Document OR n:Entity DETACH DELETE n"))
            .await?;
        Ok(())
    }
}
