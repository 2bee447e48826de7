//! HTTP graph store client
//!
//! Implements `GraphStoreClient` against the graph store's JSON API:
//! - `GET  /entities?limit=&offset=&type=` → page of entities
//! - `GET  /entities/{id}` → one entity (404 → `None`)
//! - `GET  /attention/edges?min_weight=&limit=` → attention edges
//! - `POST /attention/edges` → create or update one edge
//! - `GET  /search?q=&limit=` → matching entity ids
//!
//! List endpoints may answer with a bare JSON array or with an
//! `{"items": [...]}` envelope.

use super::models::{AttentionEdgeRecord, EdgeUpsert, EntityRecord, SearchHit};
use super::traits::GraphStoreClient;
use crate::StoreConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// HTTP-based graph store client.
///
/// Thread-safe and cheaply cloneable (shares the reqwest client internally).
#[derive(Clone)]
pub struct HttpGraphStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse<T> {
    Envelope { items: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Self::Envelope { items } => items,
            Self::Bare(items) => items,
        }
    }
}

impl HttpGraphStore {
    /// Create a client for the store at `base_url`.
    ///
    /// `timeout` bounds every request at the transport level; the snapshot
    /// client applies tighter per-operation budgets on top.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Create a client from the `store` config section.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let longest = config
            .list_timeout_secs
            .max(config.edge_timeout_secs)
            .max(config.write_timeout_secs)
            .max(config.search_timeout_secs);
        Self::new(
            &config.url,
            config.api_key.clone(),
            Duration::from_secs(longest.max(1)),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}/entities/{id}` with the id percent-encoded as one path segment.
    fn entity_url(&self, id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid graph store URL {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Graph store URL {} cannot be a base", self.base_url))?
            .pop_if_empty()
            .push("entities")
            .push(id);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(path);
        let response = self
            .authorize(self.client.get(&url).query(query))
            .send()
            .await
            .with_context(|| format!("Failed to connect to graph store at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Graph store returned {} for {}: {}", status.as_u16(), path, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse graph store response for {}", path))
    }
}

#[async_trait]
impl GraphStoreClient for HttpGraphStore {
    async fn list_entities(
        &self,
        entity_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntityRecord>> {
        let mut query = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
        if let Some(t) = entity_type {
            query.push(("type", t.to_string()));
        }
        let page: ListResponse<EntityRecord> = self.get_json("/entities", &query).await?;
        Ok(page.into_items())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>> {
        let url = self.entity_url(id)?;
        let response = self
            .authorize(self.client.get(url.clone()))
            .send()
            .await
            .with_context(|| format!("Failed to connect to graph store at {}", url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Graph store returned {} for entity {}: {}",
                status.as_u16(),
                id,
                body
            );
        }

        let entity = response
            .json()
            .await
            .with_context(|| format!("Failed to parse entity {}", id))?;
        Ok(Some(entity))
    }

    async fn get_attention_edges(
        &self,
        min_weight: f32,
        limit: usize,
    ) -> Result<Vec<AttentionEdgeRecord>> {
        let query = [
            ("min_weight", min_weight.to_string()),
            ("limit", limit.to_string()),
        ];
        let edges: ListResponse<AttentionEdgeRecord> =
            self.get_json("/attention/edges", &query).await?;
        Ok(edges.into_items())
    }

    async fn upsert_attention_edge(&self, edge: &EdgeUpsert) -> Result<()> {
        let url = self.url("/attention/edges");
        let response = self
            .authorize(self.client.post(&url).json(edge))
            .send()
            .await
            .with_context(|| format!("Failed to connect to graph store at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Graph store rejected edge {} → {} ({}): {}",
                edge.source,
                edge.target,
                status.as_u16(),
                body
            );
        }
        Ok(())
    }

    async fn search_entities(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let params = [("q", query.to_string()), ("limit", limit.to_string())];
        let hits: ListResponse<SearchHit> = self.get_json("/search", &params).await?;
        Ok(hits.into_items().into_iter().map(|h| h.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> HttpGraphStore {
        HttpGraphStore::new(&server.uri(), Some("secret".into()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_entities_bare_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .and(query_param("limit", "2"))
            .and(query_param("offset", "0"))
            .and(query_param("type", "person"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "a", "type": "person"},
                {"id": "b", "type": "person", "embedding": [0.1, 0.2]}
            ])))
            .mount(&server)
            .await;

        let entities = store_for(&server)
            .list_entities(Some("person"), 2, 0)
            .await
            .unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].id, "a");
        assert!(entities[0].embedding.is_none());
        assert_eq!(entities[1].embedding.as_deref(), Some(&[0.1, 0.2][..]));
    }

    #[tokio::test]
    async fn test_list_edges_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attention/edges"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"source": "a", "target": "b", "weight": 0.8, "query_count": 3}]
            })))
            .mount(&server)
            .await;

        let edges = store_for(&server)
            .get_attention_edges(0.0, 100)
            .await
            .unwrap();
        assert_eq!(edges, vec![AttentionEdgeRecord {
            source: "a".into(),
            target: "b".into(),
            weight: 0.8,
            query_count: 3,
            confidence: None,
        }]);
    }

    #[tokio::test]
    async fn test_get_entity_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let entity = store_for(&server).get_entity("missing").await.unwrap();
        assert!(entity.is_none());
    }

    #[tokio::test]
    async fn test_get_entity_encodes_id_as_one_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities/notes%2F2024%3Fdraft"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "notes/2024?draft", "type": "note"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let entity = store_for(&server)
            .get_entity("notes/2024?draft")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.id, "notes/2024?draft");
        assert_eq!(entity.entity_type, "note");
    }

    #[tokio::test]
    async fn test_upsert_edge_posts_body() {
        let server = MockServer::start().await;
        let edge = EdgeUpsert {
            source: "a".into(),
            target: "c".into(),
            weight: 0.75,
            query_id: "run-1".into(),
        };
        Mock::given(method("POST"))
            .and(path("/attention/edges"))
            .and(body_json(&edge))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .upsert_attention_edge(&edge)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .search_entities("rust", 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_search_returns_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "x", "score": 0.9},
                {"id": "y"}
            ])))
            .mount(&server)
            .await;

        let ids = store_for(&server).search_entities("rust", 5).await.unwrap();
        assert_eq!(ids, vec!["x".to_string(), "y".to_string()]);
    }
}
