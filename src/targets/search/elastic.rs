//! Elasticsearch over REST
//!
//! The version check reads `version.number`: 6.x wraps mappings in a `_doc` type,
//! 7 and later are typeless.

use super::{FieldKind, IndexDefinition, IndexInventory, SearchHit, SearchStore};
use crate::error::{ProjectionError, ProjectionResult};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;
use url::Url;

const ANALYZER: &str = "material_text";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Mapping types, `_doc` as the single type
    Typed,
    Typeless,
}

impl Dialect {
    pub fn from_version(version: &str) -> ProjectionResult<Self> {
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| {
                ProjectionError::TargetUnavailable(format!(
                    "Unreadable Elasticsearch version '{}'",
                    version
                ))
            })?;
        Ok(if major < 7 {
            Dialect::Typed
        } else {
            Dialect::Typeless
        })
    }

    /// Index creation body: analyzers plus the field mapping, weights in `_meta`
    pub fn index_body(&self, definition: &IndexDefinition) -> Value {
        let mut properties = Map::new();
        let mut weights = Map::new();
        for field in &definition.fields {
            let mapping = match field.kind {
                FieldKind::Text => {
                    weights.insert(field.name.clone(), json!(field.weight));
                    json!({ "type": "text", "analyzer": ANALYZER })
                }
                FieldKind::Keyword => json!({ "type": "keyword" }),
                FieldKind::Date => json!({ "type": "date", "format": "epoch_second" }),
            };
            properties.insert(field.name.clone(), mapping);
        }

        let mapping = json!({
            "_meta": { "weights": weights },
            "properties": properties
        });
        let mappings = match self {
            Dialect::Typed => json!({ "_doc": mapping }),
            Dialect::Typeless => mapping,
        };

        json!({
            "settings": {
                "analysis": {
                    "filter": {
                        "lang_stop": {
                            "type": "stop",
                            "stopwords": format!("_{}_", definition.language)
                        },
                        "lang_stemmer": {
                            "type": "stemmer",
                            "language": definition.language
                        }
                    },
                    "analyzer": {
                        ANALYZER: {
                            "type": "custom",
                            "tokenizer": "standard",
                            "filter": ["lowercase", "lang_stop", "lang_stemmer"]
                        }
                    }
                }
            },
            "mappings": mappings
        })
    }

    /// Mapped field names out of a `GET /{index}/_mapping` response
    pub fn mapped_fields(&self, index: &str, response: &Value) -> Vec<String> {
        let mappings = &response[index]["mappings"];
        let properties = match self {
            Dialect::Typed => &mappings["_doc"]["properties"],
            Dialect::Typeless => &mappings["properties"],
        };
        properties
            .as_object()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn unavailable(e: reqwest::Error) -> ProjectionError {
    ProjectionError::TargetUnavailable(e.to_string())
}

async fn error_text(response: Response) -> String {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let reason = body["error"]["reason"]
        .as_str()
        .or_else(|| body["error"].as_str())
        .unwrap_or("unknown error");
    format!("{}: {}", status, reason)
}

/// Search store backed by an Elasticsearch cluster
pub struct ElasticSearch {
    base: Url,
    client: Client,
    dialect: OnceCell<Dialect>,
}

impl ElasticSearch {
    pub fn new(base: Url, timeout: Duration) -> ProjectionResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProjectionError::Config(format!("Elasticsearch client: {}", e)))?;
        Ok(Self {
            base,
            client,
            dialect: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> ProjectionResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ProjectionError::Config(format!("Elasticsearch URL '{}': {}", path, e)))
    }

    async fn discover(&self) -> ProjectionResult<Dialect> {
        let response = self.client.get(self.url("/")?).send().await.map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(ProjectionError::TargetUnavailable(error_text(response).await));
        }
        let root: Value = response.json().await.map_err(unavailable)?;
        let version = root["version"]["number"].as_str().ok_or_else(|| {
            ProjectionError::TargetUnavailable("Elasticsearch did not report a version".to_string())
        })?;
        let dialect = Dialect::from_version(version)?;
        info!(version, dialect = ?dialect, "Connected to Elasticsearch");
        Ok(dialect)
    }

    async fn dialect(&self) -> ProjectionResult<Dialect> {
        self.dialect.get_or_try_init(|| self.discover()).await.copied()
    }

    async fn put_index(&self, index: &str, body: Option<Value>) -> ProjectionResult<()> {
        let mut request = self.client.put(self.url(index)?);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(unavailable)?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Err(ProjectionError::ConstraintUnsupported(
                error_text(response).await,
            )),
            _ => Err(ProjectionError::TargetUnavailable(error_text(response).await)),
        }
    }
}

#[async_trait]
impl SearchStore for ElasticSearch {
    fn describe(&self) -> String {
        match self.dialect.get() {
            Some(d) => format!("elasticsearch {:?} at {}", d, self.base),
            None => format!("elasticsearch at {}", self.base),
        }
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.dialect().await.map(|_| ())
    }

    async fn delete_index(&self, index: &str) -> ProjectionResult<bool> {
        self.dialect().await?;
        let response = self
            .client
            .delete(self.url(index)?)
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(ProjectionError::TargetUnavailable(error_text(response).await)),
        }
    }

    async fn create_index(&self, index: &str, definition: &IndexDefinition) -> ProjectionResult<()> {
        let body = self.dialect().await?.index_body(definition);
        self.put_index(index, Some(body)).await
    }

    async fn create_plain_index(&self, index: &str) -> ProjectionResult<()> {
        self.dialect().await?;
        self.put_index(index, None).await
    }

    async fn index_document(&self, index: &str, id: &str, document: &Value) -> ProjectionResult<()> {
        self.dialect().await?;
        let response = self
            .client
            .put(self.url(&format!("{}/_doc/{}", index, id))?)
            .json(document)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(ProjectionError::WriteRejected(error_text(response).await))
        } else {
            Err(ProjectionError::TargetUnavailable(error_text(response).await))
        }
    }

    async fn refresh(&self, index: &str) -> ProjectionResult<()> {
        self.dialect().await?;
        let response = self
            .client
            .post(self.url(&format!("{}/_refresh", index))?)
            .send()
            .await
            .map_err(unavailable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProjectionError::TargetUnavailable(error_text(response).await))
        }
    }

    async fn delete_all_documents(&self, index: &str) -> ProjectionResult<u64> {
        self.dialect().await?;
        let response = self
            .client
            .post(self.url(&format!("{}/_delete_by_query?refresh=true", index))?)
            .json(&json!({ "query": { "match_all": {} } }))
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            s if s.is_success() => {
                let body: Value = response.json().await.map_err(unavailable)?;
                Ok(body["deleted"].as_u64().unwrap_or(0))
            }
            StatusCode::NOT_FOUND => Ok(0),
            _ => Err(ProjectionError::TargetUnavailable(error_text(response).await)),
        }
    }

    async fn inventory(&self, index: &str) -> ProjectionResult<IndexInventory> {
        let dialect = self.dialect().await?;
        let response = self
            .client
            .get(self.url(&format!("{}/_count", index))?)
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(IndexInventory::default());
        }
        if !response.status().is_success() {
            return Err(ProjectionError::TargetUnavailable(error_text(response).await));
        }
        let count: Value = response.json().await.map_err(unavailable)?;

        let mapping: Value = self
            .client
            .get(self.url(&format!("{}/_mapping", index))?)
            .send()
            .await
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        Ok(IndexInventory {
            exists: true,
            documents: count["count"].as_u64().unwrap_or(0),
            fields: dialect.mapped_fields(index, &mapping),
        })
    }

    async fn search(
        &self,
        index: &str,
        definition: &IndexDefinition,
        query: &str,
        size: usize,
    ) -> ProjectionResult<Vec<SearchHit>> {
        self.dialect().await?;
        let body = json!({
            "size": size,
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": definition.boosted_fields()
                }
            }
        });
        let response = self
            .client
            .post(self.url(&format!("{}/_search", index))?)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(ProjectionError::TargetUnavailable(error_text(response).await));
        }

        let result: Value = response.json().await.map_err(unavailable)?;
        Ok(result["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| SearchHit {
                        id: hit["_id"].as_str().unwrap_or_default().to_string(),
                        score: hit["_score"].as_f64().unwrap_or(0.0),
                        source: hit["_source"].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
