//! HTTP client for a document store served by `elevatr-sync serve`

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

use super::{Document, DocumentStore, Query};
use crate::error::{Error, Result};

pub struct HttpDocumentStore {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpDocumentStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid remote url '{base_url}': {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(Error::Config(format!("remote url '{base_url}' cannot hold a path")));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: parsed,
            token: token.to_string(),
        })
    }

    /// `<base>/api/v1/collections/<segments...>` with every segment percent-encoded
    fn collection_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("remote url '{}' cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v1", "collections"])
            .extend(segments);
        Ok(url)
    }

    fn document_url(&self, collection: &str, id: &str) -> Result<Url> {
        self.collection_url(&[collection, id])
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.bearer_auth(&self.token).send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(Error::RemoteUnavailable(
                "document store rejected the API token".into(),
            )),
            status if status.is_server_error() => Err(Error::RemoteUnavailable(format!(
                "document store returned {status}"
            ))),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let response = self
            .send(self.client.get(self.document_url(collection, id)?))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        self.send(self.client.put(self.document_url(collection, id)?).json(&doc))
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let response = self
            .send(self.client.patch(self.document_url(collection, id)?).json(&patch))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{collection}/{id}")));
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.send(self.client.delete(self.document_url(collection, id)?))
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let url = self.collection_url(&[query.collection.as_str(), "query"])?;
        let response = self.send(self.client.post(url).json(query)).await?;
        Ok(response.error_for_status()?.json().await?)
    }
}
