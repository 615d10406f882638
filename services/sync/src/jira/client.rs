use std::time::Duration;

use async_trait::async_trait;
use mirror_common::error::{MirrorError, MirrorResult};
use mirror_config::SourceConfig;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::models::{JiraCommentPage, JiraSearchResponse};
use super::query::build_change_jql;
use crate::source::{ChangeQuery, Comment, IssueSource, SearchPage};

const COMMENT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct JiraClientConfig {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub timeout: Duration,
}

impl JiraClientConfig {
    pub fn from_source(source: &SourceConfig, timeout: Duration) -> Self {
        Self {
            base_url: source.server.clone(),
            email: source.username.clone(),
            api_token: source.api_token.clone(),
            timeout,
        }
    }
}

#[derive(Clone)]
pub struct JiraClient {
    client: Client,
    config: JiraClientConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum JiraClientError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("rate limited by jira")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
}

impl From<JiraClientError> for MirrorError {
    fn from(err: JiraClientError) -> Self {
        match err {
            JiraClientError::RateLimited { retry_after } => MirrorError::RateLimited { retry_after },
            JiraClientError::HttpError { status, .. } if status.is_server_error() => {
                MirrorError::Transient(err.to_string())
            }
            JiraClientError::RequestError(ref e) if e.is_timeout() || e.is_connect() => {
                MirrorError::Transient(err.to_string())
            }
            other => MirrorError::SourceFetchFailed(other.to_string()),
        }
    }
}

impl JiraClient {
    pub fn new(config: JiraClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// For testing: create a client pointing at a specific base URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.to_string();
        self
    }

    /// One page of `GET /rest/api/2/search/jql`, with the changelog expanded.
    pub async fn search_page(
        &self,
        jql: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<JiraSearchResponse, JiraClientError> {
        let url = format!("{}/rest/api/2/search/jql", self.config.base_url);
        let max_results = max_results.to_string();
        let mut params = vec![
            ("jql", jql),
            ("maxResults", max_results.as_str()),
            ("fields", "*all"),
            ("expand", "changelog"),
        ];
        if let Some(token) = page_token {
            params.push(("nextPageToken", token));
        }

        self.send(self.client.get(&url).query(&params)).await
    }

    /// All comments on an issue, oldest first.
    pub async fn fetch_comments(&self, key: &str) -> Result<Vec<Comment>, JiraClientError> {
        let url = format!("{}/rest/api/2/issue/{}/comment", self.config.base_url, key);
        let mut start_at = 0u32;
        let mut comments = Vec::new();

        loop {
            let page: JiraCommentPage = self
                .send(self.client.get(&url).query(&[
                    ("startAt", start_at.to_string()),
                    ("maxResults", COMMENT_PAGE_SIZE.to_string()),
                    ("orderBy", "created".to_owned()),
                ]))
                .await?;

            let page_len = page.comments.len() as u32;
            comments.extend(page.comments.into_iter().filter_map(|c| c.into_comment()));

            start_at = page.start_at + page_len;
            if page_len == 0 || start_at >= page.total {
                break;
            }
        }

        comments.sort_by_key(|c| c.created);
        Ok(comments)
    }

    /// Send once and classify the response; retries are the caller's decision.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, JiraClientError> {
        let response = request
            .basic_auth(&self.config.email, Some(&self.config.api_token))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(JiraClientError::RateLimited { retry_after });
        }

        let body = response.text().await.unwrap_or_default();
        Err(JiraClientError::HttpError { status, body })
    }
}

#[async_trait]
impl IssueSource for JiraClient {
    async fn search(
        &self,
        query: &ChangeQuery,
        page_token: Option<&str>,
        page_size: u32,
    ) -> MirrorResult<SearchPage> {
        let jql = build_change_jql(&query.base_filter, query.since);
        tracing::debug!(jql = %jql, page_token = ?page_token, "searching jira issues");

        let response = self.search_page(&jql, page_token, page_size).await?;
        let next_page_token = match response.is_last {
            Some(true) => None,
            _ => response.next_page_token,
        };

        Ok(SearchPage {
            records: response
                .issues
                .into_iter()
                .map(|issue| issue.into_source_record())
                .collect(),
            next_page_token,
        })
    }

    async fn get_comments(&self, key: &str) -> MirrorResult<Vec<Comment>> {
        Ok(self.fetch_comments(key).await?)
    }
}
