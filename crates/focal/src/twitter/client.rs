//! Twitter API v2 client (app-only bearer auth).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::window::{api_timestamp, TimeWindow};

use super::api::{
    CountRequest, EndpointKind, LineStream, RulesApi, SearchApi, SearchRequest, StreamSource,
    TimelineApi, TimelineRequest,
};
use super::types::{
    AddRulesRequest, ApiRule, CountPage, DeleteIds, DeleteRulesRequest, RulesResponse, TweetPage,
};

const TWEET_FIELDS: &str = "id,text,author_id,created_at,conversation_id,lang,possibly_sensitive,\
source,public_metrics,entities,referenced_tweets,attachments,geo";
const USER_FIELDS: &str = "id,name,username,public_metrics";
const EXPANSIONS: &str =
    "author_id,referenced_tweets.id,referenced_tweets.id.author_id,entities.mentions.username";

const RULES_PATH: &str = "/2/tweets/search/stream/rules";
const STREAM_PATH: &str = "/2/tweets/search/stream";

/// HTTP client for every endpoint the collectors use.
#[derive(Clone)]
pub struct TwitterClient {
    client: Client,
    stream_client: Client,
    base_url: String,
    bearer_token: String,
}

impl fmt::Debug for TwitterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterClient")
            .field("base_url", &self.base_url)
            .field("bearer_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl TwitterClient {
    /// Build a client from configuration and a bearer token.
    pub fn new(config: &ApiConfig, bearer_token: impl Into<String>) -> ApiResult<Self> {
        let user_agent = format!("focal/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(user_agent.clone())
            .build()?;
        // No overall timeout: the stream body never finishes.
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            stream_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.bearer_token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ApiResult<T> {
        debug!(path, "GET");
        let response = self
            .authorized(self.client.get(self.url(path)))
            .query(params)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn post_json<T: DeserializeOwned, B: serde::Serialize + Sync>(
        &self,
        path: &str,
        params: &[(&str, String)],
        body: &B,
    ) -> ApiResult<T> {
        debug!(path, "POST");
        let response = self
            .authorized(self.client.post(self.url(path)))
            .query(params)
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }
}

fn field_params() -> Vec<(&'static str, String)> {
    vec![
        ("tweet.fields", TWEET_FIELDS.to_string()),
        ("user.fields", USER_FIELDS.to_string()),
        ("expansions", EXPANSIONS.to_string()),
    ]
}

fn push_window(params: &mut Vec<(&'static str, String)>, window: Option<&TimeWindow>) {
    if let Some(window) = window {
        params.push(("start_time", api_timestamp(window.start)));
        params.push(("end_time", api_timestamp(window.end)));
    }
}

/// Delay until the endpoint's quota resets, from `retry-after` or
/// `x-rate-limit-reset` (epoch seconds).
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(secs) = header("retry-after") {
        return u64::try_from(secs).ok().map(Duration::from_secs);
    }
    let reset = header("x-rate-limit-reset")?;
    let wait = reset - Utc::now().timestamp();
    Some(Duration::from_secs(u64::try_from(wait).unwrap_or(0)))
}

/// Map a non-success status into the error taxonomy.
fn status_error(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ApiError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ApiError::RateLimited {
            retry_after: retry_after(headers),
        };
    }

    #[derive(serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail.or(b.title))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

    if status.is_server_error() {
        ApiError::Unavailable {
            status: status.as_u16(),
            message,
        }
    } else {
        ApiError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let status = response.status();
    let headers = response.headers().clone();

    if headers
        .get("x-rate-limit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0")
    {
        debug!(reset = ?retry_after(&headers), "Rate limit exhausted");
    }

    let bytes = response.bytes().await?;
    if status.is_success() {
        return serde_json::from_slice(&bytes).map_err(ApiError::from);
    }
    Err(status_error(status, &headers, &bytes))
}

/// Re-frame a byte stream into trimmed lines.
///
/// Blank keep-alive lines come through as empty strings. A transport error
/// ends the stream after being yielded once.
pub fn split_lines<S, E>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                return Some((Ok(text), (bytes, buffer, done)));
            }
            if done {
                if buffer.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&buffer).trim().to_string();
                buffer.clear();
                return Some((Ok(text), (bytes, buffer, done)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    buffer.clear();
                    return Some((Err(ApiError::Stream(e.to_string())), (bytes, buffer, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl SearchApi for TwitterClient {
    #[instrument(skip(self, request), fields(query = %request.query))]
    async fn search(&self, endpoint: EndpointKind, request: &SearchRequest) -> ApiResult<TweetPage> {
        let mut params = field_params();
        params.push(("query", request.query.clone()));
        params.push(("max_results", request.max_results.to_string()));
        push_window(&mut params, request.window.as_ref());
        if let Some(token) = &request.next_token {
            params.push(("next_token", token.clone()));
        }
        let path = format!("/2/tweets/search/{}", endpoint.path_suffix());
        self.get_json(&path, &params).await
    }

    #[instrument(skip(self, request), fields(query = %request.query))]
    async fn count(&self, endpoint: EndpointKind, request: &CountRequest) -> ApiResult<CountPage> {
        let mut params = vec![
            ("query", request.query.clone()),
            ("granularity", request.granularity.as_str().to_string()),
        ];
        push_window(&mut params, request.window.as_ref());
        if let Some(token) = &request.next_token {
            params.push(("next_token", token.clone()));
        }
        let path = format!("/2/tweets/counts/{}", endpoint.path_suffix());
        self.get_json(&path, &params).await
    }
}

#[async_trait]
impl TimelineApi for TwitterClient {
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    async fn user_tweets(&self, request: &TimelineRequest) -> ApiResult<TweetPage> {
        let mut params = field_params();
        params.push(("max_results", request.max_results.to_string()));
        push_window(&mut params, request.window.as_ref());
        if let Some(token) = &request.pagination_token {
            params.push(("pagination_token", token.clone()));
        }
        let path = format!("/2/users/{}/tweets", request.user_id);
        self.get_json(&path, &params).await
    }
}

#[async_trait]
impl RulesApi for TwitterClient {
    async fn list_rules(&self) -> ApiResult<Vec<ApiRule>> {
        let response: RulesResponse = self.get_json(RULES_PATH, &[]).await?;
        Ok(response.data)
    }

    async fn add_rules(&self, rules: &[ApiRule], dry_run: bool) -> ApiResult<RulesResponse> {
        let body = AddRulesRequest { add: rules.to_vec() };
        let params = if dry_run {
            vec![("dry_run", "true".to_string())]
        } else {
            Vec::new()
        };
        self.post_json(RULES_PATH, &params, &body).await
    }

    async fn delete_rules(&self, ids: &[String]) -> ApiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = DeleteRulesRequest {
            delete: DeleteIds { ids: ids.to_vec() },
        };
        let response: RulesResponse = self.post_json(RULES_PATH, &[], &body).await?;
        if let Some(err) = response.errors.first() {
            warn!(error = %err.message(), "Rule deletion reported errors");
        }
        Ok(())
    }
}

#[async_trait]
impl StreamSource for TwitterClient {
    async fn connect(&self) -> ApiResult<LineStream> {
        let response = self
            .authorized(self.stream_client.get(self.url(STREAM_PATH)))
            .query(&field_params())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();
            return Err(status_error(status, &headers, &body));
        }
        Ok(split_lines(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_lines_across_chunks() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"a\":")),
            Ok(Bytes::from_static(b"1}\r\n\r\n{\"b\"")),
            Ok(Bytes::from_static(b":2}")),
        ];
        let lines: Vec<String> = split_lines(futures::stream::iter(chunks))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["{\"a\":1}", "", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn test_split_lines_stops_after_error() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"never\n")),
        ];
        let items: Vec<ApiResult<String>> = split_lines(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ApiError::Stream(_))));
    }

    #[test]
    fn test_status_error_mapping() {
        let headers = HeaderMap::new();
        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, &headers, b"{\"title\":\"down\"}");
        assert!(matches!(err, ApiError::Unavailable { status: 503, .. }));
        assert!(err.is_transient());

        let err = status_error(StatusCode::BAD_REQUEST, &headers, b"not json");
        assert!(matches!(err, ApiError::Api { status: 400, ref message } if message == "not json"));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-reset", "1000".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
    }
}
