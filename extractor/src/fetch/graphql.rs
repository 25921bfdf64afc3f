use super::{PageFetcher, PageRequest};
use crate::model::{Page, Record};
use async_trait::async_trait;
use extractor_core::{record_metric, Error, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Subgraph client: POSTs `{query, variables}` and unwraps
/// `data.<object_returned>`.
pub struct GraphQlFetcher {
    client: reqwest::Client,
}

impl GraphQlFetcher {
    pub fn new(user_agent: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    fn record_request(endpoint: &str, status: &str, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        record_metric!(
            histogram,
            "extractor_request_duration_ms",
            elapsed_ms,
            "endpoint" = endpoint.to_string(),
            "status" = status.to_string()
        );
        record_metric!(
            counter,
            "extractor_requests_total",
            1,
            "endpoint" = endpoint.to_string(),
            "status" = status.to_string()
        );
    }
}

#[async_trait]
impl PageFetcher for GraphQlFetcher {
    #[instrument(skip(self, request), fields(stream = request.stream, variables = %request.variables))]
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page> {
        let started = Instant::now();
        let body = json!({
            "query": request.query,
            "variables": request.variables,
        });

        let response = match self.client.post(request.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                Self::record_request(request.endpoint, "error", started);
                return Err(e.into());
            }
        };

        let status = response.status();
        Self::record_request(request.endpoint, status.as_str(), started);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let content = response.text().await.unwrap_or_default();
            info!(url = request.endpoint, "Failed request");
            info!(status = status.as_u16(), reason = %content, "Request was unauthorized");
            return Err(Error::Unauthorized {
                url: request.endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        if status.as_u16() >= 400 {
            let content = response.text().await.unwrap_or_default();
            return Err(Error::request(request.endpoint, status.as_u16(), &content));
        }

        let content = response.text().await?;
        let page = decode_page(request, &content)?;

        debug!(
            records = page.count(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Response received successfully"
        );

        Ok(page)
    }
}

/// Pull the result collection out of a GraphQL response body.
pub fn decode_page(request: &PageRequest<'_>, content: &str) -> Result<Page> {
    let mut envelope: Value = serde_json::from_str(content)?;

    if let Some(errors) = envelope.get("errors") {
        warn!(stream = request.stream, errors = %errors, "GraphQL errors in response");
    }

    let rows = match envelope
        .get_mut("data")
        .and_then(|data| data.get_mut(request.object_returned))
        .map(Value::take)
    {
        Some(Value::Array(rows)) => rows,
        _ => {
            warn!(
                stream = request.stream,
                response = %content,
                "Problem with response"
            );
            return Err(Error::MalformedResponse {
                stream: request.stream.to_string(),
                key: request.object_returned.to_string(),
            });
        }
    };

    let records = rows
        .into_iter()
        .map(|row| match row {
            Value::Object(record) => Ok(record),
            other => Err(Error::Validation(format!(
                "stream {} returned a non-object row: {other}",
                request.stream
            ))),
        })
        .collect::<Result<Vec<Record>>>()?;

    Ok(Page::new(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUERY: &str = "query ($timestamp: Int!) { upgradeItemEvents(first: 1000) { id timestamp } }";

    fn request<'a>(endpoint: &'a str) -> PageRequest<'a> {
        PageRequest {
            stream: "ice_upgrade_item_event",
            endpoint,
            query: QUERY,
            object_returned: "upgradeItemEvents",
            variables: json!({ "timestamp": 1000 }),
        }
    }

    fn fetcher() -> GraphQlFetcher {
        GraphQlFetcher::new(Some("ice-extractor/test"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn decodes_named_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("user-agent", "ice-extractor/test"))
            .and(body_partial_json(json!({ "variables": { "timestamp": 1000 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "upgradeItemEvents": [
                        { "id": "a", "timestamp": "1000" },
                        { "id": "b", "timestamp": "1001" }
                    ]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = fetcher().fetch_page(&request(&server.uri())).await.unwrap();

        assert_eq!(page.count(), 2);
        assert_eq!(page.records[1]["id"], json!("b"));
    }

    #[tokio::test]
    async fn unauthorized_and_forbidden_are_auth_errors() {
        for status in [401u16, 403] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("denied"))
                .mount(&server)
                .await;

            let err = fetcher().fetch_page(&request(&server.uri())).await.unwrap_err();

            assert!(matches!(err, Error::Unauthorized { status: s, .. } if s == status));
            assert!(err.is_fatal());
        }
    }

    #[tokio::test]
    async fn other_error_status_is_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = fetcher().fetch_page(&request(&server.uri())).await.unwrap_err();

        match err {
            Error::Request { url, status, body } => {
                assert_eq!(url, server.uri());
                assert_eq!(status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_collection_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{ "message": "indexing_error" }]
            })))
            .mount(&server)
            .await;

        let err = fetcher().fetch_page(&request(&server.uri())).await.unwrap_err();

        assert!(matches!(
            err,
            Error::MalformedResponse { ref key, .. } if key == "upgradeItemEvents"
        ));
    }

    #[test]
    fn empty_collection_is_an_empty_page() {
        let page = decode_page(
            &request("http://localhost"),
            r#"{"data": {"upgradeItemEvents": []}}"#,
        )
        .unwrap();
        assert_eq!(page.count(), 0);
    }

    #[test]
    fn non_object_rows_are_rejected() {
        let err = decode_page(
            &request("http://localhost"),
            r#"{"data": {"upgradeItemEvents": [1, 2]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
