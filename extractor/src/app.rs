use crate::chain::rpc::JsonRpcReceiptSource;
use crate::chain::ReceiptLookup;
use crate::engine::{Engine, StreamOutcome};
use crate::fetch::GraphQlFetcher;
use crate::model::TapState;
use crate::sink::RecordSink;
use crate::streams::StreamDefinition;
use extractor_core::backoff::RetryPolicy;
use extractor_core::{Config, Result};
use std::time::Duration;
use tracing::{info, instrument};

pub struct App {
    config: Config,
    fetcher: GraphQlFetcher,
    revenue: ReceiptLookup<JsonRpcReceiptSource>,
}

impl App {
    #[instrument(skip(config))]
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing extractor");

        let timeout = Duration::from_secs(config.extract.request_timeout_secs);
        let fetcher = GraphQlFetcher::new(config.extract.user_agent.as_deref(), timeout)?;

        let source = JsonRpcReceiptSource::new(config.chain.rpc_url.clone(), timeout)?;
        let mut receipt_policy = RetryPolicy::receipt_pending();
        if let Some(delay) = retry_base_delay(&config) {
            receipt_policy = receipt_policy.with_base_delay(delay);
        }
        let revenue =
            ReceiptLookup::new(source, &config.chain.treasury_address).with_policy(receipt_policy);

        Ok(Self {
            config,
            fetcher,
            revenue,
        })
    }

    /// Extract `streams` one after another. A failing stream stops the run;
    /// streams completed before it keep their emitted records and state.
    pub async fn run(
        &self,
        streams: &[StreamDefinition],
        state: &mut TapState,
        sink: &mut dyn RecordSink,
    ) -> Result<Vec<(&'static str, StreamOutcome)>> {
        let engine = Engine::new(
            &self.fetcher,
            &self.config.endpoints,
            self.config.extract.start_updated_at,
        )
        .with_revenue_lookup(&self.revenue)
        .with_retry_base_delay(retry_base_delay(&self.config));

        let mut outcomes = Vec::with_capacity(streams.len());
        for stream in streams {
            let outcome = engine.run_stream(stream, state, sink).await?;
            outcomes.push((stream.name, outcome));
        }

        let total: u64 = outcomes.iter().map(|(_, o)| o.records).sum();
        info!(streams = outcomes.len(), records = total, "Extraction finished");

        Ok(outcomes)
    }
}

fn retry_base_delay(config: &Config) -> Option<Duration> {
    config.extract.retry_base_delay_ms.map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SingerWriter;
    use crate::streams;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> Config {
        let mut config = Config::default();
        config.endpoints.ice_api_url = format!("{}/ice", server.uri());
        config.endpoints.quickswap_api_url = format!("{}/quickswap", server.uri());
        config.endpoints.marketplace_api_url = format!("{}/marketplace", server.uri());
        config.chain.rpc_url = format!("{}/rpc", server.uri());
        config.extract.retry_base_delay_ms = Some(1);
        config
    }

    #[tokio::test]
    async fn runs_streams_and_writes_singer_lines() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/quickswap"))
            .and(body_partial_json(json!({"variables": {"timestamp": 1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "pairDayDatas": [
                        {"id": "d1", "date": "1650000000", "dailyVolumeUSD": "10.5"},
                        {"id": "d2", "date": "1650086400", "dailyVolumeUSD": "12.0"}
                    ]
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/quickswap"))
            .and(body_partial_json(json!({"variables": {"timestamp": 1650086400}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "pairDayDatas": [] }
            })))
            .mount(&server)
            .await;

        let app = App::new(config_for(&server)).unwrap();
        let selected = streams::select(&["ice_usdc_pair".to_string()]).unwrap();
        let mut state = TapState::default();
        let mut writer = SingerWriter::new(Vec::new());

        let outcomes = app.run(&selected, &mut state, &mut writer).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1.records, 2);
        assert_eq!(state.bookmark("ice_usdc_pair").unwrap().replication_key_value, 1650086400);

        let output = String::from_utf8(writer.into_inner()).unwrap();
        let types: Vec<String> = output
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["SCHEMA", "RECORD", "RECORD", "STATE", "STATE"]);
    }

    #[tokio::test]
    async fn unauthorized_endpoint_fails_the_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ice"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let app = App::new(config_for(&server)).unwrap();
        let selected = streams::select(&["ice_level_transfer_events".to_string()]).unwrap();
        let mut state = TapState::default();
        let mut writer = SingerWriter::new(Vec::new());

        let err = app.run(&selected, &mut state, &mut writer).await.unwrap_err();

        assert!(matches!(err, extractor_core::Error::Unauthorized { status: 403, .. }));
    }
}
