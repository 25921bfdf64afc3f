//! Extraction engine.
//!
//! One stream at a time: resolve the initial cursor, then alternate between
//! fetching a page (under the stream's retry policy) and transforming its
//! records until the cursor reports the walk is exhausted. A fatal fetch or
//! transform error aborts the stream; records already emitted stay emitted
//! and the last checkpoint remains the resumption point.

use crate::chain::RevenueLookup;
use crate::cursor::PageSummary;
use crate::fetch::{PageFetcher, PageRequest};
use crate::model::{Bookmark, Record, TapState};
use crate::sink::RecordSink;
use crate::streams::{Enrichment, StreamDefinition, PAYMENT_ADDRESS_FIELD, PAYMENT_AMOUNT_FIELD};
use extractor_core::backoff::{retry_with_backoff, RetryPolicy};
use extractor_core::config::EndpointsConfig;
use extractor_core::{Error, Result};
use metrics::{counter, histogram};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub records: u64,
    pub pages: u64,
    pub bookmark: Option<Bookmark>,
}

pub struct Engine<'a> {
    fetcher: &'a dyn PageFetcher,
    revenue: Option<&'a dyn RevenueLookup>,
    endpoints: &'a EndpointsConfig,
    start_default: Option<i64>,
    retry_base_delay: Option<Duration>,
}

impl<'a> Engine<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        endpoints: &'a EndpointsConfig,
        start_default: Option<i64>,
    ) -> Self {
        Self {
            fetcher,
            revenue: None,
            endpoints,
            start_default,
            retry_base_delay: None,
        }
    }

    pub fn with_revenue_lookup(mut self, lookup: &'a dyn RevenueLookup) -> Self {
        self.revenue = Some(lookup);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Option<Duration>) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn policy_for(&self, stream: &StreamDefinition) -> RetryPolicy {
        match self.retry_base_delay {
            Some(delay) => stream.retry.with_base_delay(delay),
            None => stream.retry,
        }
    }

    /// Extract one stream to exhaustion, emitting records as they are
    /// transformed and checkpointing `state` after every page that moves the
    /// high-water mark.
    #[instrument(skip_all, fields(stream = stream.name))]
    pub async fn run_stream(
        &self,
        stream: &StreamDefinition,
        state: &mut TapState,
        sink: &mut dyn RecordSink,
    ) -> Result<StreamOutcome> {
        if stream.enrichment.is_some() && self.revenue.is_none() {
            return Err(Error::Config(format!(
                "stream {} needs a revenue lookup",
                stream.name
            )));
        }

        let endpoint = stream.endpoint.url(self.endpoints);
        let policy = self.policy_for(stream);
        let started = Instant::now();

        sink.write_schema(stream)?;

        let mut param = stream
            .pagination
            .initial_param(state.bookmark(stream.name), self.start_default);
        let mut outcome = StreamOutcome::default();

        info!(%param, endpoint, "Starting stream");

        loop {
            info!(%param, "Next page");

            let request = PageRequest {
                stream: stream.name,
                endpoint,
                query: stream.query,
                object_returned: stream.object_returned,
                variables: param.variables(),
            };

            let page = match retry_with_backoff(
                || self.fetcher.fetch_page(&request),
                &policy,
                "fetch_page",
            )
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(%param, error = %e, "Stream extraction failed");
                    counter!("extractor_stream_failures", "stream" => stream.name).increment(1);
                    return Err(e);
                }
            };

            outcome.pages += 1;
            histogram!("extractor_page_size", "stream" => stream.name).record(page.count() as f64);

            let mut summary = PageSummary::default();
            for mut record in page.records {
                stream.post_process(&mut record)?;
                if let Some(enrichment) = stream.enrichment {
                    self.enrich(&mut record, enrichment).await?;
                }
                stream.pagination.observe(&mut summary, &record)?;
                sink.write_record(stream.name, &record)?;
                outcome.records += 1;
            }

            counter!("extractor_records_emitted", "stream" => stream.name)
                .increment(summary.count as u64);
            debug!(
                results = summary.count,
                total = outcome.records,
                max_replication_value = ?summary.max_replication_value,
                "Page transformed"
            );

            if checkpoint(stream, state, &summary)? {
                sink.write_state(state)?;
            }

            match stream.pagination.next_param(&param, &summary)? {
                Some(next) => param = next,
                None => break,
            }
        }

        if stream.pagination.is_incremental() {
            sink.write_state(state)?;
        }
        outcome.bookmark = state.bookmark(stream.name).cloned();

        info!(
            records = outcome.records,
            pages = outcome.pages,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stream completed"
        );

        Ok(outcome)
    }

    async fn enrich(&self, record: &mut Record, enrichment: Enrichment) -> Result<()> {
        let lookup = self
            .revenue
            .ok_or_else(|| Error::Config("no revenue lookup configured".into()))?;

        let transaction = record
            .get(enrichment.key_field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "record is missing transaction field `{}`",
                    enrichment.key_field
                ))
            })?
            .to_string();

        let revenue = lookup.revenue_for(&transaction).await?;
        if revenue.is_empty() {
            debug!(%transaction, "No treasury payment found");
        }

        record.insert(
            PAYMENT_AMOUNT_FIELD.to_string(),
            Value::String(revenue.amount_string()),
        );
        record.insert(
            PAYMENT_ADDRESS_FIELD.to_string(),
            revenue.token_address.map_or(Value::Null, Value::String),
        );
        Ok(())
    }
}

/// Move the stream's bookmark up to the page maximum. Returns whether it
/// moved.
fn checkpoint(stream: &StreamDefinition, state: &mut TapState, summary: &PageSummary) -> Result<bool> {
    let (Some(replication_key), Some(value)) = (
        stream.pagination.replication_key(),
        summary.max_replication_value,
    ) else {
        return Ok(false);
    };

    let current = state
        .bookmark(stream.name)
        .filter(|b| b.replication_key == replication_key)
        .map(|b| b.replication_key_value);
    if current.map_or(false, |current| value <= current) {
        return Ok(false);
    }

    state.advance(
        stream.name,
        Bookmark {
            replication_key: replication_key.to_string(),
            replication_key_value: value,
        },
    )?;
    Ok(true)
}
