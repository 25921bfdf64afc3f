//! Singer-format output: SCHEMA, RECORD and STATE messages as JSON lines.

use crate::model::{Record, TapState};
use crate::streams::StreamDefinition;
use chrono::{DateTime, Utc};
use extractor_core::Result;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;

pub trait RecordSink {
    fn write_schema(&mut self, stream: &StreamDefinition) -> Result<()>;
    fn write_record(&mut self, stream: &str, record: &Record) -> Result<()>;
    fn write_state(&mut self, state: &TapState) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum Message<'a> {
    Schema {
        stream: &'a str,
        schema: Value,
        key_properties: &'a [&'a str],
        bookmark_properties: Vec<&'a str>,
    },
    Record {
        stream: &'a str,
        record: &'a Record,
        time_extracted: DateTime<Utc>,
    },
    State {
        value: &'a TapState,
    },
}

pub struct SingerWriter<W: Write> {
    out: W,
}

impl<W: Write> SingerWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, message: &Message<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, message)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> RecordSink for SingerWriter<W> {
    fn write_schema(&mut self, stream: &StreamDefinition) -> Result<()> {
        self.emit(&Message::Schema {
            stream: stream.name,
            schema: stream.json_schema(),
            key_properties: stream.primary_keys,
            bookmark_properties: stream.pagination.replication_key().into_iter().collect(),
        })
    }

    fn write_record(&mut self, stream: &str, record: &Record) -> Result<()> {
        self.emit(&Message::Record {
            stream,
            record,
            time_extracted: Utc::now(),
        })
    }

    fn write_state(&mut self, state: &TapState) -> Result<()> {
        self.emit(&Message::State { value: state })?;
        // State is the resumption point; don't leave it sitting in a buffer.
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Emitted {
        Schema(String),
        Record(String, Record),
        State(TapState),
    }

    /// Collects everything in memory, in emission order.
    #[derive(Debug, Default)]
    pub struct MemorySink {
        pub emitted: Vec<Emitted>,
    }

    impl MemorySink {
        pub fn records(&self) -> Vec<&Record> {
            self.emitted
                .iter()
                .filter_map(|e| match e {
                    Emitted::Record(_, record) => Some(record),
                    _ => None,
                })
                .collect()
        }

        pub fn states(&self) -> Vec<&TapState> {
            self.emitted
                .iter()
                .filter_map(|e| match e {
                    Emitted::State(state) => Some(state),
                    _ => None,
                })
                .collect()
        }
    }

    impl RecordSink for MemorySink {
        fn write_schema(&mut self, stream: &StreamDefinition) -> Result<()> {
            self.emitted.push(Emitted::Schema(stream.name.to_string()));
            Ok(())
        }

        fn write_record(&mut self, stream: &str, record: &Record) -> Result<()> {
            self.emitted.push(Emitted::Record(stream.to_string(), record.clone()));
            Ok(())
        }

        fn write_state(&mut self, state: &TapState) -> Result<()> {
            self.emitted.push(Emitted::State(state.clone()));
            Ok(())
        }
    }
}
