//! Writes change records to stdout, one line each.

use std::future::Future;
use std::io::{self, Write};

use serde_json::json;
use slotstream_core::{ChangeRecord, ChangeSink, Durability, Error, Result};

use crate::config::OutputFormat;

pub struct LineSink<W> {
    out: W,
    format: OutputFormat,
}

impl LineSink<io::Stdout> {
    pub fn stdout(format: OutputFormat) -> Self {
        Self::new(io::stdout(), format)
    }
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_record(&mut self, record: &ChangeRecord) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => {
                self.out.write_all(&record.data)?;
                self.out.write_all(b"\n")?;
            }
            OutputFormat::Json => {
                // wal2json output is embedded as JSON; anything else as a string.
                let data = serde_json::from_slice::<serde_json::Value>(&record.data)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&record.data).into_owned().into());

                let line = json!({
                    "lsn": record.lsn,
                    "wal_end": record.wal_end,
                    "server_time": record.server_timestamp().map(|t| t.to_rfc3339()),
                    "data": data,
                });
                serde_json::to_writer(&mut self.out, &line)?;
                self.out.write_all(b"\n")?;
            }
        }
        self.out.flush()
    }
}

impl<W: Write + Send> ChangeSink for LineSink<W> {
    fn deliver(&mut self, record: ChangeRecord) -> impl Future<Output = Result<Durability>> + Send {
        let written = self
            .write_record(&record)
            .map(|()| Durability::Persisted)
            .map_err(|e| Error::Sink(format!("failed to write change at {}: {}", record.lsn, e)));

        async move { written }
    }
}
