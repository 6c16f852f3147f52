//! Append-only trace sinks.
//!
//! Sinks are advisory: a failed write is logged and swallowed, never
//! propagated into the run that produced the event. Each sink serializes its
//! own writes, so a single sink instance can be shared across concurrent
//! runs.

use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::canonical::canonical_json;
use crate::config::TracingConfig;
use crate::event::TraceEvent;

/// A polymorphic append-only writer for trace events.
pub trait TraceSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn write(&self, event: &TraceEvent) -> Result<()>;
    /// Drain pending writes and release resources. Idempotent.
    fn close(&self) -> Result<()>;
}

fn event_json(event: &TraceEvent) -> Result<String> {
    let value = serde_json::to_value(event)?;
    Ok(canonical_json(&value))
}

/// One canonical JSON object per line, appended and flushed on every write.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonlSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("failed to create sink directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open jsonl sink {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl TraceSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn write(&self, event: &TraceEvent) -> Result<()> {
        let line = event_json(event)?;
        let mut guard = self.writer.lock().expect("jsonl sink lock poisoned");
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("jsonl sink {} is closed", self.path.display()))?;
        writeln!(writer, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock().expect("jsonl sink lock poisoned");
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// One row per event in an embedded SQLite table, committed per call.
pub struct SqliteSink {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("failed to create sink directory {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open sqlite sink {}", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS traces (
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                runtime_ms INTEGER NOT NULL,
                input_hash TEXT,
                output_hash TEXT,
                error_message TEXT,
                tags TEXT
            )",
            [],
        )?;
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
        })
    }
}

impl TraceSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write(&self, event: &TraceEvent) -> Result<()> {
        let guard = self.conn.lock().expect("sqlite sink lock poisoned");
        let conn = guard
            .as_ref()
            .ok_or_else(|| anyhow!("sqlite sink {} is closed", self.path.display()))?;
        // Autocommit: each insert is its own transaction.
        conn.execute(
            "INSERT INTO traces (trace_id, span_id, node_name, version, status, timestamp,
                                 runtime_ms, input_hash, output_hash, error_message, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                event.trace_id,
                event.span_id,
                event.node_name,
                event.version,
                event.status.as_str(),
                event.timestamp.to_rfc3339(),
                event.runtime_ms as i64,
                event.input_hash,
                event.output_hash,
                event.error_message,
                serde_json::to_string(&event.tags)?,
            ],
        )?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().expect("sqlite sink lock poisoned");
        guard.take();
        Ok(())
    }
}

/// Publishes topic-prefixed canonical JSON lines to a broker socket.
///
/// The topic is `/svc/<status>/<node>`, so subscribers can filter on either
/// dimension with a prefix match.
pub struct StreamSink {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl StreamSink {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .with_context(|| format!("failed to connect stream sink to {addr}"))?;
        Ok(Self {
            addr,
            stream: Mutex::new(Some(stream)),
        })
    }
}

impl TraceSink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn write(&self, event: &TraceEvent) -> Result<()> {
        let payload = event_json(event)?;
        let mut guard = self.stream.lock().expect("stream sink lock poisoned");
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow!("stream sink {} is closed", self.addr))?;
        stream
            .write_all(format!("{} {payload}\n", event.topic()).as_bytes())
            .with_context(|| format!("failed to publish to {}", self.addr))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.stream.lock().expect("stream sink lock poisoned");
        if let Some(stream) = guard.take() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
        Ok(())
    }
}

/// Fan-out over the configured sinks. Write failures are logged per sink and
/// never abort the caller.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self { sinks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the sink set described by `[tracing]` config. A sink that fails
    /// to open is reported and skipped; the engine keeps running without it.
    pub fn from_config(config: &TracingConfig) -> Self {
        let mut sinks: Vec<Arc<dyn TraceSink>> = Vec::new();

        if config.jsonl_enabled {
            match JsonlSink::open(&config.jsonl_path) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => warn!(path = %config.jsonl_path, error = %err, "jsonl sink disabled"),
            }
        }
        if config.sqlite_enabled {
            match SqliteSink::open(&config.sqlite_path) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => warn!(path = %config.sqlite_path, error = %err, "sqlite sink disabled"),
            }
        }
        if config.stream_enabled {
            match StreamSink::connect(&config.stream_host, config.stream_port) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => warn!(
                    host = %config.stream_host,
                    port = config.stream_port,
                    error = %err,
                    "stream sink disabled"
                ),
            }
        }

        debug!(count = sinks.len(), "trace sinks configured");
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn emit(&self, event: &TraceEvent) {
        for sink in &self.sinks {
            if let Err(err) = sink.write(event) {
                warn!(
                    sink = sink.name(),
                    trace_id = %event.trace_id,
                    node = %event.node_name,
                    error = %err,
                    "trace sink write failed"
                );
            }
        }
    }

    pub fn close(&self) {
        for sink in &self.sinks {
            if let Err(err) = sink.close() {
                warn!(sink = sink.name(), error = %err, "trace sink close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecStatus, NodeExecution};
    use chrono::Utc;
    use serde_json::json;

    fn sample_event(trace_id: &str, node: &str) -> TraceEvent {
        let entry = NodeExecution {
            node_name: node.to_string(),
            version: "1.0".to_string(),
            input: json!({}),
            output: Some(json!({"ok": true})),
            status: ExecStatus::Success,
            runtime_ms: 2,
            timestamp: Utc::now(),
            error_message: None,
            input_hash: Some("aa".to_string()),
            output_hash: Some("bb".to_string()),
        };
        TraceEvent::from_execution(trace_id, &["core".to_string()], &entry)
    }

    #[test]
    fn jsonl_sink_appends_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::open(&path).unwrap();

        sink.write(&sample_event("t1", "a")).unwrap();
        sink.write(&sample_event("t2", "b")).unwrap();
        sink.close().unwrap();
        sink.close().unwrap(); // idempotent

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let event: TraceEvent = serde_json::from_str(line).unwrap();
            assert_eq!(event.status, ExecStatus::Success);
        }
    }

    #[test]
    fn jsonl_sink_rejects_writes_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::open(dir.path().join("events.jsonl")).unwrap();
        sink.close().unwrap();
        assert!(sink.write(&sample_event("t1", "a")).is_err());
    }

    #[test]
    fn sqlite_sink_inserts_one_row_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.db");
        let sink = SqliteSink::open(&path).unwrap();
        sink.write(&sample_event("t1", "a")).unwrap();
        sink.write(&sample_event("t1", "b")).unwrap();
        sink.close().unwrap();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM traces WHERE trace_id = 't1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    struct FailingSink;

    impl TraceSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn write(&self, _event: &TraceEvent) -> Result<()> {
            Err(anyhow!("disk on fire"))
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sink_set_swallows_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let jsonl = Arc::new(JsonlSink::open(&path).unwrap());
        let set = SinkSet::new(vec![Arc::new(FailingSink), jsonl]);

        // Must not panic or error; the healthy sink still receives the event.
        set.emit(&sample_event("t1", "a"));
        set.close();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }

    #[test]
    fn stream_sink_publishes_topic_prefixed_lines() {
        use std::io::{BufRead, BufReader};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(conn).read_line(&mut line).unwrap();
            line
        });

        let sink = StreamSink::connect("127.0.0.1", port).unwrap();
        sink.write(&sample_event("t1", "retriever")).unwrap();
        sink.close().unwrap();

        let line = handle.join().unwrap();
        assert!(line.starts_with("/svc/success/retriever "));
        let payload = line.split_once(' ').unwrap().1;
        let event: TraceEvent = serde_json::from_str(payload.trim()).unwrap();
        assert_eq!(event.trace_id, "t1");
    }

    #[test]
    fn stream_sink_connect_failure_disables_gracefully() {
        let config = TracingConfig {
            jsonl_enabled: false,
            sqlite_enabled: false,
            stream_enabled: true,
            stream_host: "127.0.0.1".to_string(),
            // Port 1 is essentially never listening.
            stream_port: 1,
            ..TracingConfig::default()
        };
        let set = SinkSet::from_config(&config);
        assert!(set.is_empty());
    }
}
