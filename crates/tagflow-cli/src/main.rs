//! Demo wiring: reads `tag: payload` lines from stdin, parses each into a
//! tagged [`Record`], and dispatches it through an [`EventRouter`] into a
//! buffered stdout output. Exercises the core end-to-end without a real
//! socket transport, which is out of scope. Pass a config file path as the
//! first argument to drive the router from a `<match>`/`<filter>`/`<label>`
//! directive tree instead of the hardcoded catch-all rule.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use tagflow::config::Element;
use tagflow::error::ConfigError;
use tagflow::record::Record;
use tagflow::router::{Collector, EventRouter, MatchRule, OutputBuilder};
use tagflow_output::buffered_output::{BufferedOutput, OutputConfig};
use tagflow_output::sink::StdoutSink;

type OutputFn = Box<dyn Fn(&str, i64, &Record) + Send + Sync>;

fn stdout_output_fn() -> OutputFn {
    let buffer = tagflow::Buffer::new(tagflow::chunk::MemoryBacking, tagflow::BufferConfig::default());
    let output = Arc::new(BufferedOutput::spawn(
        buffer,
        Arc::new(StdoutSink::new(false)),
        OutputConfig {
            flush_interval: Duration::from_millis(500),
            pop_parallel: false,
            ..Default::default()
        },
    ));
    Box::new(move |tag, time, record| {
        if let Err(err) = output.append(tag, time, record) {
            log::warn!("dropping record for tag {tag:?}: {err}");
        }
    })
}

fn build_stdout_collector() -> Collector {
    Collector::Output(stdout_output_fn())
}

/// Pairs a file-backed (crash-recoverable) buffer with the stdout sink: a
/// chunk survives a process restart as a `.b`/`.q` file under `dir` until
/// it's actually been written out.
fn durable_stdout_output_fn(dir: &str) -> anyhow::Result<OutputFn> {
    let backing = tagflow_file::FileBacking::new(dir)?;
    let buffer = tagflow::Buffer::new(backing, tagflow::BufferConfig::default());
    let output = Arc::new(BufferedOutput::spawn(
        buffer,
        Arc::new(StdoutSink::new(false)),
        OutputConfig {
            flush_interval: Duration::from_millis(500),
            pop_parallel: false,
            ..Default::default()
        },
    ));
    Ok(Box::new(move |tag, time, record| {
        if let Err(err) = output.append(tag, time, record) {
            log::warn!("dropping record for tag {tag:?}: {err}");
        }
    }))
}

/// Resolves each `<match>`/`<filter>`'s `@type` to a concrete sink. `stdout`
/// and `durable_stdout` are the only types this demo binary wires up; a real
/// deployment registers one closure per supported output.
struct DemoOutputs;

impl OutputBuilder for DemoOutputs {
    fn build(&self, element: &Element) -> Result<OutputFn, ConfigError> {
        match element.get_required("@type")? {
            "stdout" => Ok(stdout_output_fn()),
            "durable_stdout" => {
                let dir = element.get_required("path")?;
                durable_stdout_output_fn(dir).map_err(|err| ConfigError::InvalidValue {
                    key: "path".to_string(),
                    reason: err.to_string(),
                })
            }
            other => Err(ConfigError::InvalidValue {
                key: "@type".to_string(),
                reason: format!("unsupported output type {other:?}"),
            }),
        }
    }
}

fn parse_line(line: &str) -> Option<(String, Record)> {
    let (tag, payload) = line.split_once(": ")?;
    let mut record = Record::new();
    record.set("message", payload);
    Some((tag.trim().to_string(), record))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let router = match std::env::args().nth(1) {
        Some(config_path) => {
            let source = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading config file {config_path:?}"))?;
            let root = tagflow::config::parse(&source).context("parsing config file")?;
            EventRouter::build(&root, &DemoOutputs).context("building router from config")?
        }
        None => {
            let mut router = EventRouter::new();
            router
                .root_agent_mut()
                .add_rule(MatchRule::new("**", build_stdout_collector()));
            router.validate().context("invalid router configuration")?;
            router
        }
    };

    info!("tagflow-cli reading tagged lines from stdin (format: \"tag: payload\")");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read line from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let Some((tag, record)) = parse_line(&line) else {
            log::warn!("skipping unparseable line: {line:?}");
            continue;
        };
        if let Err(err) = router.emit(&tag, now_unix(), record) {
            log::warn!("emit failed: {err}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_splits_tag_and_message() {
        let (tag, record) = parse_line("app.access: GET /index.html 200").unwrap();
        assert_eq!(tag, "app.access");
        assert_eq!(
            record.get("message"),
            Some(&tagflow::record::Value::String("GET /index.html 200".to_string()))
        );
    }

    #[test]
    fn parse_line_rejects_lines_without_a_colon_separator() {
        assert!(parse_line("no colon here").is_none());
    }
}
