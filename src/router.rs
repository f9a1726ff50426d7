//! EventRouter: first-match-wins tag dispatch, with label-scoped secondary
//! routing and an optional tag-to-rule cache.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, warn};
use lru::LruCache;

use crate::config::Element;
use crate::error::{ConfigError, RouterError};
use crate::filter::{AddField, FilterChain, RequireField};
use crate::matcher::Pattern;
use crate::observe::{Observe, ObservedValue};
use crate::record::Record;

/// What a matched rule dispatches a record to.
pub enum Collector {
    /// A terminal sink. `write` is invoked with the matched tag, time and
    /// record; concrete outputs (buffered or otherwise) implement this.
    Output(Box<dyn Fn(&str, i64, &Record) + Send + Sync>),

    /// Runs the record through a filter chain, then passes whatever survives
    /// to the embedded downstream collector (an `Output` or `MultiOutput`,
    /// typically) — mirroring a `<filter>` directive immediately followed by
    /// the `<match>` it feeds.
    Filter(FilterChain, Box<Collector>),

    /// Fans the record out to every sub-collector independently: one
    /// sub-output failing does not stop the others from being tried.
    MultiOutput(Vec<Collector>),

    /// Redirects the record into a named label's rule set instead of the
    /// root agent's.
    Label(String),
}

/// One `(pattern, collector)` entry in an agent's rule list, matched in
/// document order — first match wins. `pattern` is a space-separated list of
/// globs; the rule matches a tag if any one of them does, e.g.
/// `"app.* sys.ping"` matches both `app.access` and `sys.ping`.
pub struct MatchRule {
    patterns: Vec<Pattern>,
    collector: Collector,
}

impl MatchRule {
    pub fn new(pattern: &str, collector: Collector) -> Self {
        Self {
            patterns: pattern.split_whitespace().map(Pattern::compile).collect(),
            collector,
        }
    }

    fn matches(&self, tag: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(tag))
    }
}

/// An ordered rule list, the router dispatches through the root agent and
/// any number of labels reachable via `@label_name`.
#[derive(Default)]
pub struct Agent {
    rules: Vec<MatchRule>,
    no_match_warnings: Mutex<HashMap<String, u32>>,
}

const NO_MATCH_WARN_EVERY: u32 = 1000;

impl Agent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: MatchRule) {
        self.rules.push(rule);
    }

    /// Walks `<match>`/`<filter>` children of `element` in document order,
    /// adding one rule per directive. Any other child (e.g. `<label>`, which
    /// only ever makes sense at the document root) is ignored here.
    pub fn build(element: &Element, outputs: &dyn OutputBuilder) -> Result<Self, ConfigError> {
        let mut agent = Agent::new();
        for child in &element.children {
            match child.name.as_str() {
                "match" => {
                    let tag = child.arg.as_deref().ok_or_else(|| ConfigError::MissingKey("match tag".to_string()))?;
                    agent.add_rule(MatchRule::new(tag, build_output_collector(child, outputs)?));
                }
                "filter" => {
                    let tag = child.arg.as_deref().ok_or_else(|| ConfigError::MissingKey("filter tag".to_string()))?;
                    agent.add_rule(MatchRule::new(tag, build_filter_collector(child, outputs)?));
                }
                _ => {}
            }
        }
        Ok(agent)
    }
}

/// Constructs the `Collector::Output` closure for a `<match>`/`<filter>`'s
/// terminal `@type`. Core `tagflow` only knows how to walk the directive
/// tree, not how to construct a concrete sink (stdout, file, a buffered
/// output over some backing) — a binary wires up its own `OutputBuilder`
/// naming the `@type`s it supports.
pub trait OutputBuilder: Send + Sync {
    fn build(&self, element: &Element) -> Result<Box<dyn Fn(&str, i64, &Record) + Send + Sync>, ConfigError>;
}

fn build_output_collector(element: &Element, outputs: &dyn OutputBuilder) -> Result<Collector, ConfigError> {
    Ok(Collector::Output(outputs.build(element)?))
}

/// A `<filter>` directive's own children name the filter steps to run (in
/// document order), terminating in exactly one nested `<match>` that builds
/// the downstream collector the surviving record is delivered to.
fn build_filter_collector(element: &Element, outputs: &dyn OutputBuilder) -> Result<Collector, ConfigError> {
    let mut chain = FilterChain::new();
    for step in &element.children {
        match step.name.as_str() {
            "require_field" => chain.push(Box::new(RequireField::new(step.get_required("key")?))),
            "add_field" => {
                let key = step.get_required("key")?.to_string();
                let value = step.get_required("value")?.to_string();
                chain.push(Box::new(AddField::new(key, value)));
            }
            "match" => {}
            _ => {}
        }
    }
    let downstream = element
        .children_named("match")
        .next()
        .ok_or_else(|| ConfigError::MissingKey("filter downstream <match>".to_string()))?;
    Ok(Collector::Filter(chain, Box::new(build_output_collector(downstream, outputs)?)))
}

/// Top-level dispatcher: owns the root [`Agent`] plus any number of labels,
/// each its own [`Agent`], reachable via `Collector::Label`.
#[derive(Default)]
pub struct EventRouter {
    root: Agent,
    labels: HashMap<String, Agent>,
    cache: Option<Mutex<LruCache<String, usize>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables a bounded tag -> rule-index cache so repeat tags skip the
    /// linear pattern scan. Optional: this is a performance optimization,
    /// not a correctness requirement.
    pub fn with_tag_cache(mut self, capacity: usize) -> Self {
        if let Some(capacity) = std::num::NonZeroUsize::new(capacity) {
            self.cache = Some(Mutex::new(LruCache::new(capacity)));
        }
        self
    }

    pub fn root_agent_mut(&mut self) -> &mut Agent {
        &mut self.root
    }

    pub fn add_label(&mut self, name: impl Into<String>, agent: Agent) {
        self.labels.insert(name.into(), agent);
    }

    /// Builds a whole router from a parsed config tree: every top-level
    /// `<label @name>` becomes its own [`Agent`], and the root element's own
    /// `<match>`/`<filter>` children become the root agent's rules — both
    /// walked in document order. Runs [`EventRouter::validate`] before
    /// returning so a bad `<label>` reference fails here, not on first emit.
    pub fn build(root: &Element, outputs: &dyn OutputBuilder) -> Result<Self, ConfigError> {
        let mut router = EventRouter::new();
        for label_element in root.children_named("label") {
            let name = label_element
                .arg
                .as_deref()
                .ok_or_else(|| ConfigError::MissingKey("label name".to_string()))?
                .trim_start_matches('@');
            router.add_label(name.to_string(), Agent::build(label_element, outputs)?);
        }
        *router.root_agent_mut() = Agent::build(root, outputs)?;
        router.validate()?;
        Ok(router)
    }

    /// Walks every `Collector::Label` reachable from the root agent and every
    /// other label, failing at config time if a label name is undefined or a
    /// cycle exists. Must be called once after all rules/labels are added,
    /// before `emit` is used — dispatch itself never detects cycles at
    /// runtime, by design: a cycle should fail config loading, not a live
    /// emit.
    pub fn validate(&self) -> Result<(), RouterError> {
        self.validate_agent_labels(&self.root, &mut Vec::new())?;
        for (name, agent) in &self.labels {
            self.validate_agent_labels(agent, &mut vec![name.clone()])?;
        }
        Ok(())
    }

    fn validate_agent_labels(&self, agent: &Agent, path: &mut Vec<String>) -> Result<(), RouterError> {
        for rule in &agent.rules {
            self.validate_collector_labels(&rule.collector, path)?;
        }
        Ok(())
    }

    fn validate_collector_labels(
        &self,
        collector: &Collector,
        path: &mut Vec<String>,
    ) -> Result<(), RouterError> {
        match collector {
            Collector::Label(name) => {
                if path.contains(name) {
                    let mut cycle = path.clone();
                    cycle.push(name.clone());
                    return Err(RouterError::LabelCycle(cycle.join(" -> ")));
                }
                let target = self
                    .labels
                    .get(name)
                    .ok_or_else(|| RouterError::UnknownLabel(name.clone()))?;
                path.push(name.clone());
                self.validate_agent_labels(target, path)?;
                path.pop();
                Ok(())
            }
            Collector::MultiOutput(children) => {
                for child in children {
                    self.validate_collector_labels(child, path)?;
                }
                Ok(())
            }
            Collector::Filter(_, downstream) => self.validate_collector_labels(downstream, path),
            Collector::Output(_) => Ok(()),
        }
    }

    /// Dispatches one `(tag, time, record)` through the root agent.
    pub fn emit(&self, tag: &str, time: i64, record: Record) -> Result<(), RouterError> {
        self.dispatch(&self.root, tag, time, record)
    }

    fn dispatch(&self, agent: &Agent, tag: &str, time: i64, record: Record) -> Result<(), RouterError> {
        let rule = self.lookup(agent, tag);
        let Some(rule) = rule else {
            self.warn_no_match(agent, tag);
            return Err(RouterError::NoMatchingRule {
                tag: tag.to_string(),
            });
        };
        self.run_collector(&rule.collector, tag, time, record)
    }

    /// Looks up the matching rule for `tag` in `agent`. Caching only ever
    /// applies to the root agent: a cached index would otherwise need to be
    /// tagged with which agent it came from, and the linear scan a label's
    /// (typically small) rule set costs is not worth that complexity.
    fn lookup<'a>(&self, agent: &'a Agent, tag: &str) -> Option<&'a MatchRule> {
        let is_root = std::ptr::eq(agent, &self.root);

        if is_root {
            if let Some(cache) = &self.cache {
                let cached_idx = cache.lock().unwrap().get(tag).copied();
                if let Some(idx) = cached_idx {
                    if let Some(rule) = agent.rules.get(idx) {
                        if rule.matches(tag) {
                            return Some(rule);
                        }
                    }
                }
            }
        }

        let found_idx = agent.rules.iter().position(|rule| rule.matches(tag));
        if is_root {
            if let (Some(cache), Some(idx)) = (&self.cache, found_idx) {
                cache.lock().unwrap().put(tag.to_string(), idx);
            }
        }
        found_idx.map(|idx| &agent.rules[idx])
    }

    fn warn_no_match(&self, agent: &Agent, tag: &str) {
        let mut counts = agent.no_match_warnings.lock().unwrap();
        let count = counts.entry(tag.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 || *count % NO_MATCH_WARN_EVERY == 0 {
            warn!("no rule matches tag {tag:?} ({count} occurrences)");
        }
    }

    fn run_collector(
        &self,
        collector: &Collector,
        tag: &str,
        time: i64,
        record: Record,
    ) -> Result<(), RouterError> {
        match collector {
            Collector::Output(write) => {
                write(tag, time, &record);
                Ok(())
            }
            Collector::Filter(chain, downstream) => {
                debug!("applying filter chain for tag {tag:?}");
                match chain.apply(tag, time, record) {
                    Some(filtered) => self.run_collector(downstream, tag, time, filtered),
                    None => Ok(()),
                }
            }
            Collector::MultiOutput(children) => {
                let mut last_err = None;
                for child in children {
                    if let Err(err) = self.run_collector(child, tag, time, record.clone()) {
                        warn!("sub-output failed for tag {tag:?}: {err}");
                        last_err = Some(err);
                    }
                }
                last_err.map_or(Ok(()), Err)
            }
            Collector::Label(name) => {
                let agent = self
                    .labels
                    .get(name)
                    .ok_or_else(|| RouterError::UnknownLabel(name.clone()))?;
                self.dispatch(agent, tag, time, record)
            }
        }
    }
}

impl Observe for EventRouter {
    fn observe(&self) -> HashMap<String, ObservedValue> {
        let mut out = HashMap::new();
        out.insert("RouterLabelCount".to_string(), ObservedValue::from(self.labels.len()));
        out.insert(
            "RouterRootRuleCount".to_string(),
            ObservedValue::from(self.root.rules.len()),
        );
        out
    }
}
