// Copyright 2024 Ulvetanna Inc.
use std::{
    collections::{BTreeMap, HashMap},
    io::Write,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{
    data::{region_name, thread_index, LogTree, RegionIdentity},
    err_msg,
    error::SinkError,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Display anything above this percentage in bold red
    pub attention_above_percent: f64,

    /// Display anything above this percentage in regular white.
    /// Anything below this percentage will be displayed in dim white/gray.
    pub relevant_above_percent: f64,

    /// Anything below this percentage is collapsed into `[...]`.
    /// This is checked after duplicate calls below relevant_above_percent are aggregated.
    pub hide_below_percent: f64,

    /// Whether to display parent time minus time of all children as
    /// `[unaccounted]`. Useful to sanity check that you are measuring all the bottlenecks
    pub display_unaccounted: bool,

    /// Render without ANSI colours. Defaults to whether `NO_COLOR` is set.
    pub no_color: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attention_above_percent: 25.0,
            relevant_above_percent: 2.5,
            hide_below_percent: 1.0,
            display_unaccounted: false,
            no_color: std::env::var("NO_COLOR").is_ok_and(|var| !var.is_empty()),
        }
    }
}

/// TreeSink (internally called sink::tree)
/// This sink prints a call tree every time an outermost region closes.
/// Parameters recorded while a region is open are shown next to it.
///
/// example output:
/// ```bash
/// app::solver:solve [ 123.79µs | 100.00% ]
/// ├── app::solver:assemble [ 2.88µs | 2.32% ] { rows = 64 }
/// └── user:iterate [ 51.00µs | 41.20% ]
///    ├── app::kernel:step [ 1.88µs | 1.51% ] (12 calls)
///    └── [...] [ 1.58µs | 1.28% ]
/// ```
pub struct TreeSink<W: Write + Send = std::io::Stdout> {
    graph: Mutex<RegionGraph>,
    out: Mutex<W>,
}

impl Default for TreeSink {
    fn default() -> Self {
        TreeSink::new(Config::default())
    }
}

impl TreeSink {
    pub fn new(config: Config) -> Self {
        Self::with_writer(config, std::io::stdout())
    }
}

impl<W: Write + Send> TreeSink<W> {
    pub fn with_writer(config: Config, out: W) -> Self {
        Self {
            graph: RegionGraph::new(config).into(),
            out: out.into(),
        }
    }

    pub fn into_writer(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_graph<R>(&self, f: impl FnOnce(&mut RegionGraph) -> R) -> R {
        f(&mut self.graph.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record_parameter(&self, name: &str, value: String) -> Result<(), SinkError> {
        self.with_graph(|graph| {
            if let Some(region) = graph
                .open
                .get_mut(&thread_index())
                .and_then(|stack| stack.last_mut())
            {
                region.metadata.insert(name.to_string(), value);
            }
        });
        Ok(())
    }
}

impl<W: Write + Send> super::RegionSink for TreeSink<W> {
    fn region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.with_graph(|graph| {
            let id = graph.next_id;
            graph.next_id += 1;
            graph
                .open
                .entry(thread_index())
                .or_default()
                .push(OpenRegion {
                    id,
                    name: region.region_name(),
                    start: Instant::now(),
                    metadata: BTreeMap::new(),
                });
        });
        Ok(())
    }

    fn region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        let name = region_name(module, function);
        let rendered = self.with_graph(|graph| {
            let thread = thread_index();
            let Some(stack) = graph.open.get_mut(&thread) else {
                err_msg!("region end without open region on this thread");
                return None;
            };
            let Some(position) = stack.iter().rposition(|open| open.name == name) else {
                err_msg!("region end for {name} which is not open");
                return None;
            };
            let region = stack.remove(position);
            let parent = stack.last().map(|p| p.id);
            if stack.is_empty() {
                graph.open.remove(&thread);
            }

            let node = GraphNode {
                id: region.id,
                execution_duration: region.start.elapsed(),
                name: region.name,
                metadata: region.metadata,
                call_count: 1,
            };

            match parent {
                Some(parent) => {
                    graph.children.entry(parent).or_default().push(node);
                    None
                }
                None => {
                    let tree = graph.render_tree(&node, node.execution_duration);
                    graph.discard_subtree(node.id);
                    Some(tree)
                }
            }
        });

        if let Some(tree) = rendered {
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            write!(out, "{tree}")?;
        }
        Ok(())
    }

    fn parameter_int(&self, name: &str, value: i64) -> Result<(), SinkError> {
        self.record_parameter(name, value.to_string())
    }

    fn parameter_uint(&self, name: &str, value: u64) -> Result<(), SinkError> {
        self.record_parameter(name, value.to_string())
    }

    fn parameter_string(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.record_parameter(name, value.to_string())
    }

    fn finalize(&self) -> Result<(), SinkError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.flush()?;
        Ok(())
    }
}

struct OpenRegion {
    id: u64,
    name: String,
    start: Instant,
    metadata: BTreeMap<String, String>,
}

struct RegionGraph {
    open: HashMap<u64, Vec<OpenRegion>>,
    children: HashMap<u64, Vec<GraphNode>>,
    next_id: u64,
    config: Config,
}

impl RegionGraph {
    fn new(config: Config) -> Self {
        Self {
            open: HashMap::new(),
            children: HashMap::new(),
            next_id: 1,
            config,
        }
    }

    fn discard_subtree(&mut self, id: u64) {
        if let Some(children) = self.children.remove(&id) {
            for child in children {
                self.discard_subtree(child.id);
            }
        }
    }

    fn render_tree(&self, node: &GraphNode, root_time: Duration) -> LogTree {
        let mut children = vec![];
        let mut aggregated_node: Option<GraphNode> = None;
        let mut name_counter: HashMap<&str, usize> = HashMap::new();

        let unprocessed_children = self.children.get(&node.id).map_or(&[][..], Vec::as_slice);
        for (i, child) in unprocessed_children.iter().enumerate() {
            let name_count = name_counter.entry(&child.name).or_insert(0);
            *name_count += 1;

            let next = unprocessed_children.get(i + 1);
            if next.is_some_and(|next| next.name == child.name) {
                if child.execution_percentage(root_time) > self.config.relevant_above_percent {
                    let mut indexed_child = child.clone();
                    indexed_child
                        .metadata
                        .insert("index".into(), name_count.to_string());
                    children.push(indexed_child);
                } else {
                    aggregated_node = Some(match aggregated_node.take() {
                        Some(aggregate) => aggregate.aggregate(child),
                        None => child.clone(),
                    });
                }
            } else {
                let child = match aggregated_node.take() {
                    Some(aggregate) => aggregate.aggregate(child),
                    None => child.clone(),
                };
                children.push(child);
            }
        }

        if self.config.hide_below_percent > 0.0 {
            children = children.into_iter().fold(vec![], |mut acc, child| {
                if child.execution_percentage(root_time) < self.config.hide_below_percent {
                    match acc.last_mut() {
                        Some(last) if last.name == "[...]" => {
                            *last = last.clone().aggregate(&child);
                        }
                        _ => acc.push(GraphNode::new("[...]".into()).aggregate(&child)),
                    }
                } else {
                    acc.push(child);
                }
                acc
            });
        }

        if self.config.display_unaccounted && !children.is_empty() {
            let mut unaccounted = GraphNode::new("[unaccounted]".into());
            let accounted: Duration = unprocessed_children
                .iter()
                .map(|x| x.execution_duration)
                .sum();
            unaccounted.execution_duration = node.execution_duration.saturating_sub(accounted);
            children.insert(0, unaccounted);
        }

        LogTree {
            label: node.label(root_time, &self.config),
            children: children
                .iter()
                .map(|child| self.render_tree(child, root_time))
                .collect(),
        }
    }
}

#[derive(Default, Debug, Clone)]
struct GraphNode {
    name: String,
    id: u64,
    execution_duration: Duration,
    metadata: BTreeMap<String, String>,
    call_count: usize,
}

impl GraphNode {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn execution_percentage(&self, root_time: Duration) -> f64 {
        if root_time.is_zero() {
            return 100.0;
        }
        100.0 * self.execution_duration.as_secs_f64() / root_time.as_secs_f64()
    }

    fn label(&self, root_time: Duration, config: &Config) -> String {
        let mut info = vec![];
        if self.call_count > 1 {
            info.push(format!("({} calls)", self.call_count))
        } else if !self.metadata.is_empty() {
            let kv: Vec<_> = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{k} = {v}"))
                .collect();
            info.push(format!("{{ {} }}", kv.join(", ")))
        }

        let name = &self.name;
        let execution_time = self.execution_duration;
        let execution_time_percent = self.execution_percentage(root_time);
        let mut result = format!("{name} [ {execution_time:.2?} | {execution_time_percent:.2}% ]");
        if !info.is_empty() {
            result = format!("{result} {}", info.join(" "));
        }

        if config.no_color {
            result
        } else {
            format!(
                "{}{}\x1b[0m",
                if execution_time_percent > config.attention_above_percent {
                    "\x1b[1;31m" // bold red
                } else if execution_time_percent > config.relevant_above_percent {
                    "\x1b[0m" // white
                } else {
                    "\x1b[2m" // gray
                },
                result
            )
        }
    }

    fn aggregate(mut self, other: &GraphNode) -> Self {
        self.execution_duration += other.execution_duration;
        self.call_count += other.call_count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RegionSink;

    fn plain() -> Config {
        Config {
            hide_below_percent: 0.0,
            no_color: true,
            ..Config::default()
        }
    }

    #[test]
    fn prints_tree_when_root_closes() {
        let sink = TreeSink::with_writer(plain(), Vec::new());
        sink.region_begin(&RegionIdentity::new("app", "root", "None", 0))
            .unwrap();
        sink.region_begin(&RegionIdentity::new("app", "child", "None", 0))
            .unwrap();
        sink.parameter_int("rows", 64).unwrap();
        sink.region_end("app", "child").unwrap();
        sink.region_end("app", "root").unwrap();

        let out = String::from_utf8(sink.into_writer()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("app:root [ "));
        assert!(lines[0].ends_with("| 100.00% ]"));
        assert!(lines[1].starts_with("└── app:child [ "));
        assert!(lines[1].ends_with("{ rows = 64 }"));
    }

    #[test]
    fn nothing_printed_while_root_open() {
        let sink = TreeSink::with_writer(plain(), Vec::new());
        sink.region_begin(&RegionIdentity::new("app", "root", "None", 0))
            .unwrap();
        sink.region_begin(&RegionIdentity::new("app", "child", "None", 0))
            .unwrap();
        sink.region_end("app", "child").unwrap();
        assert!(sink.into_writer().is_empty());
    }

    #[test]
    fn repeated_cheap_children_are_aggregated() {
        let sink = TreeSink::with_writer(
            Config {
                relevant_above_percent: 100.0,
                ..plain()
            },
            Vec::new(),
        );
        sink.region_begin(&RegionIdentity::new("app", "root", "None", 0))
            .unwrap();
        for _ in 0..3 {
            sink.region_begin(&RegionIdentity::new("app", "step", "None", 0))
                .unwrap();
            sink.region_end("app", "step").unwrap();
        }
        sink.region_end("app", "root").unwrap();

        let out = String::from_utf8(sink.into_writer()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("app:step"));
        assert!(lines[1].ends_with("(3 calls)"));
    }
}
