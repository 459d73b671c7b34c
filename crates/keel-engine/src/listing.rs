//! Plan listings.

use keel_scheduler::frequency::{interval_minutes, interval_string};
use keel_scheduler::triggers::last_controlling_trigger;
use keel_scheduler::{BuildGraph, NodeId};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// One line of a plan listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum ListingEntry {
    AggregatesHeader,
    Aggregate(String),
    NodesHeader,
    /// `triggered` is unknown when unfinished triggers were not computed.
    TriggerHeader {
        dot_name: String,
        triggered: Option<bool>,
    },
    AgentGroup(String),
    Node {
        name: String,
        grouped: bool,
        interval: String,
        complete: bool,
        trigger: bool,
        sticky: bool,
        memory_gb: u32,
    },
    Agenda(String),
    Dependency {
        name: String,
        pseudo: bool,
    },
    History(String),
}

impl fmt::Display for ListingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingEntry::AggregatesHeader => write!(f, "*********** Aggregates"),
            ListingEntry::Aggregate(name) => write!(f, "    {}", name),
            ListingEntry::NodesHeader => {
                write!(f, "*********** Desired And Dependent Nodes, in order.")
            }
            ListingEntry::TriggerHeader {
                dot_name,
                triggered,
            } => {
                let finished = match triggered {
                    Some(true) => "(already triggered)",
                    Some(false) => "(not yet triggered)",
                    None => "",
                };
                write!(f, "  Controlling Trigger: {}    {}", dot_name, finished)
            }
            ListingEntry::AgentGroup(group) => write!(f, "    Agent Group: {}", group),
            ListingEntry::Node {
                name,
                grouped,
                interval,
                complete,
                trigger,
                sticky,
                memory_gb,
            } => {
                write!(f, "      ")?;
                if *grouped {
                    write!(f, "  ")?;
                }
                write!(f, "{} ({})", name, interval)?;
                if *complete {
                    write!(f, " - (Completed)")?;
                }
                if *trigger {
                    write!(f, " - (TriggerNode)")?;
                }
                if *sticky {
                    write!(f, " - (Sticky)")?;
                }
                if *memory_gb != 0 {
                    write!(f, " [{}gb]", memory_gb)?;
                }
                Ok(())
            }
            ListingEntry::Agenda(line) => write!(f, "         agenda> {}", line),
            ListingEntry::Dependency { name, pseudo: false } => {
                write!(f, "            dep> {}", name)
            }
            ListingEntry::Dependency { name, pseudo: true } => {
                write!(f, "           pdep> {}", name)
            }
            ListingEntry::History(line) => write!(f, "         {}", line),
        }
    }
}

/// How much detail a listing carries.
#[derive(Debug, Clone, Copy)]
pub struct ListingOptions {
    pub time_quantum: u32,
    pub show_dependencies: bool,
}

/// List `ordered` in the legacy format.
///
/// Aggregates whose nodes are all in the plan come first. Nodes follow in
/// order, under a header whenever the controlling trigger or agent sharing
/// group changes.
pub fn plan_listing(
    graph: &BuildGraph,
    ordered: &[NodeId],
    unfinished_triggers: Option<&[NodeId]>,
    options: ListingOptions,
) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    let in_plan: HashSet<NodeId> = ordered.iter().copied().collect();

    let mut aggregates: Vec<&str> = graph
        .aggregates()
        .filter(|aggregate| {
            graph
                .expand_aggregate(&aggregate.name)
                .is_some_and(|nodes| {
                    !nodes.is_empty() && nodes.iter().all(|id| in_plan.contains(id))
                })
        })
        .map(|aggregate| aggregate.name.as_str())
        .collect();
    aggregates.sort_unstable();
    if !aggregates.is_empty() {
        entries.push(ListingEntry::AggregatesHeader);
        entries.extend(
            aggregates
                .into_iter()
                .map(|name| ListingEntry::Aggregate(name.to_string())),
        );
    }

    entries.push(ListingEntry::NodesHeader);
    let mut last_trigger = String::new();
    let mut last_group = "";
    for &id in ordered {
        let node = graph.node(id);

        let dot_name = graph.dot_name(id);
        if dot_name != last_trigger {
            if !dot_name.is_empty() {
                let triggered = unfinished_triggers.map(|unfinished| {
                    last_controlling_trigger(graph, id)
                        .is_none_or(|last| !unfinished.contains(&last))
                });
                entries.push(ListingEntry::TriggerHeader {
                    dot_name: dot_name.clone(),
                    triggered,
                });
            }
            last_trigger = dot_name;
        }

        let group = node.agent_sharing_group();
        if group != last_group && !group.is_empty() {
            entries.push(ListingEntry::AgentGroup(group.to_string()));
        }
        last_group = group;

        entries.push(ListingEntry::Node {
            name: node.name().to_string(),
            grouped: !group.is_empty(),
            interval: interval_string(interval_minutes(options.time_quantum, node.frequency_shift)),
            complete: node.complete,
            trigger: node.is_trigger(),
            sticky: node.is_sticky(),
            memory_gb: node.node.memory_gb,
        });
        entries.extend(node.node.action.agenda_for().into_iter().map(ListingEntry::Agenda));

        if options.show_dependencies {
            for &dep in &node.dependencies {
                entries.push(ListingEntry::Dependency {
                    name: graph.name(dep).to_string(),
                    pseudo: false,
                });
            }
            for &dep in &node.pseudo_dependencies {
                entries.push(ListingEntry::Dependency {
                    name: graph.name(dep).to_string(),
                    pseudo: true,
                });
            }
        }
    }
    entries
}
