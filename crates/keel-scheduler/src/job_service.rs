//! Planning work for an external job service.

use crate::graph::{BuildGraph, EdgeKind, NodeId};
use crate::triggers::last_controlling_trigger;
use indexmap::IndexMap;
use keel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Name of the placeholder step that releases the job's agent when there
/// are no sticky nodes.
pub const NOOP_STEP: &str = "Noop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStepKind {
    Noop,
    /// Reserves one agent for an agent sharing group.
    AgentGroup,
    Node,
    /// A trigger still waiting for approval.
    Trigger,
}

/// One step handed to the job service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub kind: JobStepKind,
    /// Agent sharing group step this one runs under.
    pub parent: Option<String>,
    pub parallel: bool,
    /// Steps that must have completed, whatever the outcome.
    pub precondition: Vec<String>,
    /// Steps that must have succeeded or warned.
    pub run_condition: Vec<String>,
    /// Release the job's agent when done.
    pub release: bool,
    pub sticky: bool,
    pub timeout_minutes: u32,
    pub memory_gb: u32,
    pub priority: f32,
    pub frequency_shift: u32,
    pub failure_emails: Vec<String>,
}

impl JobStep {
    fn placeholder(name: &str, kind: JobStepKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            parent: None,
            parallel: false,
            precondition: Vec::new(),
            run_condition: Vec::new(),
            release: false,
            sticky: false,
            timeout_minutes: 0,
            memory_gb: 0,
            priority: 0.0,
            frequency_shift: 0,
            failure_emails: Vec::new(),
        }
    }
}

/// Receives planned job steps.
pub trait JobStepSink {
    fn emit(&mut self, step: JobStep) -> Result<()>;
}

impl JobStepSink for Vec<JobStep> {
    fn emit(&mut self, step: JobStep) -> Result<()> {
        self.push(step);
        Ok(())
    }
}

/// Keep the nodes the job service should see for this invocation.
///
/// Nodes behind an unapproved trigger are dropped. When approving a trigger
/// only the trigger and what is on its chain are kept. Preflight runs do not
/// offer triggers unless triggers are skipped.
pub fn filter_for_job_service(
    graph: &BuildGraph,
    ordered: &[NodeId],
    unfinished_triggers: &[NodeId],
    explicit_trigger: Option<NodeId>,
    preflight: bool,
    skip_triggers: bool,
) -> Vec<NodeId> {
    ordered
        .iter()
        .copied()
        .filter(|&id| {
            let node = graph.node(id);
            if let Some(last) = last_controlling_trigger(graph, id) {
                if unfinished_triggers.contains(&last) {
                    return false;
                }
            }
            if let Some(trigger) = explicit_trigger {
                if trigger != id && !graph.node(trigger).depends_on(id) && !node.depends_on(trigger)
                {
                    return false;
                }
            }
            !(preflight && !skip_triggers && node.is_trigger())
        })
        .collect()
}

struct Planner<'a> {
    graph: &'a BuildGraph,
    ordered: &'a [NodeId],
    position: HashMap<NodeId, usize>,
}

impl Planner<'_> {
    fn is_pending(&self, id: NodeId) -> bool {
        !self.graph.node(id).complete && self.position.contains_key(&id)
    }

    /// Incomplete direct dependencies of `id` that are part of the plan.
    fn pending_dependencies(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.graph.node(id);
        let mut pending = Vec::new();
        for &dep in &node.all_direct_dependencies {
            if !self.is_pending(dep) {
                continue;
            }
            if self.position[&dep] > self.position[&id] {
                let kind = if node.dependencies.contains(&dep) {
                    EdgeKind::Dependency
                } else {
                    EdgeKind::Pseudo
                };
                return Err(Error::SortOrder {
                    node: node.name().to_string(),
                    dependency: self.graph.name(dep).to_string(),
                    kind: kind.as_str(),
                });
            }
            pending.push(dep);
        }
        Ok(pending)
    }

    fn precondition(
        &self,
        id: NodeId,
        pending: &[NodeId],
        group_chains: &IndexMap<String, Vec<NodeId>>,
        sticky_chain: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        let node = self.graph.node(id);
        let mut waits: Vec<NodeId> = Vec::new();
        let add = |waits: &mut Vec<NodeId>, dep: NodeId| {
            if !waits.contains(&dep) {
                waits.push(dep);
            }
        };

        match group_chains.get(node.agent_sharing_group()) {
            Some(chain) if node.is_grouped() => {
                let index = chain.iter().position(|&m| m == id).unwrap_or(0);
                if index > 0 {
                    add(&mut waits, chain[index - 1]);
                } else {
                    // The first step of a group holds the agent, so it waits
                    // for everything the whole group needs.
                    for &member in chain {
                        for dep in self.pending_dependencies(member)? {
                            if !chain.contains(&dep) {
                                add(&mut waits, dep);
                            }
                        }
                    }
                }
            }
            _ => waits.extend_from_slice(pending),
        }

        if node.is_sticky() {
            let index = sticky_chain.iter().position(|&m| m == id).unwrap_or(0);
            if index > 0 {
                let previous = sticky_chain[index - 1];
                if !self.graph.node(previous).complete {
                    add(&mut waits, previous);
                }
            } else {
                for dep in pending {
                    if !sticky_chain.contains(dep) {
                        add(&mut waits, *dep);
                    }
                }
            }
        }
        Ok(waits)
    }

    fn names(&self, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|&id| self.graph.name(id).to_string()).collect()
    }
}

/// Emit one job step per incomplete node of `ordered`.
///
/// Returns the number of steps emitted.
pub fn plan_job_steps(
    graph: &BuildGraph,
    ordered: &[NodeId],
    explicit_trigger: Option<NodeId>,
    skip_triggers: bool,
    sink: &mut dyn JobStepSink,
) -> Result<usize> {
    if ordered.is_empty() {
        return Err(Error::NothingToDo);
    }
    let planner = Planner {
        graph,
        ordered,
        position: ordered.iter().enumerate().map(|(i, &id)| (id, i)).collect(),
    };
    let pending: Vec<NodeId> = planner
        .ordered
        .iter()
        .copied()
        .filter(|&id| !graph.node(id).complete)
        .collect();

    if let Some(trigger) = explicit_trigger {
        for &id in &pending {
            if id != trigger && !graph.node(id).depends_on(trigger) {
                return Err(Error::TriggerTooLate {
                    node: graph.name(id).to_string(),
                    trigger: graph.name(trigger).to_string(),
                });
            }
        }
    }

    // Sticky nodes run on the job's own agent and must all come first.
    let mut last_sticky = None;
    let mut hit_non_sticky = false;
    for &id in &pending {
        if graph.node(id).is_sticky() {
            last_sticky = Some(id);
            if hit_non_sticky && !skip_triggers {
                return Err(Error::StickyOrder(graph.name(id).to_string()));
            }
        } else {
            hit_non_sticky = true;
        }
    }

    let mut emitted = 0;
    let has_noop = last_sticky.is_none() && !pending.is_empty();
    if has_noop {
        let mut noop = JobStep::placeholder(NOOP_STEP, JobStepKind::Noop);
        noop.sticky = true;
        noop.release = true;
        sink.emit(noop)?;
        emitted += 1;
    }

    let mut group_chains: IndexMap<String, Vec<NodeId>> = IndexMap::new();
    for &id in &pending {
        let node = graph.node(id);
        if node.is_grouped() {
            group_chains
                .entry(node.agent_sharing_group().to_string())
                .or_default()
                .push(id);
        }
    }
    let sticky_chain: Vec<NodeId> = ordered
        .iter()
        .copied()
        .filter(|&id| graph.node(id).is_sticky())
        .collect();

    for &id in &pending {
        let node = graph.node(id);
        if node.is_sticky() && node.is_grouped() {
            return Err(Error::StickyAgentGroup(node.name().to_string()));
        }

        let dependencies = planner.pending_dependencies(id)?;
        let mut precondition = planner.names(&planner.precondition(
            id,
            &dependencies,
            &group_chains,
            &sticky_chain,
        )?);
        if has_noop && precondition.is_empty() {
            precondition.push(NOOP_STEP.to_string());
        }

        let mut parent = None;
        if node.is_grouped() {
            let group = node.agent_sharing_group();
            parent = Some(group.to_string());
            let first = group_chains
                .get(group)
                .and_then(|chain| chain.first())
                .is_some_and(|&first| first == id);
            if first {
                let mut setup = JobStep::placeholder(group, JobStepKind::AgentGroup);
                setup.parallel = true;
                setup.precondition = precondition;
                sink.emit(setup)?;
                emitted += 1;
                precondition = vec![group.to_string()];
            }
        }

        let kind = if node.is_trigger() && !node.explicit_trigger {
            JobStepKind::Trigger
        } else {
            JobStepKind::Node
        };
        sink.emit(JobStep {
            name: node.name().to_string(),
            kind,
            parent,
            parallel: !node.is_sticky(),
            precondition,
            run_condition: planner.names(&dependencies),
            release: node.is_sticky() && last_sticky == Some(id),
            sticky: node.is_sticky(),
            timeout_minutes: node.node.timeout_minutes,
            memory_gb: node.node.memory_gb,
            priority: node.node.priority,
            frequency_shift: node.frequency_shift,
            failure_emails: node.failure_recipients.clone(),
        })?;
        emitted += 1;
    }

    info!(steps = emitted, "Planned job steps");
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NoopAction;
    use crate::graph::tests::make_node;
    use crate::node::Node;
    use crate::selection::find_unfinished_triggers;
    use crate::sort::topological_sort;
    use crate::triggers::find_controlling_triggers;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn linked(nodes: Vec<Node>) -> BuildGraph {
        let mut graph = BuildGraph::new();
        for node in nodes {
            graph.add_node(node).unwrap();
        }
        graph.link().unwrap();
        find_controlling_triggers(&mut graph).unwrap();
        graph
    }

    fn plan(graph: &BuildGraph, explicit: Option<NodeId>) -> Vec<JobStep> {
        let ordered = topological_sort(graph, &graph.all_nodes(), explicit, false, false).unwrap();
        let mut steps = Vec::new();
        plan_job_steps(graph, &ordered, explicit, false, &mut steps).unwrap();
        steps
    }

    fn step<'a>(steps: &'a [JobStep], name: &str) -> &'a JobStep {
        steps.iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_plain_steps_wait_for_dependencies() {
        let graph = linked(vec![
            make_node("Compile", &[]),
            make_node("Test", &["Compile"]),
            make_node("Docs", &[]).with_pseudo_dependencies(["Compile"]),
        ]);
        let steps = plan(&graph, None);

        assert_eq!(steps[0].name, NOOP_STEP);
        assert!(steps[0].release);
        assert_eq!(step(&steps, "Compile").precondition, vec![NOOP_STEP]);
        assert_eq!(step(&steps, "Test").precondition, vec!["Compile"]);
        assert_eq!(step(&steps, "Test").run_condition, vec!["Compile"]);
        assert_eq!(step(&steps, "Docs").run_condition, vec!["Compile"]);
    }

    #[test]
    fn test_completed_nodes_are_not_planned() {
        let mut graph = linked(vec![make_node("Compile", &[]), make_node("Test", &["Compile"])]);
        let compile = graph.find("Compile").unwrap();
        graph.node_mut(compile).complete = true;
        let steps = plan(&graph, None);

        assert_eq!(
            steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec![NOOP_STEP, "Test"]
        );
        assert!(step(&steps, "Test").run_condition.is_empty());
    }

    #[test]
    fn test_agent_group_steps() {
        let graph = linked(vec![
            make_node("Tools", &[]).with_priority(200.0),
            make_node("Editor", &[]).in_agent_group("Win"),
            make_node("EditorTests", &["Editor", "Tools"]).in_agent_group("Win"),
        ]);
        let steps = plan(&graph, None);

        let setup = step(&steps, "Win");
        assert_eq!(setup.kind, JobStepKind::AgentGroup);
        assert_eq!(setup.precondition, vec!["Tools"]);
        assert_eq!(step(&steps, "Editor").precondition, vec!["Win"]);
        assert_eq!(step(&steps, "Editor").parent.as_deref(), Some("Win"));
        assert_eq!(step(&steps, "EditorTests").precondition, vec!["Editor"]);
        assert_eq!(
            step(&steps, "EditorTests").run_condition,
            vec!["Editor", "Tools"]
        );
    }

    #[test]
    fn test_sticky_chain() {
        let graph = linked(vec![
            make_node("Sync", &[]).sticky(),
            make_node("Setup", &["Sync"]).sticky(),
            make_node("Compile", &["Setup"]),
        ]);
        let steps = plan(&graph, None);

        assert!(steps.iter().all(|s| s.kind != JobStepKind::Noop));
        assert!(step(&steps, "Sync").precondition.is_empty());
        assert!(!step(&steps, "Sync").release);
        assert_eq!(step(&steps, "Setup").precondition, vec!["Sync"]);
        assert!(step(&steps, "Setup").release);
        assert!(!step(&steps, "Setup").parallel);
    }

    #[test]
    fn test_sticky_after_parallel_is_rejected() {
        let graph = linked(vec![make_node("A", &[]), make_node("B", &["A"]).sticky()]);
        let a = graph.find("A").unwrap();
        let b = graph.find("B").unwrap();
        let mut steps = Vec::new();
        assert!(matches!(
            plan_job_steps(&graph, &[a, b], None, false, &mut steps),
            Err(Error::StickyOrder(name)) if name == "B"
        ));
    }

    #[test]
    fn test_late_dependency_names_the_edge() {
        let graph = linked(vec![
            make_node("Compile", &[]),
            make_node("Test", &["Compile"]),
            make_node("Docs", &[]).with_pseudo_dependencies(["Compile"]),
        ]);
        let compile = graph.find("Compile").unwrap();
        let test = graph.find("Test").unwrap();
        let docs = graph.find("Docs").unwrap();

        let mut steps = Vec::new();
        let err = plan_job_steps(&graph, &[docs, compile], None, false, &mut steps).unwrap_err();
        assert!(matches!(
            &err,
            Error::SortOrder { node, kind: "pseudodependency", .. } if node == "Docs"
        ));

        let mut steps = Vec::new();
        let err = plan_job_steps(&graph, &[test, compile], None, false, &mut steps).unwrap_err();
        assert!(matches!(
            &err,
            Error::SortOrder { node, kind: "dependency", .. } if node == "Test"
        ));
    }

    #[test]
    fn test_filter_and_plan_for_explicit_trigger() {
        let mut graph = linked(vec![
            make_node("Compile", &[]),
            Node::trigger("Publish", Arc::new(NoopAction)).with_dependencies(["Compile"]),
            make_node("Upload", &["Publish"]),
            make_node("Unrelated", &[]),
        ]);
        let compile = graph.find("Compile").unwrap();
        let publish = graph.find("Publish").unwrap();
        let unrelated = graph.find("Unrelated").unwrap();
        graph.node_mut(compile).complete = true;
        graph.node_mut(unrelated).complete = true;
        graph.node_mut(publish).explicit_trigger = true;

        let ordered = topological_sort(&graph, &graph.all_nodes(), Some(publish), false, false).unwrap();
        let unfinished = find_unfinished_triggers(&graph, &ordered, Some(publish), false);
        let filtered = filter_for_job_service(&graph, &ordered, &unfinished, Some(publish), false, false);
        assert!(!filtered.contains(&unrelated));

        let mut steps = Vec::new();
        plan_job_steps(&graph, &filtered, Some(publish), false, &mut steps).unwrap();
        assert_eq!(step(&steps, "Publish").kind, JobStepKind::Node);
        assert_eq!(step(&steps, "Upload").precondition, vec!["Publish"]);
    }

    #[test]
    fn test_unapproved_triggers_hide_downstream() {
        let graph = linked(vec![
            make_node("Compile", &[]),
            Node::trigger("Publish", Arc::new(NoopAction)).with_dependencies(["Compile"]),
            make_node("Upload", &["Publish"]),
        ]);
        let ordered = topological_sort(&graph, &graph.all_nodes(), None, false, false).unwrap();
        let unfinished = find_unfinished_triggers(&graph, &ordered, None, false);
        let filtered = filter_for_job_service(&graph, &ordered, &unfinished, None, false, false);

        let mut steps = Vec::new();
        plan_job_steps(&graph, &filtered, None, false, &mut steps).unwrap();
        assert_eq!(step(&steps, "Publish").kind, JobStepKind::Trigger);
        assert!(steps.iter().all(|s| s.name != "Upload"));

        let preflight = filter_for_job_service(&graph, &ordered, &unfinished, None, true, false);
        assert_eq!(preflight, vec![graph.find("Compile").unwrap()]);
    }

    #[test]
    fn test_explicit_trigger_rejects_unrelated_work() {
        let graph = linked(vec![
            Node::trigger("Publish", Arc::new(NoopAction)),
            make_node("Stray", &[]),
        ]);
        let publish = graph.find("Publish").unwrap();
        let stray = graph.find("Stray").unwrap();
        let mut steps = Vec::new();
        assert!(matches!(
            plan_job_steps(&graph, &[publish, stray], Some(publish), false, &mut steps),
            Err(Error::TriggerTooLate { node, .. }) if node == "Stray"
        ));
        assert!(matches!(
            plan_job_steps(&graph, &[], None, false, &mut steps),
            Err(Error::NothingToDo)
        ));
    }
}
