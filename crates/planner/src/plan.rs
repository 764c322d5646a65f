//! Operator graph ("generated pipeline") produced by the plan builder.
//!
//! A [`Plan`] is immutable once built. It is assembled through a
//! [`PlanGraph`], which owns node numbering, name uniqueness and the
//! consistency between branch edges and filter targets.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use svq_common::{NodeId, Result, SvqError};

use crate::condition::BoundCondition;
use crate::query::LiteralValue;
use crate::schema::RowSchema;

/// Named outgoing target of a branching filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchTarget {
    True,
    False,
}

impl fmt::Display for BranchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BranchTarget::True => "true",
            BranchTarget::False => "false",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// `None` for a main (sequential) edge.
    pub branch: Option<BranchTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantField {
    pub name: String,
    pub value: LiteralValue,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyFieldConfig {
    pub source: usize,
    pub target: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub condition: BoundCondition,
    /// With targets set, matching rows go to `send_true_to` and the rest to
    /// `send_false_to`; without targets, non-matching rows are dropped.
    pub send_true_to: Option<NodeId>,
    pub send_false_to: Option<NodeId>,
}

impl FilterConfig {
    pub fn new(condition: BoundCondition) -> Self {
        Self {
            condition,
            send_true_to: None,
            send_false_to: None,
        }
    }

    pub fn is_branching(&self) -> bool {
        self.send_true_to.is_some() || self.send_false_to.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Sum,
    Min,
    Max,
    Avg,
    /// Non-null values.
    CountAll,
    /// Every row.
    CountAny,
    CountDistinct,
}

impl AggregateKind {
    pub fn is_count(self) -> bool {
        matches!(
            self,
            AggregateKind::CountAll | AggregateKind::CountAny | AggregateKind::CountDistinct
        )
    }

    pub fn output_type(self, subject: &DataType) -> DataType {
        match self {
            AggregateKind::CountAll | AggregateKind::CountAny | AggregateKind::CountDistinct => {
                DataType::Int64
            }
            AggregateKind::Avg => DataType::Float64,
            AggregateKind::Sum => match subject {
                DataType::Int64 => DataType::Int64,
                _ => DataType::Float64,
            },
            AggregateKind::Min | AggregateKind::Max => subject.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub output: String,
    pub subject: usize,
    pub kind: AggregateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByConfig {
    pub keys: Vec<usize>,
    pub aggregates: Vec<AggregateSpec>,
    /// Zero input rows still yield one row (null keys, zero counts).
    pub always_emit_one_row: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: usize,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectField {
    pub source: usize,
    pub output: String,
}

/// Pass rows `first_row..=last_row` (1-based) and drain the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleConfig {
    pub first_row: usize,
    pub last_row: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorKind {
    /// Receives rows pushed from outside the pipeline.
    Injector,
    SingleEmptyRow,
    ConstantRow(Vec<ConstantField>),
    CopyField(CopyFieldConfig),
    Filter(FilterConfig),
    GroupBy(GroupByConfig),
    Sort(Vec<SortKey>),
    Project(Vec<ProjectField>),
    Sample(SampleConfig),
    /// Pass-through; also the union point of several inputs.
    Dummy,
    /// Static rows; used by service pipeline definitions.
    RowSource(Vec<Vec<LiteralValue>>),
}

impl OperatorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            OperatorKind::Injector => "Injector",
            OperatorKind::SingleEmptyRow => "SingleEmptyRow",
            OperatorKind::ConstantRow(_) => "ConstantRow",
            OperatorKind::CopyField(_) => "CopyField",
            OperatorKind::Filter(_) => "Filter",
            OperatorKind::GroupBy(_) => "GroupBy",
            OperatorKind::Sort(_) => "Sort",
            OperatorKind::Project(_) => "Project",
            OperatorKind::Sample(_) => "Sample",
            OperatorKind::Dummy => "Dummy",
            OperatorKind::RowSource(_) => "RowSource",
        }
    }

    /// Whether the kind produces rows without any input edge.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            OperatorKind::Injector | OperatorKind::SingleEmptyRow | OperatorKind::RowSource(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNode {
    pub id: NodeId,
    /// Unique within the plan.
    pub name: String,
    pub kind: OperatorKind,
    /// Schema of the rows this node emits.
    pub schema: RowSchema,
}

/// Cosmetic 2D position, kept apart from execution semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutHint {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    name: String,
    nodes: Vec<OperatorNode>,
    edges: Vec<Edge>,
    entry: NodeId,
    exit: NodeId,
    #[serde(skip)]
    layout: BTreeMap<NodeId, LayoutHint>,
}

impl Plan {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[OperatorNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn exit(&self) -> NodeId {
        self.exit
    }

    pub fn layout(&self) -> &BTreeMap<NodeId, LayoutHint> {
        &self.layout
    }

    pub fn node(&self, id: NodeId) -> Option<&OperatorNode> {
        self.nodes.get(id.0)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&OperatorNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn entry_node(&self) -> &OperatorNode {
        &self.nodes[self.entry.0]
    }

    pub fn exit_node(&self) -> &OperatorNode {
        &self.nodes[self.exit.0]
    }

    /// Schema of the rows leaving the exit node.
    pub fn result_schema(&self) -> &RowSchema {
        &self.exit_node().schema
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Type names of the nodes along the main path from entry to exit.
    ///
    /// Branch subgraphs are entered through their `true` target.
    pub fn main_path(&self) -> Vec<&'static str> {
        let mut out = vec![];
        let mut cur = Some(self.entry);
        let mut seen = HashSet::new();
        while let Some(id) = cur {
            if !seen.insert(id) {
                break;
            }
            out.push(self.nodes[id.0].kind.type_name());
            cur = self
                .outgoing(id)
                .find(|e| e.branch.is_none() || e.branch == Some(BranchTarget::True))
                .map(|e| e.to);
        }
        out
    }

    /// Nodes in an order where every node follows all of its predecessors.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for e in &self.edges {
            indegree[e.to.0] += 1;
        }
        let mut ready = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| NodeId(i))
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for e in self.outgoing(id) {
                indegree[e.to.0] -= 1;
                if indegree[e.to.0] == 0 {
                    ready.push_back(e.to);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(SvqError::PlanConstruction(format!(
                "plan '{}' contains a cycle",
                self.name
            )));
        }
        Ok(order)
    }

    /// Structural invariants: known endpoints, acyclic, every node except
    /// the entry (and other sources) is fed, branch edges match filter targets.
    pub fn validate(&self) -> Result<()> {
        let known = |id: NodeId| id.0 < self.nodes.len();
        if !known(self.entry) || !known(self.exit) {
            return Err(SvqError::PlanConstruction(format!(
                "plan '{}' has an unknown entry or exit node",
                self.name
            )));
        }
        for e in &self.edges {
            if !known(e.from) || !known(e.to) {
                return Err(SvqError::PlanConstruction(format!(
                    "edge {} -> {} references an unknown node",
                    e.from, e.to
                )));
            }
        }
        self.topological_order()?;
        for node in &self.nodes {
            let fed = self.incoming(node.id).next().is_some();
            if node.id != self.entry && !fed && !node.kind.is_source() {
                return Err(SvqError::PlanConstruction(format!(
                    "node '{}' has no incoming edge",
                    node.name
                )));
            }
            if node.kind.is_source() && fed {
                return Err(SvqError::PlanConstruction(format!(
                    "source node '{}' must not have incoming edges",
                    node.name
                )));
            }
            if let OperatorKind::Filter(cfg) = &node.kind {
                for (branch, target) in [
                    (BranchTarget::True, cfg.send_true_to),
                    (BranchTarget::False, cfg.send_false_to),
                ] {
                    let edge = self
                        .outgoing(node.id)
                        .find(|e| e.branch == Some(branch))
                        .map(|e| e.to);
                    if edge != target {
                        return Err(SvqError::PlanConstruction(format!(
                            "filter '{}' {branch} target does not match its edges",
                            node.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Mutable assembly area for a [`Plan`].
#[derive(Debug, Clone)]
pub struct PlanGraph {
    name: String,
    nodes: Vec<OperatorNode>,
    edges: Vec<Edge>,
    layout: BTreeMap<NodeId, LayoutHint>,
}

impl PlanGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![],
            edges: vec![],
            layout: BTreeMap::new(),
        }
    }

    /// Add a node; a name already in use gets a numeric suffix.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: OperatorKind,
        schema: RowSchema,
    ) -> NodeId {
        let base = name.into();
        let mut name = base.clone();
        let mut n = 2;
        while self.nodes.iter().any(|x| x.name == name) {
            name = format!("{base} {n}");
            n += 1;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(OperatorNode {
            id,
            name,
            kind,
            schema,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&OperatorNode> {
        self.nodes.get(id.0).ok_or_else(|| {
            SvqError::PlanConstruction(format!("unknown node {id} in plan '{}'", self.name))
        })
    }

    /// Output schema of `id`.
    pub fn schema(&self, id: NodeId) -> Result<&RowSchema> {
        Ok(&self.node(id)?.schema)
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) {
        self.edges.push(Edge {
            from,
            to,
            branch: None,
        });
    }

    /// Add a branch edge and record it as the filter's target.
    pub fn connect_branch(&mut self, from: NodeId, to: NodeId, branch: BranchTarget) -> Result<()> {
        let name = self.name.clone();
        let node = self.nodes.get_mut(from.0).ok_or_else(|| {
            SvqError::PlanConstruction(format!("unknown node {from} in plan '{name}'"))
        })?;
        let OperatorKind::Filter(cfg) = &mut node.kind else {
            return Err(SvqError::PlanConstruction(format!(
                "branch edge from non-filter node '{}'",
                node.name
            )));
        };
        match branch {
            BranchTarget::True => cfg.send_true_to = Some(to),
            BranchTarget::False => cfg.send_false_to = Some(to),
        }
        self.edges.push(Edge {
            from,
            to,
            branch: Some(branch),
        });
        Ok(())
    }

    pub fn place(&mut self, id: NodeId, x: i32, y: i32) {
        self.layout.insert(id, LayoutHint { x, y });
    }

    pub fn finish(self, entry: NodeId, exit: NodeId) -> Result<Plan> {
        let plan = Plan {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            entry,
            exit,
            layout: self.layout,
        };
        plan.validate()?;
        Ok(plan)
    }
}
