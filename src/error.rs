use std::collections::BTreeMap;
use std::fmt::Display;

use thiserror::Error;

use crate::datatypes::{ElementId, MaterialId, NodeId};

/// Maximum number of sample ids kept per warning kind in a summary
pub const WARNING_SAMPLE_LIMIT: usize = 10;

/// The kind of id a stage schedule refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdKind {
    Material,
    Load,
    Boundary,
    Element,
    Stage,
}

impl Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IdKind::Material => "material",
            IdKind::Load => "load group",
            IdKind::Boundary => "boundary group",
            IdKind::Element => "element",
            IdKind::Stage => "stage",
        };
        write!(f, "{name}")
    }
}

/// Fatal errors. Recoverable conditions are reported as [`Warning`]s instead.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("material {material_id}: {parameter} = {value} is out of range ({reason})")]
    ParameterOutOfRange {
        material_id: MaterialId,
        parameter: &'static str,
        value: f64,
        reason: String,
    },

    #[error("{} material(s) rejected during setup: {ids:?}", ids.len())]
    MaterialsRejected { ids: Vec<MaterialId> },

    #[error("stage {stage_id} references unknown {kind} {id}")]
    StageDependencyBroken { stage_id: u32, kind: IdKind, id: u64 },

    #[error("Solver error in stage {stage_id}: {message}")]
    Solver { stage_id: u32, message: String },

    #[error("stage {stage_id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        stage_id: u32,
        from: &'static str,
        to: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, StagingError>;

/// Local, recoverable conditions collected while the pipeline keeps going
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    ClassificationAmbiguous {
        element_id: ElementId,
        type_tag: String,
        reason: String,
    },
    SegmentationDegenerate {
        component: usize,
        endpoint_count: usize,
        nodes: Vec<NodeId>,
        reason: String,
    },
    ConstraintUnreachable {
        node: NodeId,
        attempted_radius: f64,
    },
    ScheduleInconsistent {
        stage_id: u32,
        material_ids: Vec<MaterialId>,
        reason: String,
    },
}

/// Discriminant of [`Warning`], used as the summary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarningKind {
    ClassificationAmbiguous,
    SegmentationDegenerate,
    ConstraintUnreachable,
    ScheduleInconsistent,
}

impl Display for WarningKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WarningKind::ClassificationAmbiguous => "ClassificationAmbiguous",
            WarningKind::SegmentationDegenerate => "SegmentationDegenerate",
            WarningKind::ConstraintUnreachable => "ConstraintUnreachable",
            WarningKind::ScheduleInconsistent => "ScheduleInconsistent",
        };
        write!(f, "{name}")
    }
}

impl Warning {
    pub fn kind(&self) -> WarningKind {
        match self {
            Warning::ClassificationAmbiguous { .. } => WarningKind::ClassificationAmbiguous,
            Warning::SegmentationDegenerate { .. } => WarningKind::SegmentationDegenerate,
            Warning::ConstraintUnreachable { .. } => WarningKind::ConstraintUnreachable,
            Warning::ScheduleInconsistent { .. } => WarningKind::ScheduleInconsistent,
        }
    }

    /// The id a reader should look at first: element, first component
    /// node, slave node or stage
    pub fn sample_id(&self) -> u64 {
        match self {
            Warning::ClassificationAmbiguous { element_id, .. } => *element_id,
            Warning::SegmentationDegenerate { nodes, component, .. } => {
                nodes.first().copied().unwrap_or(*component as u64)
            }
            Warning::ConstraintUnreachable { node, .. } => *node,
            Warning::ScheduleInconsistent { stage_id, .. } => u64::from(*stage_id),
        }
    }
}

impl Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::ClassificationAmbiguous {
                element_id,
                type_tag,
                reason,
            } => write!(f, "element {element_id} ('{type_tag}'): {reason}"),
            Warning::SegmentationDegenerate {
                component,
                endpoint_count,
                nodes,
                reason,
            } => write!(
                f,
                "anchor component {component} has {endpoint_count} endpoint(s), \
                 {reason}; nodes {nodes:?}"
            ),
            Warning::ConstraintUnreachable {
                node,
                attempted_radius,
            } => write!(
                f,
                "node {node} has no master candidate within {attempted_radius:.3}"
            ),
            Warning::ScheduleInconsistent {
                stage_id,
                material_ids,
                reason,
            } => write!(f, "stage {stage_id}: {reason} {material_ids:?}"),
        }
    }
}

/// Count and sample ids for one warning kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarningTally {
    pub count: usize,
    pub samples: Vec<u64>,
}

/// Aggregated warnings returned alongside pipeline output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarningSummary {
    pub tallies: BTreeMap<WarningKind, WarningTally>,
    pub warnings: Vec<Warning>,
}

impl WarningSummary {
    pub fn new() -> WarningSummary {
        WarningSummary::default()
    }

    pub fn push(&mut self, warning: Warning) {
        let tally = self.tallies.entry(warning.kind()).or_default();
        tally.count += 1;
        if tally.samples.len() < WARNING_SAMPLE_LIMIT {
            tally.samples.push(warning.sample_id());
        }
        self.warnings.push(warning);
    }

    pub fn extend<I: IntoIterator<Item = Warning>>(&mut self, warnings: I) {
        for warning in warnings {
            self.push(warning);
        }
    }

    pub fn merge(&mut self, other: WarningSummary) {
        self.extend(other.warnings);
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.tallies.get(&kind).map(|t| t.count).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// A multi-stage run that stopped on a fatal error. Holds the records of
/// every stage that completed before the abort.
#[derive(Debug, Error)]
#[error("run aborted after {} completed stage(s): {error}", completed.len())]
pub struct RunFailure {
    pub completed: Vec<crate::driver::StageRecord>,
    pub warnings: WarningSummary,
    #[source]
    pub error: StagingError,
}
