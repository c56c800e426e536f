//! Motion program types at the boundary of the engine.
//!
//! The engine does not plan motions. It only needs enough structure to split
//! a program into segments, hand each segment to a sub-generator, and let
//! tasks find their start and end poses at run time.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::TaskContext;

/// A single robot configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Waypoint {
    pub joints: Vec<f64>,
}

impl Waypoint {
    pub fn new(joints: impl Into<Vec<f64>>) -> Self {
        Self {
            joints: joints.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Move(Waypoint),
    Composite(CompositeInstruction),
}

impl Instruction {
    pub fn as_composite(&self) -> Option<&CompositeInstruction> {
        match self {
            Instruction::Composite(composite) => Some(composite),
            Instruction::Move(_) => None,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.as_composite().is_some()
    }

    pub fn first_waypoint(&self) -> Option<&Waypoint> {
        match self {
            Instruction::Move(waypoint) => Some(waypoint),
            Instruction::Composite(composite) => composite.first_waypoint(),
        }
    }

    pub fn last_waypoint(&self) -> Option<&Waypoint> {
        match self {
            Instruction::Move(waypoint) => Some(waypoint),
            Instruction::Composite(composite) => composite.last_waypoint(),
        }
    }
}

impl From<Waypoint> for Instruction {
    fn from(waypoint: Waypoint) -> Self {
        Instruction::Move(waypoint)
    }
}

impl From<CompositeInstruction> for Instruction {
    fn from(composite: CompositeInstruction) -> Self {
        Instruction::Composite(composite)
    }
}

/// An ordered, possibly nested group of instructions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompositeInstruction {
    pub description: String,
    /// Where the robot is before the first child.
    pub start: Option<Waypoint>,
    pub children: Vec<Instruction>,
}

impl CompositeInstruction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_start(mut self, start: Waypoint) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_child(mut self, child: impl Into<Instruction>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&Instruction> {
        self.children.get(index)
    }

    pub fn first_waypoint(&self) -> Option<&Waypoint> {
        self.children.iter().find_map(Instruction::first_waypoint)
    }

    pub fn last_waypoint(&self) -> Option<&Waypoint> {
        self.children.iter().rev().find_map(Instruction::last_waypoint)
    }
}

/// Where a segment starts or ends.
///
/// Segment anchors point at a neighbouring segment by position and are only
/// resolved when a task runs, after the neighbour may have been re-planned
/// with a different number of points.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Anchor {
    #[default]
    Unset,
    Waypoint(Waypoint),
    Segment(usize),
}

impl Anchor {
    pub fn is_set(&self) -> bool {
        !matches!(self, Anchor::Unset)
    }

    /// Resolves the anchor to a concrete pose.
    ///
    /// A segment anchor prefers the planned segment published on its port and
    /// falls back to the segment of the original program. Start anchors take
    /// the last waypoint of the referenced segment, end anchors the first.
    pub fn resolve(&self, input: &PlanInput, context: &TaskContext, end: bool) -> Option<Waypoint> {
        let pick = |instruction: &Instruction| match end {
            true => instruction.first_waypoint().cloned(),
            false => instruction.last_waypoint().cloned(),
        };

        match self {
            Anchor::Unset => None,
            Anchor::Waypoint(waypoint) => Some(waypoint.clone()),
            Anchor::Segment(index) => {
                let port = PlanInput::segment_port(&input.scope, *index);

                match context.get_port::<Instruction>(&port) {
                    Ok(planned) => pick(planned.as_ref()),
                    Err(_) => {
                        tracing::trace!("{port} not published, using the program segment");
                        input.parent.as_ref()?.as_composite()?.segment(*index).and_then(pick)
                    }
                }
            }
        }
    }
}

/// The input of a graph generator: one program (or segment of a program)
/// together with how it connects to its surroundings.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub instruction: Arc<Instruction>,
    pub start: Anchor,
    pub end: Anchor,
    /// The program this segment was taken from.
    pub parent: Option<Arc<Instruction>>,
    /// Port namespace of the program this segment belongs to.
    pub scope: String,
    /// Position of this segment in its parent.
    pub index: Option<usize>,
}

impl PlanInput {
    pub fn new(instruction: impl Into<Instruction>) -> Self {
        Self {
            instruction: Arc::new(instruction.into()),
            start: Anchor::Unset,
            end: Anchor::Unset,
            parent: None,
            scope: "program".into(),
            index: None,
        }
    }

    /// Supplies a start pose for programs that do not declare one.
    pub fn with_start(mut self, start: Waypoint) -> Self {
        self.start = Anchor::Waypoint(start);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn composite(&self) -> Option<&CompositeInstruction> {
        self.instruction.as_composite()
    }

    pub fn size(&self) -> usize {
        self.composite().map_or(0, CompositeInstruction::len)
    }

    pub fn segment(&self, index: usize) -> Option<&Instruction> {
        self.composite()?.segment(index)
    }

    /// Whether the program itself carries a start pose.
    pub fn has_declared_start(&self) -> bool {
        self.composite().is_some_and(|c| c.start.is_some())
    }

    /// The program's own start, else the one supplied with the input.
    pub fn declared_start(&self) -> Anchor {
        match self.composite().and_then(|c| c.start.as_ref()) {
            Some(start) => Anchor::Waypoint(start.clone()),
            None => self.start.clone(),
        }
    }

    pub fn segment_port(scope: &str, index: usize) -> String {
        format!("{scope}/{index}")
    }

    /// Port the planned version of this segment is published on.
    pub fn output_port(&self) -> Option<String> {
        self.index.map(|i| Self::segment_port(&self.scope, i))
    }

    /// Port namespace for the segments of this input.
    pub fn inner_scope(&self) -> String {
        self.output_port().unwrap_or_else(|| self.scope.clone())
    }

    /// Input for segment `index` of this program. `None` if out of range.
    pub fn child(&self, index: usize, start: Anchor, end: Anchor) -> Option<PlanInput> {
        let segment = self.segment(index)?.clone();

        Some(PlanInput {
            instruction: Arc::new(segment),
            start,
            end,
            parent: Some(Arc::clone(&self.instruction)),
            scope: self.inner_scope(),
            index: Some(index),
        })
    }

    pub fn description(&self) -> &str {
        self.composite().map_or("", |c| c.description.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(x: f64) -> Waypoint {
        Waypoint::new([x, 0.0])
    }

    fn segment(name: &str, points: &[f64]) -> CompositeInstruction {
        points
            .iter()
            .fold(CompositeInstruction::new(name), |c, &x| c.with_child(wp(x)))
    }

    fn program() -> PlanInput {
        let program = CompositeInstruction::new("program")
            .with_start(wp(-1.0))
            .with_child(segment("r0", &[0.0, 1.0]))
            .with_child(segment("t0", &[1.5, 2.5]))
            .with_child(segment("r1", &[3.0, 4.0]));

        PlanInput::new(program)
    }

    #[test]
    fn test_nested_waypoints() {
        let nested = CompositeInstruction::new("outer")
            .with_child(CompositeInstruction::new("empty"))
            .with_child(segment("inner", &[1.0, 2.0]))
            .with_child(CompositeInstruction::new("empty"));

        assert_eq!(nested.first_waypoint(), Some(&wp(1.0)));
        assert_eq!(nested.last_waypoint(), Some(&wp(2.0)));
        assert_eq!(CompositeInstruction::new("none").first_waypoint(), None);
    }

    #[test]
    fn test_input_accessors() {
        let input = program();

        assert_eq!(input.size(), 3);
        assert!(input.has_declared_start());
        assert_eq!(input.declared_start(), Anchor::Waypoint(wp(-1.0)));
        assert_eq!(input.output_port(), None);

        let child = input.child(1, Anchor::Segment(0), Anchor::Segment(2)).unwrap();
        assert_eq!(child.output_port().as_deref(), Some("program/1"));
        assert_eq!(child.inner_scope(), "program/1");
        assert_eq!(child.description(), "t0");
        assert!(input.child(3, Anchor::Unset, Anchor::Unset).is_none());

        let bare = PlanInput::new(CompositeInstruction::new("bare")).with_start(wp(9.0));
        assert!(!bare.has_declared_start());
        assert_eq!(bare.declared_start(), Anchor::Waypoint(wp(9.0)));
    }

    #[test]
    fn test_segment_anchor_resolves_lazily() {
        let input = program();
        let transition = input.child(1, Anchor::Segment(0), Anchor::Segment(2)).unwrap();
        let ctx = TaskContext::new();

        // Nothing published yet: fall back to the program.
        assert_eq!(transition.start.resolve(&transition, &ctx, false), Some(wp(1.0)));
        assert_eq!(transition.end.resolve(&transition, &ctx, true), Some(wp(3.0)));

        // The raster was re-planned with more points.
        let planned = segment("r0", &[0.0, 0.5, 1.0, 1.2]);
        ctx.set_port("program/0", Instruction::from(planned));
        assert_eq!(transition.start.resolve(&transition, &ctx, false), Some(wp(1.2)));

        assert_eq!(Anchor::Unset.resolve(&transition, &ctx, false), None);
        assert_eq!(Anchor::Segment(7).resolve(&transition, &ctx, false), None);
    }
}
