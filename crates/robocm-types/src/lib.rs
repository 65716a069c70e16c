//! `robocm-types` – shared vocabulary for the Robot Context Manager.
//!
//! Every other crate in the workspace speaks in these types: the entity
//! classes a perception can be about, the normalized [`PerceptionRecord`],
//! the structured triple model handed to the knowledge base, the envelope
//! routed over the event bus, and the global [`CmError`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Entity classes
// ─────────────────────────────────────────────────────────────────────────────

/// Index of a tracked finger on one robot hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Finger(u8);

impl Finger {
    /// Number of fingers tracked per hand.
    pub const COUNT: u8 = 3;

    /// Returns `None` when `index` is outside `0..Finger::COUNT`.
    pub fn new(index: u8) -> Option<Self> {
        (index < Self::COUNT).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Finger {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Finger::new(value).ok_or_else(|| format!("finger index {value} out of range"))
    }
}

impl From<Finger> for u8 {
    fn from(f: Finger) -> Self {
        f.0
    }
}

/// The kind of physical entity a perception is about.
///
/// Each class owns its own sequence counter and its own retention windows,
/// so writes to different classes never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityClass {
    Object,
    RobotBody,
    RobotHand,
    RobotLeftHand,
    RobotLeftFinger(Finger),
    RobotRightHand,
    RobotRightFinger(Finger),
    Joint,
}

impl EntityClass {
    /// Every class, fingers expanded.
    pub fn all() -> Vec<EntityClass> {
        let mut classes = vec![
            EntityClass::Object,
            EntityClass::RobotBody,
            EntityClass::RobotHand,
            EntityClass::RobotLeftHand,
        ];
        classes.extend((0..Finger::COUNT).filter_map(Finger::new).map(EntityClass::RobotLeftFinger));
        classes.push(EntityClass::RobotRightHand);
        classes.extend((0..Finger::COUNT).filter_map(Finger::new).map(EntityClass::RobotRightFinger));
        classes.push(EntityClass::Joint);
        classes
    }

    /// Stable snake_case key used in configuration files
    /// (e.g. `"robot_body"`, `"robot_left_finger_1"`).
    pub fn key(&self) -> String {
        match self {
            EntityClass::Object => "object".to_string(),
            EntityClass::RobotBody => "robot_body".to_string(),
            EntityClass::RobotHand => "robot_hand".to_string(),
            EntityClass::RobotLeftHand => "robot_left_hand".to_string(),
            EntityClass::RobotLeftFinger(f) => format!("robot_left_finger_{}", f.index()),
            EntityClass::RobotRightHand => "robot_right_hand".to_string(),
            EntityClass::RobotRightFinger(f) => format!("robot_right_finger_{}", f.index()),
            EntityClass::Joint => "joint".to_string(),
        }
    }

    /// Local name prefix of perception-event subjects of this class,
    /// e.g. `visualRobotBodyPerception` (the sequence number is appended).
    pub fn perception_local_name(&self) -> String {
        match self {
            EntityClass::Object => "visualObjectPerception".to_string(),
            EntityClass::RobotBody => "visualRobotBodyPerception".to_string(),
            EntityClass::RobotHand => "visualRobotHandPerception".to_string(),
            EntityClass::RobotLeftHand => "visualRobotLeftHandPerception".to_string(),
            EntityClass::RobotLeftFinger(f) => {
                format!("visualRobotLeftFinger{}Perception", f.index())
            }
            EntityClass::RobotRightHand => "visualRobotRightHandPerception".to_string(),
            EntityClass::RobotRightFinger(f) => {
                format!("visualRobotRightFinger{}Perception", f.index())
            }
            EntityClass::Joint => "jointPerception".to_string(),
        }
    }

    /// Ontology concept the perception subject is typed as.
    pub fn perception_concept(&self) -> &'static str {
        match self {
            EntityClass::Object => "VisualObjectPerception",
            EntityClass::RobotBody => "VisualRobotBodyPerception",
            EntityClass::RobotHand => "VisualRobotHandPerception",
            EntityClass::RobotLeftHand => "VisualRobotLeftHandPerception",
            EntityClass::RobotLeftFinger(_) => "VisualRobotLeftFingerPerception",
            EntityClass::RobotRightHand => "VisualRobotRightHandPerception",
            EntityClass::RobotRightFinger(_) => "VisualRobotRightFingerPerception",
            EntityClass::Joint => "JointPerception",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for EntityClass {
    type Err = CmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityClass::all()
            .into_iter()
            .find(|c| c.key() == s)
            .ok_or_else(|| CmError::Config(format!("unknown entity class '{s}'")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Perception records
// ─────────────────────────────────────────────────────────────────────────────

/// What a perception event measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerceptionKind {
    Position,
    Heading,
    Status,
    Speed,
    Battery,
}

impl PerceptionKind {
    /// Spatial records carry a transform sub-structure in the knowledge base.
    pub fn is_spatial(&self) -> bool {
        matches!(self, PerceptionKind::Position | PerceptionKind::Heading)
    }
}

/// A single typed field value of a perception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }

    /// Canonical lexical form. Numbers render through `f64`'s `Display`, so
    /// `"3.50"` and `"3.5"` both become `3.5`.
    pub fn lexical(&self) -> String {
        match self {
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(t) => t.clone(),
        }
    }
}

/// One normalized observation, produced per inbound notification and
/// consumed once by the triple encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionRecord {
    pub class: EntityClass,
    pub kind: PerceptionKind,
    /// Canonical ontology id of the observed entity (alias already resolved).
    pub entity_id: String,
    /// Payload fields in the order declared by the event shape.
    pub fields: Vec<(String, FieldValue)>,
    pub observed_at_epoch_seconds: i64,
}

impl PerceptionRecord {
    /// Look up a payload field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Triple model
// ─────────────────────────────────────────────────────────────────────────────

/// Object position of a triple: an IRI or a typed literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    Iri(String),
    Literal { lexical: String, datatype: String },
}

impl Term {
    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }

    pub fn literal(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: datatype.into(),
        }
    }

    pub fn as_iri(&self) -> Option<&str> {
        match self {
            Term::Iri(iri) => Some(iri),
            Term::Literal { .. } => None,
        }
    }
}

impl fmt::Display for Term {
    /// N-Triples rendering: `<iri>` or `"lexical"^^<datatype>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::Literal { lexical, datatype } => {
                f.write_str("\"")?;
                for c in lexical.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"^^<{datatype}>")
            }
        }
    }
}

/// A `(subject, predicate, object, graph)` statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: Term,
    pub graph: String,
}

impl fmt::Display for Triple {
    /// N-Quads line without the trailing newline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}> <{}> {} <{}> .",
            self.subject, self.predicate, self.object, self.graph
        )
    }
}

/// A retraction pattern; `None` positions match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<Term>,
    pub graph: Option<String>,
}

impl TriplePattern {
    /// Every triple about `subject` in `graph`.
    pub fn about(subject: impl Into<String>, graph: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            graph: Some(graph.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_ref().is_none_or(|s| *s == triple.subject)
            && self.predicate.as_ref().is_none_or(|p| *p == triple.predicate)
            && self.object.as_ref().is_none_or(|o| *o == triple.object)
            && self.graph.as_ref().is_none_or(|g| *g == triple.graph)
    }
}

/// The output of encoding one [`PerceptionRecord`].
///
/// All triples share one allocated sequence number. Batches are write-once:
/// only retraction removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleBatch {
    /// Per-class sequence number that suffixes the perception subject.
    pub sequence: u64,
    /// Position of this write within the entity's retention window.
    pub sub_sequence: u64,
    /// Perception-event subject IRI.
    pub subject: String,
    /// Sub-structure subject IRI (rotation matrix) for spatial records.
    pub structure: Option<String>,
    pub triples: Vec<Triple>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Query model
// ─────────────────────────────────────────────────────────────────────────────

/// One position of a query atom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryTerm {
    /// A named logical variable (written `$Name`).
    Var(String),
    Const(Term),
}

/// A single `(triple S P O)` atom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAtom {
    pub subject: QueryTerm,
    pub predicate: QueryTerm,
    pub object: QueryTerm,
}

/// A conjunction of atoms over shared variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPattern {
    pub atoms: Vec<QueryAtom>,
}

impl QueryPattern {
    /// Variable names in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for atom in &self.atoms {
            for term in [&atom.subject, &atom.predicate, &atom.object] {
                if let QueryTerm::Var(name) = term
                    && !vars.contains(&name.as_str())
                {
                    vars.push(name);
                }
            }
        }
        vars
    }
}

/// One solution: variable name → bound term.
pub type Bindings = BTreeMap<String, Term>;

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Alert codes carried by [`EventPayload::SystemAlert`].
pub mod alert {
    /// A sequence counter hit its numeric limit; the class stops accepting writes.
    pub const ALLOCATOR_SATURATION: u32 = 501;
    /// A new entity could not be admitted to its class's retention index.
    pub const CAPACITY_EXCEEDED: u32 = 502;
    /// Operator requested shutdown.
    pub const SHUTDOWN: u32 = 911;
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Originating perception source or component, e.g. `"AMR_LIFT1"`.
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Raw generalized-list text of a perception notification.
    Notification(String),
    /// Operational alert raised by the pipeline or the process.
    SystemAlert {
        component: String,
        code: u32,
        message: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning ingestion, retention, and knowledge-base failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CmError {
    #[error("Parse Error: {0}")]
    Parse(String),

    #[error("Shape Mismatch on {event}: {details}")]
    ShapeMismatch { event: String, details: String },

    #[error("Sequence Allocator Saturated for class {0}")]
    AllocatorSaturation(EntityClass),

    #[error("Capacity Exceeded for class {class}: {capacity} entities already tracked")]
    CapacityExceeded { class: EntityClass, capacity: usize },

    #[error("Entity {entity} already tracked as {owner}, refused as {class}")]
    EntityClassConflict {
        entity: String,
        owner: EntityClass,
        class: EntityClass,
    },

    #[error("Knowledge Base Assert Failed: {0}")]
    GatewayAssert(String),

    #[error("Knowledge Base Retract Failed: {0}")]
    GatewayRetract(String),

    #[error("Knowledge Base Query Failed: {0}")]
    GatewayQuery(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Storage Error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_classes_expand_fingers() {
        let all = EntityClass::all();
        assert_eq!(all.len(), 4 + 3 + 1 + 3 + 1);
        assert!(all.contains(&EntityClass::RobotLeftFinger(Finger::new(2).unwrap())));
        assert!(all.contains(&EntityClass::RobotRightFinger(Finger::new(0).unwrap())));
    }

    #[test]
    fn finger_index_out_of_range_rejected() {
        assert!(Finger::new(3).is_none());
        assert!(Finger::try_from(7u8).is_err());
    }

    #[test]
    fn class_key_parses_back() {
        for class in EntityClass::all() {
            let parsed: EntityClass = class.key().parse().unwrap();
            assert_eq!(parsed, class);
        }
        assert!("robot_tail".parse::<EntityClass>().is_err());
    }

    #[test]
    fn finger_perception_names_carry_index() {
        let class = EntityClass::RobotRightFinger(Finger::new(1).unwrap());
        assert_eq!(class.perception_local_name(), "visualRobotRightFinger1Perception");
        assert_eq!(class.perception_concept(), "VisualRobotRightFingerPerception");
    }

    #[test]
    fn number_lexical_is_canonical() {
        assert_eq!(FieldValue::Number(3.5).lexical(), "3.5");
        assert_eq!(FieldValue::Number(-2.1).lexical(), "-2.1");
        assert_eq!(FieldValue::Number(0.0).lexical(), "0");
    }

    #[test]
    fn literal_display_escapes_quotes() {
        let t = Term::literal("say \"hi\"", "http://www.w3.org/2001/XMLSchema#string");
        assert_eq!(
            t.to_string(),
            "\"say \\\"hi\\\"\"^^<http://www.w3.org/2001/XMLSchema#string>"
        );
    }

    #[test]
    fn pattern_about_matches_only_subject_in_graph() {
        let triple = Triple {
            subject: "s".into(),
            predicate: "p".into(),
            object: Term::iri("o"),
            graph: "g".into(),
        };
        assert!(TriplePattern::about("s", "g").matches(&triple));
        assert!(!TriplePattern::about("s", "other").matches(&triple));
        assert!(!TriplePattern::about("x", "g").matches(&triple));
    }

    #[test]
    fn query_variables_in_first_appearance_order() {
        let q = QueryPattern {
            atoms: vec![
                QueryAtom {
                    subject: QueryTerm::Var("P".into()),
                    predicate: QueryTerm::Const(Term::iri("type")),
                    object: QueryTerm::Var("C".into()),
                },
                QueryAtom {
                    subject: QueryTerm::Var("P".into()),
                    predicate: QueryTerm::Const(Term::iri("on")),
                    object: QueryTerm::Var("E".into()),
                },
            ],
        };
        assert_eq!(q.variables(), vec!["P", "C", "E"]);
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new("AMR_LIFT1", EventPayload::Notification("(robotStatus \"AMR_LIFT1\" \"idle\")".into()));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(event.source, back.source);
    }

    #[test]
    fn cm_error_display() {
        let err = CmError::AllocatorSaturation(EntityClass::RobotBody);
        assert!(err.to_string().contains("robot_body"));

        let err2 = CmError::CapacityExceeded {
            class: EntityClass::Object,
            capacity: 50,
        };
        assert!(err2.to_string().contains("50"));

        let err3 = CmError::EntityClassConflict {
            entity: "AMR_Lift01".into(),
            owner: EntityClass::RobotBody,
            class: EntityClass::Object,
        };
        assert!(err3.to_string().contains("robot_body"));
    }
}
