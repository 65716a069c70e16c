//! Triple Encoder.
//!
//! Maps one [`PerceptionRecord`] to a [`TripleBatch`] following a fixed
//! ontology pattern.  Encoding is a pure function of the record, its
//! allocated sequence number, and its retention-window position: the same
//! inputs always yield the same batch.
//!
//! For a spatial record the batch is, in order:
//!
//! ```text
//! <perception>  rdf:type                 knowrob:VisualRobotBodyPerception
//! <perception>  knowrob:startTime        arbi:timepoint_<secs>
//! <perception>  knowrob:objectActedOn    arbi:<EntityId>
//! <matrix>      rdf:type                 knowrob:RotationMatrix3D
//! <perception>  knowrob:eventOccursAt    <matrix>
//! <matrix>      knowrob:m03 / m13 / m12  "<value>"^^xsd:double
//! <matrix>      knowrob:m32              "0"^^xsd:double
//! ```
//!
//! Type assertions always precede the triples that reference their subject.
//! Non-spatial records skip the matrix and carry their value directly on the
//! perception subject.

use robocm_types::{
    EntityClass, FieldValue, PerceptionKind, PerceptionRecord, Term, Triple, TripleBatch,
    TriplePattern,
};

use crate::ontology::{self, PERCEPTION_GRAPH, RDF_TYPE, XSD_DOUBLE, XSD_STRING};

/// Matrix cell that carries a spatial field.
fn matrix_cell(kind: PerceptionKind, field: &str) -> Option<&'static str> {
    match (kind, field) {
        (PerceptionKind::Position, "x") => Some("m03"),
        (PerceptionKind::Position, "y") => Some("m13"),
        (PerceptionKind::Heading, "heading") => Some("m12"),
        _ => None,
    }
}

/// Cell of the unused axis, always asserted as zero.
const ZERO_CELL: &str = "m32";

/// Predicate carrying the value of a non-spatial record.
fn scalar_predicate(kind: PerceptionKind) -> Option<String> {
    match kind {
        PerceptionKind::Status => Some(ontology::arbi("robotStatus")),
        PerceptionKind::Speed => Some(ontology::arbi("speed")),
        PerceptionKind::Battery => Some(ontology::arbi("batteryRemain")),
        PerceptionKind::Position | PerceptionKind::Heading => None,
    }
}

fn literal(value: &FieldValue) -> Term {
    match value {
        FieldValue::Number(_) => Term::literal(value.lexical(), XSD_DOUBLE),
        FieldValue::Text(t) => Term::literal(t.clone(), XSD_STRING),
    }
}

/// Builds triple batches for perception records.
#[derive(Debug, Clone)]
pub struct TripleEncoder {
    graph: String,
}

impl TripleEncoder {
    /// Encoder writing into [`PERCEPTION_GRAPH`].
    pub fn new() -> Self {
        Self::with_graph(PERCEPTION_GRAPH)
    }

    pub fn with_graph(graph: impl Into<String>) -> Self {
        Self { graph: graph.into() }
    }

    pub fn graph(&self) -> &str {
        &self.graph
    }

    /// Encode `record` under `sequence`, attaching the matrix for window
    /// position `sub_sequence`.
    pub fn encode(&self, record: &PerceptionRecord, sequence: u64, sub_sequence: u64) -> TripleBatch {
        let subject = ontology::perception_subject(record.class, sequence);
        let mut triples = vec![
            self.triple(&subject, RDF_TYPE, Term::iri(ontology::knowrob(record.class.perception_concept()))),
            self.triple(
                &subject,
                &ontology::knowrob("startTime"),
                Term::iri(ontology::timepoint(record.observed_at_epoch_seconds)),
            ),
            self.triple(
                &subject,
                &ontology::knowrob("objectActedOn"),
                Term::iri(ontology::arbi(&record.entity_id)),
            ),
        ];

        let structure = if record.kind.is_spatial() {
            let matrix = ontology::matrix_subject(&record.entity_id, sub_sequence);
            triples.push(self.triple(&matrix, RDF_TYPE, Term::iri(ontology::knowrob("RotationMatrix3D"))));
            triples.push(self.triple(
                &subject,
                &ontology::knowrob("eventOccursAt"),
                Term::iri(matrix.clone()),
            ));
            for (name, value) in &record.fields {
                if let Some(cell) = matrix_cell(record.kind, name) {
                    triples.push(self.triple(&matrix, &ontology::knowrob(cell), literal(value)));
                }
            }
            triples.push(self.triple(
                &matrix,
                &ontology::knowrob(ZERO_CELL),
                Term::literal("0", XSD_DOUBLE),
            ));
            Some(matrix)
        } else {
            if let Some(predicate) = scalar_predicate(record.kind) {
                for (_, value) in &record.fields {
                    triples.push(self.triple(&subject, &predicate, literal(value)));
                }
            }
            None
        };

        TripleBatch {
            sequence,
            sub_sequence,
            subject,
            structure,
            triples,
        }
    }

    /// Patterns that remove every triple written for one retired window
    /// entry: the perception subject and its matrix.
    pub fn retraction_patterns(
        &self,
        class: EntityClass,
        entity_id: &str,
        sequence: u64,
        sub_sequence: u64,
    ) -> [TriplePattern; 2] {
        [
            TriplePattern::about(ontology::perception_subject(class, sequence), self.graph.clone()),
            TriplePattern::about(ontology::matrix_subject(entity_id, sub_sequence), self.graph.clone()),
        ]
    }

    fn triple(&self, subject: &str, predicate: &str, object: Term) -> Triple {
        Triple {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object,
            graph: self.graph.clone(),
        }
    }
}

impl Default for TripleEncoder {
    fn default() -> Self {
        Self::new()
    }
}
