//! Ontology vocabulary and IRI builders.
//!
//! Subjects minted by the encoder live in the ARBI namespace; concepts and
//! properties come from KnowRob.  Local names are percent-encoded so an
//! entity id taken verbatim from the wire can never break an IRI.

use robocm_types::EntityClass;

pub const ARBI_NS: &str = "http://www.arbi.com/ontologies/arbi.owl#";
pub const KNOWROB_NS: &str = "http://knowrob.org/kb/knowrob.owl#";
pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema#";

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// Named graph every perception triple is asserted into.
pub const PERCEPTION_GRAPH: &str = "robotPerception";

/// Local-name prefix of the transform sub-structure attached to spatial
/// perceptions.
pub const ROTATION_MATRIX: &str = "rotationMatrix3D";

const PREFIXES: [(&str, &str); 4] = [
    ("arbi", ARBI_NS),
    ("knowrob", KNOWROB_NS),
    ("rdf", RDF_NS),
    ("xsd", XSD_NS),
];

/// `arbi:<local>` as a full IRI.
pub fn arbi(local: &str) -> String {
    format!("{ARBI_NS}{}", encode_local(local))
}

/// `knowrob:<local>` as a full IRI.
pub fn knowrob(local: &str) -> String {
    format!("{KNOWROB_NS}{}", encode_local(local))
}

/// Expand a prefixed name such as `"knowrob:m03"`.  Returns `None` for
/// unknown prefixes and for text that is not a prefixed name.
pub fn expand_prefixed(name: &str) -> Option<String> {
    let (prefix, local) = name.split_once(':')?;
    if local.starts_with("//") {
        return None;
    }
    PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, ns)| format!("{ns}{local}"))
}

/// Perception-event subject: `arbi:<classPerception><sequence>`.
pub fn perception_subject(class: EntityClass, sequence: u64) -> String {
    arbi(&format!("{}{sequence}", class.perception_local_name()))
}

/// Transform sub-structure subject: `arbi:rotationMatrix3D_<entityId><sub>`.
pub fn matrix_subject(entity_id: &str, sub_sequence: u64) -> String {
    arbi(&format!("{ROTATION_MATRIX}_{entity_id}{sub_sequence}"))
}

/// Timepoint individual for an epoch-seconds timestamp.
pub fn timepoint(epoch_seconds: i64) -> String {
    arbi(&format!("timepoint_{epoch_seconds}"))
}

/// Percent-encode every byte outside the unreserved IRI set.
pub fn encode_local(local: &str) -> String {
    let mut out = String::with_capacity(local.len());
    for b in local.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
