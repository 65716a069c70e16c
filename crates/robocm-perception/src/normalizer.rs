//! Perception Normalizer.
//!
//! Turns a parsed notification (event name plus ordered fields) into a typed
//! [`PerceptionRecord`].  Only events listed in the shape table are handled:
//!
//! | Event | Fields | Class | Kind |
//! |---|---|---|---|
//! | `robotPosition` | robot, x, y | RobotBody | Position |
//! | `robotDegree` | robot, heading | RobotBody | Heading |
//! | `robotStatus` | robot, status | RobotBody | Status |
//! | `robotSpeed` | robot, speed | RobotBody | Speed |
//! | `robotBattery` | robot, battery | RobotBody | Battery |
//! | `objectPosition` | object, x, y | Object | Position |
//!
//! The first field always names the observed entity and is resolved through
//! the deployment [`AliasTable`]; unknown aliases pass through unchanged.
//!
//! Outcomes are explicit: unknown event names are [`Normalized::Ignored`],
//! wrong field counts or unparsable numbers are [`Normalized::Rejected`].
//! Neither is an error for the pipeline; rejections are logged here.

use std::collections::{BTreeMap, HashMap};

use robocm_types::{CmError, EntityClass, FieldValue, PerceptionKind, PerceptionRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gl::{Expression, GeneralizedList};

// ─────────────────────────────────────────────────────────────────────────────
// Alias table
// ─────────────────────────────────────────────────────────────────────────────

/// Deployment-specific mapping from wire names to canonical ontology ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable(BTreeMap<String, String>);

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The two lift robots of the reference deployment.
    pub fn reference_deployment() -> Self {
        let mut table = Self::new();
        table.insert("AMR_LIFT1", "AMR_Lift01");
        table.insert("AMR_LIFT2", "AMR_Lift02");
        table
    }

    pub fn insert(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.0.insert(alias.into(), canonical.into());
    }

    /// Canonical id for `alias`, or `alias` itself when unmapped.
    pub fn resolve<'a>(&'a self, alias: &'a str) -> &'a str {
        self.0.get(alias).map(String::as_str).unwrap_or(alias)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Number,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
}

impl FieldSpec {
    pub fn number(name: &str) -> Self {
        Self { name: name.to_string(), ty: FieldType::Number }
    }

    pub fn text(name: &str) -> Self {
        Self { name: name.to_string(), ty: FieldType::Text }
    }
}

/// Declares how one event name maps to a perception record.
#[derive(Debug, Clone, PartialEq)]
pub struct EventShape {
    pub event: String,
    pub class: EntityClass,
    pub kind: PerceptionKind,
    /// Name of the leading entity field, used in subscription rules.
    pub entity_field: String,
    /// Payload fields following the entity field.
    pub fields: Vec<FieldSpec>,
}

impl EventShape {
    pub fn new(
        event: &str,
        class: EntityClass,
        kind: PerceptionKind,
        entity_field: &str,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self {
            event: event.to_string(),
            class,
            kind,
            entity_field: entity_field.to_string(),
            fields,
        }
    }

    /// Total number of arguments the event carries on the wire.
    pub fn arity(&self) -> usize {
        1 + self.fields.len()
    }

    /// Broker subscription rule that forwards this event as a notification.
    pub fn subscription_rule(&self) -> String {
        let mut args = format!("${}", self.entity_field);
        for f in &self.fields {
            args.push_str(" $");
            args.push_str(&f.name);
        }
        format!(
            "(rule (fact ({event} {args})) --> (notify ({event} {args})))",
            event = self.event
        )
    }
}

fn standard_shapes() -> Vec<EventShape> {
    use EntityClass::{Object, RobotBody};
    use PerceptionKind::*;
    vec![
        EventShape::new(
            "robotPosition",
            RobotBody,
            Position,
            "robot",
            vec![FieldSpec::number("x"), FieldSpec::number("y")],
        ),
        EventShape::new("robotDegree", RobotBody, Heading, "robot", vec![FieldSpec::number("heading")]),
        EventShape::new("robotStatus", RobotBody, Status, "robot", vec![FieldSpec::text("status")]),
        EventShape::new("robotSpeed", RobotBody, Speed, "robot", vec![FieldSpec::number("speed")]),
        EventShape::new("robotBattery", RobotBody, Battery, "robot", vec![FieldSpec::number("battery")]),
        EventShape::new(
            "objectPosition",
            Object,
            Position,
            "object",
            vec![FieldSpec::number("x"), FieldSpec::number("y")],
        ),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalizer
// ─────────────────────────────────────────────────────────────────────────────

/// Result of normalizing one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(PerceptionRecord),
    /// The event name is not in the shape table.
    Ignored,
    /// Recognized event with the wrong shape; carries a
    /// [`CmError::ShapeMismatch`].
    Rejected(CmError),
}

/// Converts parsed notifications into [`PerceptionRecord`]s.
pub struct Normalizer {
    shapes: HashMap<String, EventShape>,
    aliases: AliasTable,
}

impl Normalizer {
    /// Normalizer with the standard shape table and the given aliases.
    pub fn new(aliases: AliasTable) -> Self {
        let shapes = standard_shapes()
            .into_iter()
            .map(|s| (s.event.clone(), s))
            .collect();
        Self { shapes, aliases }
    }

    /// Add or replace the shape for `shape.event`.
    pub fn register(&mut self, shape: EventShape) {
        self.shapes.insert(shape.event.clone(), shape);
    }

    pub fn shape(&self, event: &str) -> Option<&EventShape> {
        self.shapes.get(event)
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Normalize an event given as name plus string fields.
    pub fn normalize(&self, event: &str, fields: &[String], observed_at: i64) -> Normalized {
        let Some(shape) = self.shapes.get(event) else {
            debug!(event, "ignoring unhandled event");
            return Normalized::Ignored;
        };

        match build_record(shape, &self.aliases, fields, observed_at) {
            Ok(record) => Normalized::Record(record),
            Err(details) => {
                warn!(event, details = %details, "rejecting malformed perception");
                Normalized::Rejected(CmError::ShapeMismatch {
                    event: event.to_string(),
                    details,
                })
            }
        }
    }

    /// Normalize a parsed generalized list.  Nested lists and variables in
    /// argument position make the event malformed.
    pub fn normalize_list(&self, list: &GeneralizedList, observed_at: i64) -> Normalized {
        if !self.shapes.contains_key(&list.name) {
            return self.normalize(&list.name, &[], observed_at);
        }
        let mut fields = Vec::with_capacity(list.expressions.len());
        for (i, expr) in list.expressions.iter().enumerate() {
            match expr {
                Expression::Value(v) => fields.push(v.text()),
                other => {
                    let details = format!("argument {i} must be a value, found {other}");
                    warn!(event = %list.name, details = %details, "rejecting malformed perception");
                    return Normalized::Rejected(CmError::ShapeMismatch {
                        event: list.name.clone(),
                        details,
                    });
                }
            }
        }
        self.normalize(&list.name, &fields, observed_at)
    }

    /// Subscription rules for every known event, sorted by event name.
    pub fn subscription_rules(&self) -> Vec<String> {
        let mut shapes: Vec<&EventShape> = self.shapes.values().collect();
        shapes.sort_by(|a, b| a.event.cmp(&b.event));
        shapes.into_iter().map(EventShape::subscription_rule).collect()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(AliasTable::reference_deployment())
    }
}

fn build_record(
    shape: &EventShape,
    aliases: &AliasTable,
    fields: &[String],
    observed_at: i64,
) -> Result<PerceptionRecord, String> {
    if fields.len() != shape.arity() {
        return Err(format!(
            "expected {} fields, found {}",
            shape.arity(),
            fields.len()
        ));
    }

    let alias = fields[0].trim();
    if alias.is_empty() {
        return Err(format!("empty {} id", shape.entity_field));
    }

    let mut values = Vec::with_capacity(shape.fields.len());
    for (spec, raw) in shape.fields.iter().zip(&fields[1..]) {
        let value = match spec.ty {
            FieldType::Number => match raw.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => FieldValue::Number(n),
                _ => return Err(format!("field '{}' is not a number: '{raw}'", spec.name)),
            },
            FieldType::Text => FieldValue::Text(raw.clone()),
        };
        values.push((spec.name.clone(), value));
    }

    Ok(PerceptionRecord {
        class: shape.class,
        kind: shape.kind,
        entity_id: aliases.resolve(alias).to_string(),
        fields: values,
        observed_at_epoch_seconds: observed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn position_event_resolves_alias() {
        let n = Normalizer::default();
        let out = n.normalize("robotPosition", &strings(&["AMR_LIFT1", "3.5", "-2.1"]), 100);
        let Normalized::Record(rec) = out else {
            panic!("expected record, got {out:?}");
        };
        assert_eq!(rec.class, EntityClass::RobotBody);
        assert_eq!(rec.kind, PerceptionKind::Position);
        assert_eq!(rec.entity_id, "AMR_Lift01");
        assert_eq!(rec.field("x"), Some(&FieldValue::Number(3.5)));
        assert_eq!(rec.field("y"), Some(&FieldValue::Number(-2.1)));
        assert_eq!(rec.observed_at_epoch_seconds, 100);
    }

    #[test]
    fn unknown_alias_passes_through() {
        let n = Normalizer::default();
        let Normalized::Record(rec) = n.normalize("robotPosition", &strings(&["AMR_LIFT9", "0", "0"]), 1)
        else {
            panic!("expected record");
        };
        assert_eq!(rec.entity_id, "AMR_LIFT9");
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let n = Normalizer::default();
        let out = n.normalize("robotPosition", &strings(&["AMR_LIFT1", "3.5"]), 1);
        assert!(matches!(out, Normalized::Rejected(CmError::ShapeMismatch { .. })));
    }

    #[test]
    fn non_numeric_coordinate_is_rejected() {
        let n = Normalizer::default();
        let out = n.normalize("robotDegree", &strings(&["AMR_LIFT1", "north"]), 1);
        assert!(matches!(out, Normalized::Rejected(_)));
        let out = n.normalize("robotDegree", &strings(&["AMR_LIFT1", "NaN"]), 1);
        assert!(matches!(out, Normalized::Rejected(_)));
    }

    #[test]
    fn empty_entity_is_rejected() {
        let n = Normalizer::default();
        let out = n.normalize("robotStatus", &strings(&["  ", "idle"]), 1);
        assert!(matches!(out, Normalized::Rejected(_)));
    }

    #[test]
    fn unknown_event_is_ignored() {
        let n = Normalizer::default();
        assert_eq!(n.normalize("robotMood", &strings(&["AMR_LIFT1", "happy"]), 1), Normalized::Ignored);
    }

    #[test]
    fn status_keeps_text() {
        let n = Normalizer::default();
        let Normalized::Record(rec) = n.normalize("robotStatus", &strings(&["AMR_LIFT2", "charging"]), 1)
        else {
            panic!("expected record");
        };
        assert_eq!(rec.entity_id, "AMR_Lift02");
        assert_eq!(rec.field("status"), Some(&FieldValue::Text("charging".into())));
    }

    #[test]
    fn normalize_list_accepts_bare_numbers() {
        let n = Normalizer::default();
        let list = gl::parse("(robotPosition \"AMR_LIFT1\" 1 2.5)").unwrap();
        let Normalized::Record(rec) = n.normalize_list(&list, 5) else {
            panic!("expected record");
        };
        assert_eq!(rec.field("x"), Some(&FieldValue::Number(1.0)));
    }

    #[test]
    fn normalize_list_rejects_nested_argument() {
        let n = Normalizer::default();
        let list = gl::parse("(robotDegree \"AMR_LIFT1\" (deg 90))").unwrap();
        assert!(matches!(n.normalize_list(&list, 5), Normalized::Rejected(_)));
    }

    #[test]
    fn registered_shape_is_recognized() {
        let mut n = Normalizer::new(AliasTable::new());
        n.register(EventShape::new(
            "jointAngle",
            EntityClass::Joint,
            PerceptionKind::Heading,
            "joint",
            vec![FieldSpec::number("heading")],
        ));
        assert!(matches!(
            n.normalize("jointAngle", &strings(&["elbow", "0.5"]), 1),
            Normalized::Record(_)
        ));
    }

    #[test]
    fn subscription_rules_cover_every_event() {
        let n = Normalizer::default();
        let rules = n.subscription_rules();
        assert_eq!(rules.len(), 6);
        assert!(rules.contains(
            &"(rule (fact (robotPosition $robot $x $y)) --> (notify (robotPosition $robot $x $y)))"
                .to_string()
        ));
    }
}
