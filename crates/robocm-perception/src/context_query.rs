//! Context queries in generalized-list form.
//!
//! Agents ask the context manager with a `context` list of triple atoms:
//!
//! ```text
//! (context (triple $P "rdf:type" "knowrob:VisualRobotBodyPerception")
//!          (triple $P "knowrob:objectActedOn" "arbi:AMR_Lift01"))
//! ```
//!
//! Constants are IRIs (full or prefixed with `arbi:`, `knowrob:`, `rdf:`,
//! `xsd:`), bare numbers (matched as `xsd:double` literals), or explicit
//! `(literal "lexical" "datatype")` lists.  Answers are rendered back as
//!
//! ```text
//! (result (binding ("P" "http://…#visualRobotBodyPerception3")) …)
//! ```

use robocm_types::{Bindings, CmError, QueryAtom, QueryPattern, QueryTerm, Term};

use crate::gl::{self, Expression, GeneralizedList, Value};
use crate::ontology::{self, XSD_DOUBLE, XSD_STRING};

/// Parse query text into a [`QueryPattern`].
///
/// # Errors
///
/// [`CmError::Parse`] for malformed GL, a non-`context` head, an empty
/// conjunction, or an atom that is not `(triple S P O)`.
pub fn parse_query(text: &str) -> Result<QueryPattern, CmError> {
    let list = gl::parse(text)?;
    if list.name != "context" {
        return Err(CmError::Parse(format!(
            "query must be a (context …) list, found ({} …)",
            list.name
        )));
    }
    if list.expressions.is_empty() {
        return Err(CmError::Parse("query has no atoms".to_string()));
    }
    let atoms = list
        .expressions
        .iter()
        .map(atom)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueryPattern { atoms })
}

fn atom(expr: &Expression) -> Result<QueryAtom, CmError> {
    let list = expr
        .as_list()
        .filter(|l| l.name == "triple" && l.expressions.len() == 3)
        .ok_or_else(|| CmError::Parse(format!("expected (triple S P O), found {expr}")))?;
    Ok(QueryAtom {
        subject: term(&list.expressions[0])?,
        predicate: term(&list.expressions[1])?,
        object: term(&list.expressions[2])?,
    })
}

fn term(expr: &Expression) -> Result<QueryTerm, CmError> {
    match expr {
        Expression::Variable(name) => Ok(QueryTerm::Var(name.clone())),
        Expression::Value(Value::Str(s) | Value::Symbol(s)) => Ok(QueryTerm::Const(Term::iri(iri(s)))),
        Expression::Value(Value::Int(i)) => Ok(QueryTerm::Const(Term::literal(i.to_string(), XSD_DOUBLE))),
        Expression::Value(Value::Float(f)) => Ok(QueryTerm::Const(Term::literal(f.to_string(), XSD_DOUBLE))),
        Expression::List(l) if l.name == "literal" => literal(l).map(QueryTerm::Const),
        Expression::List(l) => Err(CmError::Parse(format!("unexpected list in atom: {l}"))),
    }
}

fn literal(list: &GeneralizedList) -> Result<Term, CmError> {
    let texts: Vec<String> = list
        .expressions
        .iter()
        .map(|e| e.as_value().map(Value::text))
        .collect::<Option<_>>()
        .ok_or_else(|| CmError::Parse(format!("literal arguments must be values: {list}")))?;
    match texts.as_slice() {
        [lexical] => Ok(Term::literal(lexical.clone(), XSD_STRING)),
        [lexical, datatype] => Ok(Term::literal(lexical.clone(), iri(datatype))),
        _ => Err(CmError::Parse(format!("expected (literal \"lexical\" [\"datatype\"]), found {list}"))),
    }
}

fn iri(text: &str) -> String {
    ontology::expand_prefixed(text).unwrap_or_else(|| text.to_string())
}

/// Render solutions as a `(result …)` list.  Variables appear in the order
/// given by `variables`; unbound variables are omitted.
pub fn render_result(variables: &[&str], solutions: &[Bindings]) -> String {
    let mut out = String::from("(result");
    for solution in solutions {
        out.push_str(" (binding");
        for var in variables {
            if let Some(term) = solution.get(*var) {
                out.push_str(&format!(" ({} {})", gl::quote(var), render_term(term)));
            }
        }
        out.push(')');
    }
    out.push(')');
    out
}

fn render_term(term: &Term) -> String {
    match term {
        Term::Iri(iri) => gl::quote(iri),
        Term::Literal { lexical, datatype } => {
            format!("(literal {} {})", gl::quote(lexical), gl::quote(datatype))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::RDF_TYPE;

    #[test]
    fn parses_conjunctive_query_with_prefixes() {
        let q = parse_query(
            "(context (triple $P \"rdf:type\" \"knowrob:VisualRobotBodyPerception\") \
                      (triple $P \"knowrob:objectActedOn\" \"arbi:AMR_Lift01\"))",
        )
        .unwrap();
        assert_eq!(q.atoms.len(), 2);
        assert_eq!(q.atoms[0].subject, QueryTerm::Var("P".into()));
        assert_eq!(q.atoms[0].predicate, QueryTerm::Const(Term::iri(RDF_TYPE)));
        assert_eq!(
            q.atoms[1].object,
            QueryTerm::Const(Term::iri(ontology::arbi("AMR_Lift01")))
        );
    }

    #[test]
    fn numbers_and_literals_become_typed_literals() {
        let q = parse_query(
            "(context (triple $M \"knowrob:m03\" 3.5) (triple $P \"arbi:robotStatus\" (literal \"idle\")))",
        )
        .unwrap();
        assert_eq!(q.atoms[0].object, QueryTerm::Const(Term::literal("3.5", XSD_DOUBLE)));
        assert_eq!(q.atoms[1].object, QueryTerm::Const(Term::literal("idle", XSD_STRING)));
    }

    #[test]
    fn full_iris_are_kept() {
        let q = parse_query("(context (triple \"http://www.arbi.com/ontologies/arbi.owl#station2\" $P $O))").unwrap();
        assert_eq!(
            q.atoms[0].subject,
            QueryTerm::Const(Term::iri("http://www.arbi.com/ontologies/arbi.owl#station2"))
        );
    }

    #[test]
    fn rejects_malformed_queries() {
        assert!(parse_query("(context").is_err());
        assert!(parse_query("(ask (triple $A $B $C))").is_err());
        assert!(parse_query("(context)").is_err());
        assert!(parse_query("(context (faceToFace $A $B))").is_err());
        assert!(parse_query("(context (triple $A $B))").is_err());
        assert!(parse_query("(context (triple $A $B (literal)))").is_err());
    }

    #[test]
    fn renders_bindings_in_variable_order() {
        let mut b = Bindings::new();
        b.insert("S".into(), Term::iri("http://x#s"));
        b.insert("O".into(), Term::literal("3.5", XSD_DOUBLE));
        let text = render_result(&["S", "O"], &[b]);
        assert_eq!(
            text,
            "(result (binding (\"S\" \"http://x#s\") (\"O\" (literal \"3.5\" \"http://www.w3.org/2001/XMLSchema#double\"))))"
        );
    }

    #[test]
    fn empty_answer_renders_as_bare_result() {
        assert_eq!(render_result(&["S"], &[]), "(result)");
    }
}
