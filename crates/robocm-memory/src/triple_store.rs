//! SQLite triple store.
//!
//! The default [`KnowledgeBase`] engine.  Quads are kept in one table with
//! set semantics; conjunctive queries are compiled into a self-join with one
//! table alias per atom.
//!
//! # Storage layout
//!
//! | column    | type    | description                                   |
//! |-----------|---------|-----------------------------------------------|
//! | subject   | TEXT    | Subject IRI                                   |
//! | predicate | TEXT    | Predicate IRI                                 |
//! | obj_kind  | INTEGER | `0` for an IRI object, `1` for a literal      |
//! | object    | TEXT    | Object IRI or literal lexical form            |
//! | datatype  | TEXT    | Literal datatype IRI, empty for IRI objects   |
//! | graph     | TEXT    | Named graph                                   |
//!
//! Results come back in insertion order of the first atom's match, then the
//! second's, and so on.  Duplicate solutions are reported once.
//!
//! # Example
//!
//! ```rust
//! use robocm_memory::{KnowledgeBase, SqliteTripleStore};
//! use robocm_types::{Term, Triple, TriplePattern};
//!
//! let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! rt.block_on(async {
//!     let store = SqliteTripleStore::open_in_memory().unwrap();
//!     let triple = Triple {
//!         subject: "http://www.arbi.com/ontologies/arbi.owl#station2".into(),
//!         predicate: "http://www.w3.org/1999/02/22-rdf-syntax-ns#type".into(),
//!         object: Term::iri("http://knowrob.org/kb/knowrob.owl#Place"),
//!         graph: "robotPerception".into(),
//!     };
//!     store.assert_triple(&triple).await.unwrap();
//!     store.assert_triple(&triple).await.unwrap();
//!     assert_eq!(store.len().await.unwrap(), 1);
//!
//!     let gone = TriplePattern::about(triple.subject.clone(), "robotPerception");
//!     assert_eq!(store.retract(&gone).await.unwrap(), 1);
//! });
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use robocm_types::{Bindings, QueryPattern, QueryTerm, Term, Triple, TriplePattern};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use tracing::debug;

use crate::gateway::{KbError, KnowledgeBase};

const IRI_KIND: i64 = 0;
const LITERAL_KIND: i64 = 1;

fn split_term(term: &Term) -> (i64, &str, &str) {
    match term {
        Term::Iri(iri) => (IRI_KIND, iri.as_str(), ""),
        Term::Literal { lexical, datatype } => (LITERAL_KIND, lexical.as_str(), datatype.as_str()),
    }
}

fn join_term(kind: i64, value: String, datatype: String) -> Term {
    if kind == LITERAL_KIND {
        Term::Literal {
            lexical: value,
            datatype,
        }
    } else {
        Term::Iri(value)
    }
}

/// SQLite-backed [`KnowledgeBase`].
#[derive(Clone)]
pub struct SqliteTripleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTripleStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: &str) -> Result<Self, KbError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a temporary in-memory store.
    pub fn open_in_memory() -> Result<Self, KbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, KbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS triples (
                subject   TEXT    NOT NULL,
                predicate TEXT    NOT NULL,
                obj_kind  INTEGER NOT NULL,
                object    TEXT    NOT NULL,
                datatype  TEXT    NOT NULL,
                graph     TEXT    NOT NULL,
                UNIQUE (subject, predicate, obj_kind, object, datatype, graph)
            );
            CREATE INDEX IF NOT EXISTS triples_by_subject ON triples (subject, graph);
            CREATE INDEX IF NOT EXISTS triples_by_object ON triples (object, predicate);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of stored triples.
    pub async fn len(&self) -> Result<usize, KbError> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM triples", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool, KbError> {
        Ok(self.len().await? == 0)
    }

    /// Every stored triple about `subject`, in insertion order.
    pub async fn describe(&self, subject: &str) -> Result<Vec<Triple>, KbError> {
        let subject = subject.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT subject, predicate, obj_kind, object, datatype, graph
                 FROM triples WHERE subject = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![subject], |row| {
                Ok(Triple {
                    subject: row.get(0)?,
                    predicate: row.get(1)?,
                    object: join_term(row.get(2)?, row.get(3)?, row.get(4)?),
                    graph: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, KbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, KbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KbError::Unavailable("triple store lock poisoned".into()))?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl KnowledgeBase for SqliteTripleStore {
    async fn assert_triple(&self, triple: &Triple) -> Result<(), KbError> {
        let triple = triple.clone();
        self.blocking(move |conn| {
            let (kind, object, datatype) = split_term(&triple.object);
            conn.execute(
                "INSERT OR IGNORE INTO triples
                     (subject, predicate, obj_kind, object, datatype, graph)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![triple.subject, triple.predicate, kind, object, datatype, triple.graph],
            )?;
            Ok(())
        })
        .await
    }

    async fn retract(&self, pattern: &TriplePattern) -> Result<usize, KbError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut bind = |column: &str, value: Value| {
            values.push(value);
            clauses.push(format!("{column} = ?{}", values.len()));
        };
        if let Some(s) = &pattern.subject {
            bind("subject", Value::Text(s.clone()));
        }
        if let Some(p) = &pattern.predicate {
            bind("predicate", Value::Text(p.clone()));
        }
        if let Some(o) = &pattern.object {
            let (kind, object, datatype) = split_term(o);
            bind("obj_kind", Value::Integer(kind));
            bind("object", Value::Text(object.to_string()));
            bind("datatype", Value::Text(datatype.to_string()));
        }
        if let Some(g) = &pattern.graph {
            bind("graph", Value::Text(g.clone()));
        }
        let sql = if clauses.is_empty() {
            "DELETE FROM triples".to_string()
        } else {
            format!("DELETE FROM triples WHERE {}", clauses.join(" AND "))
        };
        self.blocking(move |conn| {
            let removed = conn.execute(&sql, params_from_iter(values))?;
            debug!(removed, "retracted triples");
            Ok(removed)
        })
        .await
    }

    async fn query(&self, pattern: &QueryPattern) -> Result<Vec<Bindings>, KbError> {
        let compiled = CompiledQuery::compile(pattern)?;
        self.blocking(move |conn| compiled.run(conn)).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query compilation
// ─────────────────────────────────────────────────────────────────────────────

/// Column expressions addressing one term position of one atom.
#[derive(Clone)]
struct Position {
    kind: String,
    value: String,
    datatype: String,
}

impl Position {
    fn subject(alias: &str) -> Self {
        Self::iri_column(alias, "subject")
    }

    fn predicate(alias: &str) -> Self {
        Self::iri_column(alias, "predicate")
    }

    fn iri_column(alias: &str, column: &str) -> Self {
        Self {
            kind: IRI_KIND.to_string(),
            value: format!("{alias}.{column}"),
            datatype: "''".to_string(),
        }
    }

    fn object(alias: &str) -> Self {
        Self {
            kind: format!("{alias}.obj_kind"),
            value: format!("{alias}.object"),
            datatype: format!("{alias}.datatype"),
        }
    }
}

struct CompiledQuery {
    sql: String,
    params: Vec<Value>,
    variables: Vec<String>,
}

impl CompiledQuery {
    fn compile(pattern: &QueryPattern) -> Result<Self, KbError> {
        if pattern.atoms.is_empty() {
            return Err(KbError::Rejected("query has no atoms".into()));
        }
        let mut from = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        let mut bound: HashMap<String, Position> = HashMap::new();
        let mut variables: Vec<String> = Vec::new();

        for (i, atom) in pattern.atoms.iter().enumerate() {
            let alias = format!("t{i}");
            from.push(format!("triples {alias}"));
            for (term, position) in [
                (&atom.subject, Position::subject(&alias)),
                (&atom.predicate, Position::predicate(&alias)),
                (&atom.object, Position::object(&alias)),
            ] {
                match term {
                    QueryTerm::Const(constant) => {
                        let (kind, value, datatype) = split_term(constant);
                        params.push(Value::Integer(kind));
                        clauses.push(format!("{} = ?{}", position.kind, params.len()));
                        params.push(Value::Text(value.to_string()));
                        clauses.push(format!("{} = ?{}", position.value, params.len()));
                        params.push(Value::Text(datatype.to_string()));
                        clauses.push(format!("{} = ?{}", position.datatype, params.len()));
                    }
                    QueryTerm::Var(name) => match bound.get(name) {
                        Some(first) => {
                            clauses.push(format!("{} = {}", position.kind, first.kind));
                            clauses.push(format!("{} = {}", position.value, first.value));
                            clauses.push(format!("{} = {}", position.datatype, first.datatype));
                        }
                        None => {
                            bound.insert(name.clone(), position);
                            variables.push(name.clone());
                        }
                    },
                }
            }
        }

        let select = if variables.is_empty() {
            "1".to_string()
        } else {
            variables
                .iter()
                .filter_map(|v| bound.get(v))
                .map(|p| format!("{}, {}, {}", p.kind, p.value, p.datatype))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let order = (0..pattern.atoms.len())
            .map(|i| format!("t{i}.rowid"))
            .collect::<Vec<_>>()
            .join(", ");
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {select} FROM {}{filter} ORDER BY {order}", from.join(", "));
        Ok(Self {
            sql,
            params,
            variables,
        })
    }

    fn run(self, conn: &Connection) -> Result<Vec<Bindings>, KbError> {
        let mut stmt = conn.prepare(&self.sql)?;
        let variables = &self.variables;
        let rows = stmt.query_map(params_from_iter(self.params.iter()), |row| {
            let mut bindings = Bindings::new();
            for (i, name) in variables.iter().enumerate() {
                let kind: i64 = row.get(i * 3)?;
                let value: String = row.get(i * 3 + 1)?;
                let datatype: String = row.get(i * 3 + 2)?;
                bindings.insert(name.clone(), join_term(kind, value, datatype));
            }
            Ok(bindings)
        })?;
        let mut seen = HashSet::new();
        let mut solutions = Vec::new();
        for row in rows {
            let bindings = row?;
            if seen.insert(bindings.clone()) {
                solutions.push(bindings);
            }
        }
        Ok(solutions)
    }
}
