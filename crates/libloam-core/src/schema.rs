//! Schema registry
//!
//! Tables and mutations are declared up front and validated when the schema is
//! built. Mutation lookup is a keyed table by name; every mutation carries a
//! shape hash that events must match exactly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::LoamError;
use crate::types::event::MutationEvent;
use crate::types::ids::EventId;

/// Name of the built-in raw SQL mutation
pub const RAW_SQL_MUTATION: &str = "loam.RawSql";

/// Column and argument value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    /// Stored as INTEGER 0/1, decoded to a JSON bool
    Boolean,
    /// Stored as TEXT, decoded to a JSON value
    Json,
    Blob,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Whether a non-null argument value has this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ColumnType::Text | ColumnType::Blob => value.is_string(),
            ColumnType::Integer => value.is_i64() || value.is_u64(),
            ColumnType::Real => value.is_number(),
            ColumnType::Boolean => {
                value.is_boolean() || matches!(value.as_i64(), Some(0) | Some(1))
            }
            ColumnType::Json => true,
        }
    }

    /// Convert a raw SQLite value back to its declared JSON shape
    pub fn decode(&self, value: Value) -> Value {
        match (self, value) {
            (ColumnType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
            (ColumnType::Json, Value::String(s)) => {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            primary_key: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// An application table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn create_sql(&self) -> String {
        let pk: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut col = format!("\"{}\" {}", c.name, c.ty.sql_type());
                if c.primary_key && pk.len() == 1 {
                    col.push_str(" PRIMARY KEY");
                }
                if !c.nullable {
                    col.push_str(" NOT NULL");
                }
                col
            })
            .collect();
        if pk.len() > 1 {
            let cols: Vec<String> = pk.iter().map(|c| format!("\"{}\"", c)).collect();
            parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.name,
            parts.join(", ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\"", self.name)
    }

    /// Column decode hints for query results over this table
    pub fn column_types(&self) -> BTreeMap<String, ColumnType> {
        self.columns.iter().map(|c| (c.name.clone(), c.ty)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgDef {
    pub name: String,
    pub ty: ColumnType,
    pub optional: bool,
}

/// A statement with its bind values and the tables it writes
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub bind: Value,
    pub writes: BTreeSet<String>,
}

pub type DynamicStatement =
    Arc<dyn Fn(&Value) -> Result<BoundStatement, LoamError> + Send + Sync>;

/// The effect of a mutation: fixed text bound from the args, or a function
/// producing a statement from the args
#[derive(Clone)]
pub enum Statement {
    Sql(String),
    Dynamic(DynamicStatement),
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Statement::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A declared mutation
#[derive(Debug, Clone)]
pub struct MutationDef {
    pub name: String,
    pub args: Vec<ArgDef>,
    pub statement: Statement,
    pub writes: BTreeSet<String>,
    pub local_only: bool,
    hash: i64,
}

impl MutationDef {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_statement(name, Statement::Sql(sql.into()))
    }

    pub fn dynamic<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<BoundStatement, LoamError> + Send + Sync + 'static,
    {
        Self::with_statement(name, Statement::Dynamic(Arc::new(f)))
    }

    fn with_statement(name: impl Into<String>, statement: Statement) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            statement,
            writes: BTreeSet::new(),
            local_only: false,
            hash: 0,
        }
    }

    pub fn arg(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.args.push(ArgDef {
            name: name.into(),
            ty,
            optional: false,
        });
        self
    }

    pub fn optional_arg(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.args.push(ArgDef {
            name: name.into(),
            ty,
            optional: true,
        });
        self
    }

    pub fn writes(mut self, table: impl Into<String>) -> Self {
        self.writes.insert(table.into());
        self
    }

    /// Events of this mutation are never pushed to the remote authority
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn hash(&self) -> i64 {
        self.hash
    }

    /// Check an args payload against the declared argument list
    pub fn validate_args(&self, args: &Value) -> Result<(), LoamError> {
        let empty = serde_json::Map::new();
        let object = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(LoamError::SchemaViolation(format!(
                    "mutation '{}' expects an object of args, got {}",
                    self.name, other
                )))
            }
        };

        for key in object.keys() {
            if !self.args.iter().any(|a| &a.name == key) {
                return Err(LoamError::SchemaViolation(format!(
                    "mutation '{}' has no argument '{}'",
                    self.name, key
                )));
            }
        }
        for arg in &self.args {
            match object.get(&arg.name) {
                None | Some(Value::Null) if arg.optional => {}
                None | Some(Value::Null) => {
                    return Err(LoamError::SchemaViolation(format!(
                        "mutation '{}' is missing argument '{}'",
                        self.name, arg.name
                    )))
                }
                Some(value) if !arg.ty.accepts(value) => {
                    return Err(LoamError::SchemaViolation(format!(
                        "argument '{}' of mutation '{}' is not {:?}",
                        arg.name, self.name, arg.ty
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Produce the statement to execute for an args payload
    pub fn bind(&self, args: &Value) -> Result<BoundStatement, LoamError> {
        let mut bound = match &self.statement {
            Statement::Sql(sql) => BoundStatement {
                sql: sql.clone(),
                bind: args.clone(),
                writes: BTreeSet::new(),
            },
            Statement::Dynamic(f) => f(args)?,
        };
        if bound.writes.is_empty() {
            bound.writes = if self.writes.is_empty() {
                written_tables(&bound.sql)
            } else {
                self.writes.clone()
            };
        }
        Ok(bound)
    }

    fn shape(&self) -> Value {
        let statement = match &self.statement {
            Statement::Sql(sql) => sql.as_str(),
            Statement::Dynamic(_) => "dynamic",
        };
        json!({
            "name": self.name,
            "args": self.args,
            "statement": statement,
            "writes": self.writes,
            "localOnly": self.local_only,
        })
    }
}

/// The built-in raw SQL mutation: `{ sql, bind?, writtenTables? }`
pub fn raw_sql_mutation() -> MutationDef {
    MutationDef::dynamic(RAW_SQL_MUTATION, |args| {
        let sql = args
            .get("sql")
            .and_then(Value::as_str)
            .ok_or_else(|| LoamError::SchemaViolation("raw sql mutation needs 'sql'".to_string()))?;
        let writes = match args.get("writtenTables") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => written_tables(sql),
        };
        Ok(BoundStatement {
            sql: sql.to_string(),
            bind: args.get("bind").cloned().unwrap_or(Value::Null),
            writes,
        })
    })
    .arg("sql", ColumnType::Text)
    .optional_arg("bind", ColumnType::Json)
    .optional_arg("writtenTables", ColumnType::Json)
}

/// Args payload for the raw SQL mutation
pub fn raw_sql_args(sql: impl Into<String>) -> Value {
    json!({ "sql": sql.into() })
}

fn pattern(cell: &'static OnceLock<Option<Regex>>, re: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(re).ok()).as_ref()
}

fn collect_tables(re: Option<&Regex>, sql: &str) -> BTreeSet<String> {
    re.map(|re| {
        re.captures_iter(sql)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    })
    .unwrap_or_default()
}

/// Tables written by a statement (`INSERT INTO`, `UPDATE`, `DELETE FROM`)
pub fn written_tables(sql: &str) -> BTreeSet<String> {
    static WRITES: OnceLock<Option<Regex>> = OnceLock::new();
    let mut tables = collect_tables(
        pattern(
            &WRITES,
            r#"(?i)\b(?:insert\s+(?:or\s+\w+\s+)?into|replace\s+into|update(?:\s+or\s+\w+)?|delete\s+from)\s+["`\[]?(\w+)"#,
        ),
        sql,
    );
    // upsert clause: `ON CONFLICT DO UPDATE SET`
    tables.retain(|t| !t.eq_ignore_ascii_case("set"));
    tables
}

/// Tables read by a query: everything after `JOIN`, and every entry of a
/// comma-separated `FROM` list
pub fn queried_tables(sql: &str) -> BTreeSet<String> {
    static READS: OnceLock<Option<Regex>> = OnceLock::new();
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    static ALIAS: OnceLock<Option<Regex>> = OnceLock::new();
    static COMMA: OnceLock<Option<Regex>> = OnceLock::new();
    let (Some(reads), Some(name), Some(alias), Some(comma)) = (
        pattern(&READS, r#"(?i)\b(?:from|join)\s+"#),
        pattern(&NAME, r#"^\s*["`\[]?(\w+)["`\]]?"#),
        pattern(&ALIAS, r#"(?i)^\s*(?:as\s+)?["`\[]?\w+["`\]]?"#),
        pattern(&COMMA, r#"^\s*,"#),
    ) else {
        return BTreeSet::new();
    };

    let mut tables = BTreeSet::new();
    for start in reads.find_iter(sql) {
        let mut rest = &sql[start.end()..];
        loop {
            // a subquery's own FROM is matched separately
            if let Some(after) = skip_parenthesized(rest) {
                rest = after;
            } else if let Some(c) = name.captures(rest) {
                if let Some(m) = c.get(1) {
                    tables.insert(m.as_str().to_string());
                }
                rest = &rest[c.get(0).map_or(0, |m| m.end())..];
            } else {
                break;
            }
            if let Some(m) = alias.find(rest) {
                rest = &rest[m.end()..];
            }
            match comma.find(rest) {
                Some(m) => rest = &rest[m.end()..],
                None => break,
            }
        }
    }
    tables
}

/// The text after a leading balanced `( ... )`, if `sql` starts with one
fn skip_parenthesized(sql: &str) -> Option<&str> {
    let trimmed = sql.trim_start();
    if !trimmed.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    for (i, c) in trimmed.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&trimmed[i + 1..]);
                }
            }
            _ => {}
        }
    }
    None
}

fn shape_hash(shape: &Value) -> i64 {
    let digest = Sha256::digest(shape.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A validated set of tables and mutations
#[derive(Debug, Clone)]
pub struct Schema {
    tables: BTreeMap<String, TableDef>,
    mutations: HashMap<String, MutationDef>,
    hash: i64,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Hash over every table and mutation shape
    pub fn hash(&self) -> i64 {
        self.hash
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn mutation(&self, name: &str) -> Option<&MutationDef> {
        self.mutations.get(name)
    }

    /// Resolve an event to its definition, checking name, hash and args
    pub fn resolve(&self, event: &MutationEvent) -> Result<&MutationDef, LoamError> {
        let def = self
            .mutations
            .get(&event.mutation)
            .ok_or_else(|| LoamError::unknown_mutation(&event.mutation))?;
        if def.hash != event.schema_hash {
            return Err(LoamError::hash_mismatch(&def.name, def.hash, event.schema_hash));
        }
        def.validate_args(&event.args)?;
        Ok(def)
    }

    /// Build a validated event for a declared mutation
    pub fn event(&self, id: EventId, mutation: &str, args: Value) -> Result<MutationEvent, LoamError> {
        let def = self
            .mutations
            .get(mutation)
            .ok_or_else(|| LoamError::unknown_mutation(mutation))?;
        def.validate_args(&args)?;
        Ok(MutationEvent::new(id, mutation, args, def.hash))
    }

    /// Column decode hints for every column of every table, by column name.
    /// Columns whose name appears in several tables with different types are
    /// left undecoded.
    pub fn column_hints(&self, tables: &BTreeSet<String>) -> BTreeMap<String, ColumnType> {
        let mut hints = BTreeMap::new();
        let mut conflicting = BTreeSet::new();
        for table in tables.iter().filter_map(|t| self.tables.get(t)) {
            for (name, ty) in table.column_types() {
                match hints.get(&name) {
                    Some(existing) if *existing != ty => {
                        conflicting.insert(name);
                    }
                    _ => {
                        hints.insert(name, ty);
                    }
                }
            }
        }
        for name in conflicting {
            hints.remove(&name);
        }
        hints
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<TableDef>,
    mutations: Vec<MutationDef>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            mutations: vec![raw_sql_mutation()],
        }
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    pub fn mutation(mut self, mutation: MutationDef) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn build(self) -> Result<Schema, LoamError> {
        let mut tables = BTreeMap::new();
        for table in self.tables {
            if !valid_identifier(&table.name) || table.name.starts_with("__") {
                return Err(LoamError::SchemaViolation(format!(
                    "invalid table name '{}'",
                    table.name
                )));
            }
            if table.columns.is_empty() {
                return Err(LoamError::SchemaViolation(format!(
                    "table '{}' has no columns",
                    table.name
                )));
            }
            if let Some(col) = table.columns.iter().find(|c| !valid_identifier(&c.name)) {
                return Err(LoamError::SchemaViolation(format!(
                    "invalid column name '{}' in table '{}'",
                    col.name, table.name
                )));
            }
            let name = table.name.clone();
            if tables.insert(name.clone(), table).is_some() {
                return Err(LoamError::SchemaViolation(format!("duplicate table '{}'", name)));
            }
        }

        let mut mutations = HashMap::new();
        for mut def in self.mutations {
            if let Statement::Sql(sql) = &def.statement {
                if def.writes.is_empty() {
                    def.writes = written_tables(sql);
                }
            }
            if let Some(unknown) = def.writes.iter().find(|t| !tables.contains_key(*t)) {
                return Err(LoamError::SchemaViolation(format!(
                    "mutation '{}' writes unknown table '{}'",
                    def.name, unknown
                )));
            }
            def.hash = shape_hash(&def.shape());
            let name = def.name.clone();
            if mutations.insert(name.clone(), def).is_some() {
                return Err(LoamError::SchemaViolation(format!("duplicate mutation '{}'", name)));
            }
        }

        let mutation_hashes: BTreeMap<&str, i64> = mutations
            .values()
            .map(|m| (m.name.as_str(), m.hash))
            .collect();
        let hash = shape_hash(&json!({
            "tables": tables.values().collect::<Vec<_>>(),
            "mutations": mutation_hashes,
        }));

        Ok(Schema {
            tables,
            mutations,
            hash,
        })
    }
}
