//! A SQL builder for building the WHERE clauses of the list endpoints. Values never end up in the SQL text, every value becomes a `$n` placeholder which is bound afterwards.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::{QueryAs, QueryScalar};
use uuid::Uuid;

lazy_static! {
    static ref FIELD_REGEX: Regex = Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)?$").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Uuid(Uuid),
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Null,
    ArrayString(Vec<String>),
    ArrayUuid(Vec<Uuid>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryItem {
    pub field: String,
    pub value: Value,
    pub operator: String, // =, !=, <, >, <=, >=, like, ilike, in, not in, is, is not
}

impl QueryItem {
    pub fn new(field: &str, value: Value, operator: &str) -> Result<Self, anyhow::Error> {
        if !FIELD_REGEX.is_match(field) {
            return Err(anyhow::anyhow!("Invalid field: {}", field));
        }

        let allowed: &[&str] = match value {
            Value::Uuid(_) | Value::Bool(_) => &["=", "!="],
            Value::Int(_) | Value::Float(_) | Value::Timestamp(_) => {
                &["=", "!=", "<", ">", "<=", ">="]
            }
            Value::String(_) => &["=", "!=", "like", "ilike"],
            Value::Null => &["is", "is not"],
            Value::ArrayString(_) | Value::ArrayUuid(_) => &["in", "not in"],
        };

        if !allowed.contains(&operator) {
            return Err(anyhow::anyhow!(
                "Invalid operator {} for the value of {}",
                operator,
                field
            ));
        }

        Ok(Self {
            field: field.to_string(),
            value,
            operator: operator.to_string(),
        })
    }

    /// Shortcut for the most common case, an equality on a column.
    pub fn eq(field: &str, value: Value) -> Result<Self, anyhow::Error> {
        QueryItem::new(field, value, "=")
    }

    /// Renders the condition and pushes its value into `params`. The placeholder number is the position of the value in `params`.
    pub fn format(&self, params: &mut Vec<Value>) -> String {
        match &self.value {
            Value::Null => format!("{} {} NULL", self.field, self.operator.to_uppercase()),
            Value::ArrayString(_) | Value::ArrayUuid(_) => {
                params.push(self.value.clone());
                if self.operator == "in" {
                    format!("{} = ANY(${})", self.field, params.len())
                } else {
                    format!("NOT ({} = ANY(${}))", self.field, params.len())
                }
            }
            _ => {
                params.push(self.value.clone());
                format!(
                    "{} {} ${}",
                    self.field,
                    self.operator.to_uppercase(),
                    params.len()
                )
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposeQueryItem {
    /// and, or
    pub operator: String,
    /// QueryItem or ComposeQuery
    pub items: Vec<ComposeQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ComposeQuery {
    QueryItem(QueryItem),
    ComposeQueryItem(ComposeQueryItem),
}

impl ComposeQuery {
    pub fn format(&self, params: &mut Vec<Value>) -> String {
        match self {
            ComposeQuery::QueryItem(item) => item.format(params),
            ComposeQuery::ComposeQueryItem(item) => item.format(params),
        }
    }
}

impl ComposeQueryItem {
    pub fn new(operator: &str) -> Self {
        Self {
            operator: operator.to_string(),
            items: vec![],
        }
    }

    // Why ComposeQuery here?
    // Because we can have nested ComposeQueryItem, it maybe a QueryItem or ComposeQueryItem
    pub fn add_item(&mut self, item: ComposeQuery) -> &mut Self {
        self.items.push(item);
        self
    }

    pub fn add_query_item(&mut self, item: QueryItem) -> &mut Self {
        self.add_item(ComposeQuery::QueryItem(item))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn format(&self, params: &mut Vec<Value>) -> String {
        let mut query = String::new();

        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                query.push_str(&format!(" {} ", self.operator.to_uppercase()));
            }

            match item {
                ComposeQuery::QueryItem(item) => {
                    query.push_str(&item.format(params));
                }
                ComposeQuery::ComposeQueryItem(item) => {
                    query.push_str(&format!("({})", item.format(params)));
                }
            }
        }
        query
    }

    /// Renders a full WHERE clause, `WHERE 1=1` when there is nothing to filter on.
    pub fn where_clause(&self, params: &mut Vec<Value>) -> String {
        if self.items.is_empty() {
            return "WHERE 1=1".to_string();
        }

        let clause = format!("WHERE {}", self.format(params));
        debug!("where clause: {}, params: {:?}", clause, params);
        clause
    }
}

/// Renders the LIMIT/OFFSET clause for 1-based pages.
pub fn make_pagination_clause(page: u64, page_size: u64) -> String {
    let page = if page == 0 { 1 } else { page };
    format!("LIMIT {} OFFSET {}", page_size, (page - 1) * page_size)
}

pub fn bind_query_as<'q, O>(
    mut query: QueryAs<'q, Postgres, O, PgArguments>,
    params: &[Value],
) -> QueryAs<'q, Postgres, O, PgArguments> {
    for value in params {
        query = match value.clone() {
            Value::Uuid(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::String(v) => query.bind(v),
            Value::Bool(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            Value::Null => query,
            Value::ArrayString(v) => query.bind(v),
            Value::ArrayUuid(v) => query.bind(v),
        };
    }
    query
}

pub fn bind_query_scalar<'q, O>(
    mut query: QueryScalar<'q, Postgres, O, PgArguments>,
    params: &[Value],
) -> QueryScalar<'q, Postgres, O, PgArguments> {
    for value in params {
        query = match value.clone() {
            Value::Uuid(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::String(v) => query.bind(v),
            Value::Bool(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            Value::Null => query,
            Value::ArrayString(v) => query.bind(v),
            Value::ArrayUuid(v) => query.bind(v),
        };
    }
    query
}
