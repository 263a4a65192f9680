//! Query language shared by every collection driver.
//!
//! Predicates, sorts, updates and aggregations are plain data. The Postgres
//! driver renders them with [`sqlx::QueryBuilder`] binds; the in-memory
//! driver evaluates them with [`eval`].

pub mod eval;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, types::Json};

/// Direction for sorting results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// How a sort key compares: as text (byte order) or as a number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKind {
    Text,
    Numeric,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SortSpec {
    pub path: JsonPath,
    pub direction: SortDirection,
    pub kind: SortKind,
}

impl SortSpec {
    pub fn asc(path: impl Into<JsonPath>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Asc,
            kind: SortKind::Text,
        }
    }

    pub fn desc(path: impl Into<JsonPath>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Desc,
            kind: SortKind::Text,
        }
    }

    pub fn numeric(mut self) -> Self {
        self.kind = SortKind::Numeric;
        self
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self.kind {
            SortKind::Text => {
                push_text_expr(builder, &self.path);
                builder.push(" collate \"C\" ");
            }
            SortKind::Numeric => {
                builder.push("((");
                push_text_expr(builder, &self.path);
                builder.push(")::numeric) ");
            }
        }
        builder.push(self.direction.as_str());
    }
}

/// Everything a find needs once filter, sort, page and projection are decided.
#[derive(Clone, Debug, PartialEq)]
pub struct FindSpec {
    pub filter: Predicate,
    pub sort: Vec<SortSpec>,
    pub skip: u64,
    pub limit: Option<u64>,
    /// Storage field names to keep; `None` returns whole documents.
    pub projection: Option<Vec<String>>,
}

impl Default for FindSpec {
    fn default() -> Self {
        Self {
            filter: Predicate::True,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            projection: None,
        }
    }
}

impl FindSpec {
    pub fn new(filter: Predicate) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn sort(mut self, spec: SortSpec) -> Self {
        self.sort.push(spec);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn push_selection(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match &self.projection {
            Some(fields) if !fields.is_empty() => {
                builder.push("jsonb_build_object(");
                let mut first = true;
                for field in fields {
                    if !first {
                        builder.push(", ");
                    }
                    first = false;
                    builder.push_bind(field.clone());
                    builder.push(", ");
                    push_json_expr(builder, &JsonPath::from(field.as_str()));
                }
                builder.push(")");
            }
            _ => {
                builder.push("doc");
            }
        }
    }

    pub(crate) fn push_order_and_page(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if !self.sort.is_empty() {
            builder.push(" order by ");
            let mut first = true;
            for spec in &self.sort {
                if !first {
                    builder.push(", ");
                }
                first = false;
                spec.push_sql(builder);
            }
        }
        if let Some(limit) = self.limit {
            builder.push(" limit ");
            builder.push_bind(limit as i64);
        }
        if self.skip > 0 {
            builder.push(" offset ");
            builder.push_bind(self.skip as i64);
        }
    }
}

/// A JSON path expressed as segments compatible with Postgres' `#>` operator.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct JsonPath(Vec<String>);

impl JsonPath {
    fn parse_segmented(input: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut buffer = String::new();
        let mut chars = input.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '.' => {
                    if !buffer.is_empty() {
                        segments.push(std::mem::take(&mut buffer));
                    }
                }
                '[' => {
                    if !buffer.is_empty() {
                        segments.push(std::mem::take(&mut buffer));
                    }
                    let mut index = String::new();
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                        index.push(next);
                    }
                    if !index.is_empty() {
                        segments.push(index);
                    }
                }
                _ => buffer.push(ch),
            }
        }

        if !buffer.is_empty() {
            segments.push(buffer);
        }

        segments
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Dotted form, used as the key of projected and grouped values.
    pub fn dotted(&self) -> String {
        self.0.join(".")
    }

    /// `'{a,b}'::text[]` literal, for expressions that must repeat verbatim
    /// between select and group by.
    pub(crate) fn sql_literal(&self) -> String {
        let mut out = String::from("'{");
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            for ch in part.chars() {
                match ch {
                    '\'' => out.push_str("''"),
                    '"' | '\\' => {
                        out.push('\\');
                        out.push(ch);
                    }
                    _ => out.push(ch),
                }
            }
            out.push('"');
        }
        out.push_str("}'::text[]");
        out
    }
}

impl From<&str> for JsonPath {
    fn from(value: &str) -> Self {
        Self(Self::parse_segmented(value))
    }
}

impl From<String> for JsonPath {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&String> for JsonPath {
    fn from(value: &String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<Vec<String>> for JsonPath {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl<'a> From<&'a [&'a str]> for JsonPath {
    fn from(value: &'a [&'a str]) -> Self {
        Self(value.iter().map(|segment| segment.to_string()).collect())
    }
}

/// JSONB predicate over document fields.
///
/// Predicates only ever combine; nothing in this crate rewrites or drops a
/// conjunct once it is part of an [`Predicate::And`].
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Predicate {
    #[default]
    True,
    Eq {
        path: JsonPath,
        value: Value,
    },
    Ne {
        path: JsonPath,
        value: Value,
    },
    Gt {
        path: JsonPath,
        value: Value,
    },
    Ge {
        path: JsonPath,
        value: Value,
    },
    Lt {
        path: JsonPath,
        value: Value,
    },
    Le {
        path: JsonPath,
        value: Value,
    },
    /// Inclusive on both ends; a missing bound is open.
    Range {
        path: JsonPath,
        low: Option<Value>,
        high: Option<Value>,
    },
    In {
        path: JsonPath,
        values: Vec<Value>,
    },
    Exists(JsonPath),
    Text {
        query: String,
        language: Option<String>,
    },
    Regex {
        path: JsonPath,
        pattern: String,
        case_insensitive: bool,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    fn to_value<T>(value: T) -> Value
    where
        T: Serialize,
    {
        serde_json::to_value(value).unwrap_or(Value::Null)
    }

    pub fn eq(path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        Self::Eq {
            path: path.into(),
            value: Self::to_value(value),
        }
    }

    pub fn ne(path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        Self::Ne {
            path: path.into(),
            value: Self::to_value(value),
        }
    }

    pub fn gt(path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        Self::Gt {
            path: path.into(),
            value: Self::to_value(value),
        }
    }

    pub fn ge(path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        Self::Ge {
            path: path.into(),
            value: Self::to_value(value),
        }
    }

    pub fn lt(path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        Self::Lt {
            path: path.into(),
            value: Self::to_value(value),
        }
    }

    pub fn le(path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        Self::Le {
            path: path.into(),
            value: Self::to_value(value),
        }
    }

    pub fn range<L, H>(path: impl Into<JsonPath>, low: Option<L>, high: Option<H>) -> Self
    where
        L: Serialize,
        H: Serialize,
    {
        Self::Range {
            path: path.into(),
            low: low.map(Self::to_value),
            high: high.map(Self::to_value),
        }
    }

    pub fn r#in<I, V>(path: impl Into<JsonPath>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        Self::In {
            path: path.into(),
            values: values.into_iter().map(Self::to_value).collect(),
        }
    }

    pub fn exists(path: impl Into<JsonPath>) -> Self {
        Self::Exists(path.into())
    }

    pub fn text(query: impl Into<String>) -> Self {
        Self::Text {
            query: query.into(),
            language: None,
        }
    }

    pub fn text_lang(query: impl Into<String>, language: impl Into<String>) -> Self {
        Self::Text {
            query: query.into(),
            language: Some(language.into()),
        }
    }

    pub fn regex(path: impl Into<JsonPath>, pattern: impl Into<String>) -> Self {
        Self::Regex {
            path: path.into(),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    pub fn iregex(path: impl Into<JsonPath>, pattern: impl Into<String>) -> Self {
        Self::Regex {
            path: path.into(),
            pattern: pattern.into(),
            case_insensitive: true,
        }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or(predicates)
    }

    /// `self AND other`, keeping both sides as distinct conjuncts.
    pub fn and_also(self, other: Predicate) -> Self {
        Self::And(vec![self, other])
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Predicate::True => {
                builder.push("true");
            }
            Predicate::Eq { path, value } => {
                builder.push("(");
                push_json_expr(builder, path);
                builder.push(" = ");
                builder.push_bind(Json(value.clone()));
                builder.push(")");
            }
            Predicate::Ne { path, value } => {
                builder.push("(");
                push_json_expr(builder, path);
                builder.push(" is distinct from ");
                builder.push_bind(Json(value.clone()));
                builder.push(")");
            }
            Predicate::Gt { path, value } => push_cmp(builder, path, value, ">"),
            Predicate::Ge { path, value } => push_cmp(builder, path, value, ">="),
            Predicate::Lt { path, value } => push_cmp(builder, path, value, "<"),
            Predicate::Le { path, value } => push_cmp(builder, path, value, "<="),
            Predicate::Range { path, low, high } => match (low, high) {
                (None, None) => {
                    builder.push("true");
                }
                (Some(low), None) => push_cmp(builder, path, low, ">="),
                (None, Some(high)) => push_cmp(builder, path, high, "<="),
                (Some(low), Some(high)) => {
                    builder.push("(");
                    push_cmp(builder, path, low, ">=");
                    builder.push(" and ");
                    push_cmp(builder, path, high, "<=");
                    builder.push(")");
                }
            },
            Predicate::In { path, values } => {
                if values.is_empty() {
                    builder.push("false");
                } else {
                    builder.push("(");
                    push_json_expr(builder, path);
                    builder.push(" in (");
                    let mut separated = builder.separated(", ");
                    for value in values {
                        separated.push_bind(Json(value.clone()));
                    }
                    builder.push(")");
                    builder.push(")");
                }
            }
            Predicate::Exists(path) => {
                builder.push("(");
                push_json_expr(builder, path);
                builder.push(" is not null)");
            }
            Predicate::Text { query, language } => {
                builder.push("(");
                if let Some(lang) = language {
                    builder.push("jsonb_to_tsvector(");
                    builder.push_bind(lang.clone());
                    builder.push("::regconfig, doc, '[\"string\"]') @@ plainto_tsquery(");
                    builder.push_bind(lang.clone());
                    builder.push("::regconfig, ");
                    builder.push_bind(query.clone());
                    builder.push(")");
                } else {
                    builder.push("search @@ plainto_tsquery('english', ");
                    builder.push_bind(query.clone());
                    builder.push(")");
                }
                builder.push(")");
            }
            Predicate::Regex {
                path,
                pattern,
                case_insensitive,
            } => {
                builder.push("(");
                push_text_expr(builder, path);
                builder.push(if *case_insensitive { " ~* " } else { " ~ " });
                builder.push_bind(pattern.clone());
                builder.push(")");
            }
            Predicate::Not(inner) => {
                builder.push("not coalesce(");
                inner.push_sql(builder);
                builder.push(", false)");
            }
            Predicate::And(predicates) => push_joined(builder, predicates, " and ", "true"),
            Predicate::Or(predicates) => push_joined(builder, predicates, " or ", "false"),
        }
    }
}

fn push_joined(
    builder: &mut QueryBuilder<'_, Postgres>,
    predicates: &[Predicate],
    joiner: &str,
    empty: &str,
) {
    if predicates.is_empty() {
        builder.push(empty);
        return;
    }
    builder.push("(");
    let mut iter = predicates.iter();
    if let Some(first) = iter.next() {
        first.push_sql(builder);
    }
    for predicate in iter {
        builder.push(joiner);
        predicate.push_sql(builder);
    }
    builder.push(")");
}

fn push_cmp(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath, value: &Value, op: &str) {
    match value {
        Value::Number(n) => {
            builder.push("((");
            push_text_expr(builder, path);
            builder.push(")::numeric ");
            builder.push(op);
            builder.push(" ");
            builder.push_bind(n.as_f64().unwrap_or_default());
            builder.push(")");
        }
        Value::String(s) => {
            builder.push("(");
            push_text_expr(builder, path);
            builder.push(" collate \"C\" ");
            builder.push(op);
            builder.push(" ");
            builder.push_bind(s.clone());
            builder.push(")");
        }
        other => {
            builder.push("(");
            push_json_expr(builder, path);
            builder.push(" ");
            builder.push(op);
            builder.push(" ");
            builder.push_bind(Json(other.clone()));
            builder.push(")");
        }
    }
}

/// Field-level mutation applied by update operations.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOp {
    Set { path: JsonPath, value: Value },
    Unset { path: JsonPath },
    Inc { path: JsonPath, by: f64 },
    Push { path: JsonPath, value: Value },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        self.ops.push(UpdateOp::Set {
            path: path.into(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    pub fn unset(mut self, path: impl Into<JsonPath>) -> Self {
        self.ops.push(UpdateOp::Unset { path: path.into() });
        self
    }

    pub fn inc(mut self, path: impl Into<JsonPath>, by: f64) -> Self {
        self.ops.push(UpdateOp::Inc {
            path: path.into(),
            by,
        });
        self
    }

    pub fn push(mut self, path: impl Into<JsonPath>, value: impl Serialize) -> Self {
        self.ops.push(UpdateOp::Push {
            path: path.into(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Render the new `doc` value as nested jsonb functions over `doc`.
    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        for op in self.ops.iter().rev() {
            match op {
                UpdateOp::Unset { .. } => builder.push("("),
                _ => builder.push("jsonb_set("),
            };
        }
        builder.push("doc");
        for op in &self.ops {
            match op {
                UpdateOp::Set { path, value } => {
                    builder.push(", ");
                    builder.push_bind(path.parts().to_vec());
                    builder.push(", ");
                    builder.push_bind(Json(value.clone()));
                    builder.push(", true)");
                }
                UpdateOp::Unset { path } => {
                    builder.push(" #- ");
                    builder.push_bind(path.parts().to_vec());
                    builder.push(")");
                }
                UpdateOp::Inc { path, by } => {
                    builder.push(", ");
                    builder.push_bind(path.parts().to_vec());
                    builder.push(", to_jsonb(coalesce((");
                    push_text_expr(builder, path);
                    builder.push(")::numeric, 0) + ");
                    builder.push_bind(*by);
                    builder.push("), true)");
                }
                UpdateOp::Push { path, value } => {
                    builder.push(", ");
                    builder.push_bind(path.parts().to_vec());
                    builder.push(", coalesce(");
                    push_json_expr(builder, path);
                    builder.push(", '[]'::jsonb) || jsonb_build_array(");
                    builder.push_bind(Json(value.clone()));
                    builder.push("), true)");
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AggregateSpec {
    Count { alias: String },
    Sum { path: JsonPath, alias: String },
    Avg { path: JsonPath, alias: String },
    Min { path: JsonPath, alias: String },
    Max { path: JsonPath, alias: String },
}

impl AggregateSpec {
    pub fn alias(&self) -> &str {
        match self {
            AggregateSpec::Count { alias }
            | AggregateSpec::Sum { alias, .. }
            | AggregateSpec::Avg { alias, .. }
            | AggregateSpec::Min { alias, .. }
            | AggregateSpec::Max { alias, .. } => alias,
        }
    }

    fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        let (func, path) = match self {
            AggregateSpec::Count { .. } => {
                builder.push("count(*)");
                return;
            }
            AggregateSpec::Sum { path, .. } => ("sum", path),
            AggregateSpec::Avg { path, .. } => ("avg", path),
            AggregateSpec::Min { path, .. } => ("min", path),
            AggregateSpec::Max { path, .. } => ("max", path),
        };
        builder.push(func);
        builder.push("((doc #>> ");
        builder.push(path.sql_literal());
        builder.push(")::numeric)");
    }
}

/// Grouped aggregation. Each output document carries the group values under
/// their dotted paths plus one entry per aggregate alias.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregation {
    pub filter: Predicate,
    pub group_by: Vec<JsonPath>,
    pub aggregates: Vec<AggregateSpec>,
}

impl Aggregation {
    pub fn new(filter: Predicate) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn group_by(mut self, path: impl Into<JsonPath>) -> Self {
        self.group_by.push(path.into());
        self
    }

    pub fn count(mut self, alias: &str) -> Self {
        self.aggregates.push(AggregateSpec::Count {
            alias: alias.into(),
        });
        self
    }

    pub fn sum(mut self, path: impl Into<JsonPath>, alias: &str) -> Self {
        self.aggregates.push(AggregateSpec::Sum {
            path: path.into(),
            alias: alias.into(),
        });
        self
    }

    pub fn avg(mut self, path: impl Into<JsonPath>, alias: &str) -> Self {
        self.aggregates.push(AggregateSpec::Avg {
            path: path.into(),
            alias: alias.into(),
        });
        self
    }

    pub fn min(mut self, path: impl Into<JsonPath>, alias: &str) -> Self {
        self.aggregates.push(AggregateSpec::Min {
            path: path.into(),
            alias: alias.into(),
        });
        self
    }

    pub fn max(mut self, path: impl Into<JsonPath>, alias: &str) -> Self {
        self.aggregates.push(AggregateSpec::Max {
            path: path.into(),
            alias: alias.into(),
        });
        self
    }

    pub(crate) fn push_selection(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        builder.push("jsonb_build_object(");
        let mut first = true;
        for path in &self.group_by {
            if !first {
                builder.push(", ");
            }
            first = false;
            builder.push_bind(path.dotted());
            builder.push(", doc #> ");
            builder.push(path.sql_literal());
        }
        for agg in &self.aggregates {
            if !first {
                builder.push(", ");
            }
            first = false;
            builder.push_bind(agg.alias().to_string());
            builder.push(", ");
            agg.push_sql(builder);
        }
        builder.push(")");
    }

    pub(crate) fn push_group_by(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if self.group_by.is_empty() {
            return;
        }
        let exprs: Vec<String> = self
            .group_by
            .iter()
            .map(|p| format!("doc #> {}", p.sql_literal()))
            .collect();
        builder.push(" group by ");
        builder.push(exprs.join(", "));
        builder.push(" order by ");
        builder.push(exprs.join(", "));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reducer {
    Count,
    Sum,
    Min,
    Max,
    Collect,
}

/// Key/value reduction: one output `{ "_id": key, "value": reduced }` per key.
#[derive(Clone, Debug, PartialEq)]
pub struct MapReduce {
    pub filter: Predicate,
    pub key: JsonPath,
    pub value: Option<JsonPath>,
    pub reducer: Reducer,
}

impl MapReduce {
    pub fn new(key: impl Into<JsonPath>, reducer: Reducer) -> Self {
        Self {
            filter: Predicate::True,
            key: key.into(),
            value: None,
            reducer,
        }
    }

    pub fn value(mut self, path: impl Into<JsonPath>) -> Self {
        self.value = Some(path.into());
        self
    }

    pub fn filter(mut self, filter: Predicate) -> Self {
        self.filter = filter;
        self
    }

    pub(crate) fn push_selection(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        let key = self.key.sql_literal();
        builder.push("jsonb_build_object('_id', doc #> ");
        builder.push(key.as_str());
        builder.push(", 'value', ");
        let value = self
            .value
            .as_ref()
            .map(|v| v.sql_literal())
            .unwrap_or_else(|| key.clone());
        match self.reducer {
            Reducer::Count => {
                builder.push("count(*)");
            }
            Reducer::Sum => {
                builder.push(format!("sum((doc #>> {value})::numeric)"));
            }
            Reducer::Min => {
                builder.push(format!("min((doc #>> {value})::numeric)"));
            }
            Reducer::Max => {
                builder.push(format!("max((doc #>> {value})::numeric)"));
            }
            Reducer::Collect => {
                builder.push(format!("jsonb_agg(doc #> {value})"));
            }
        }
        builder.push(")");
    }

    pub(crate) fn push_group_by(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        let expr = format!("doc #> {}", self.key.sql_literal());
        builder.push(" group by ");
        builder.push(expr.as_str());
        builder.push(" order by ");
        builder.push(expr);
    }
}

pub(crate) fn push_json_expr(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath) {
    builder.push("doc #> ");
    builder.push_bind(path.parts().to_vec());
}

pub(crate) fn push_text_expr(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath) {
    builder.push("doc #>> ");
    builder.push_bind(path.parts().to_vec());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(predicate: &Predicate) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("");
        predicate.push_sql(&mut builder);
        builder.sql().to_string()
    }

    #[test]
    fn json_path_parses_dots_and_indexes() {
        let path = JsonPath::from("owner.pets[2].name");
        assert_eq!(path.parts(), ["owner", "pets", "2", "name"]);
        assert_eq!(path.dotted(), "owner.pets.2.name");
    }

    #[test]
    fn path_literal_escapes_quotes() {
        let path = JsonPath::from(vec!["it's".to_string(), "a\"b".to_string()]);
        assert_eq!(path.sql_literal(), r#"'{"it''s","a\"b"}'::text[]"#);
    }

    #[test]
    fn and_renders_every_conjunct() {
        let p = Predicate::eq("status", "available").and_also(Predicate::True);
        assert_eq!(render(&p), "((doc #> $1 = $2) and true)");
    }

    #[test]
    fn empty_in_matches_nothing() {
        let p = Predicate::r#in("breedId", Vec::<String>::new());
        assert_eq!(render(&p), "false");
    }

    #[test]
    fn range_uses_inclusive_bounds() {
        let p = Predicate::range("age", Some(json!(1)), Some(json!(4)));
        assert_eq!(
            render(&p),
            "(((doc #>> $1)::numeric >= $2) and ((doc #>> $3)::numeric <= $4))"
        );
        let open = Predicate::range("createdAt", Some("2024-01-01"), None::<String>);
        assert_eq!(render(&open), "(doc #>> $1 collate \"C\" >= $2)");
    }

    #[test]
    fn update_nests_in_order() {
        let update = Update::new().set("status", "adopted").unset("hold");
        let mut builder = QueryBuilder::<Postgres>::new("");
        update.push_sql(&mut builder);
        assert_eq!(builder.sql(), "(jsonb_set(doc, $1, $2, true) #- $3)");
    }

    #[test]
    fn aggregation_repeats_group_expression_verbatim() {
        let agg = Aggregation::new(Predicate::True)
            .group_by("status")
            .count("n");
        let mut builder = QueryBuilder::<Postgres>::new("select ");
        agg.push_selection(&mut builder);
        agg.push_group_by(&mut builder);
        let sql = builder.sql().to_string();
        assert!(sql.contains(r#"doc #> '{"status"}'::text[]"#));
        assert!(sql.ends_with(r#"group by doc #> '{"status"}'::text[] order by doc #> '{"status"}'::text[]"#));
    }
}
