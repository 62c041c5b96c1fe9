use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::tz;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfile {
        id: Ulid,
        name: String,
        timezone: Option<String>,
    },
    UpdateProfile {
        id: Ulid,
        patch: ProfilePatch,
    },
    InsertEvent {
        id: Ulid,
        draft: EventDraft,
    },
    UpdateEvent {
        id: Ulid,
        patch: EventPatch,
    },
    SelectProfiles,
    /// `timezone` is the display zone for the result, not a filter.
    SelectEvents {
        id: Option<Ulid>,
        profile_id: Option<Ulid>,
        timezone: Option<String>,
    },
    SelectEventLogs {
        event_id: Ulid,
        timezone: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const PROFILE_COLUMNS: &[&str] = &["id", "name", "timezone"];
const EVENT_COLUMNS: &[&str] = &["id", "timezone", "start", "end", "profiles"];

/// Pairs each value with its column. Without a column list the table's
/// default column order applies.
fn bind_columns<'a>(
    table: &'static str,
    defaults: &[&str],
    insert: &ast::Insert,
    values: &'a [Expr],
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    for column in &columns {
        if !defaults.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column.clone()));
        }
    }
    Ok(columns.into_iter().zip(values.iter()).collect())
}

fn column<'a>(bound: &[(String, &'a Expr)], name: &str) -> Option<&'a Expr> {
    bound.iter().find(|(c, _)| c == name).map(|(_, e)| *e)
}

fn required<'a>(bound: &[(String, &'a Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    column(bound, name).ok_or(SqlError::MissingColumn(name))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "profiles" => {
            let bound = bind_columns("profiles", PROFILE_COLUMNS, insert, &values)?;
            Ok(Command::InsertProfile {
                id: parse_ulid_expr(required(&bound, "id")?)?,
                name: parse_string_expr(required(&bound, "name")?)?,
                timezone: column(&bound, "timezone").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "events" => {
            let bound = bind_columns("events", EVENT_COLUMNS, insert, &values)?;
            Ok(Command::InsertEvent {
                id: parse_ulid_expr(required(&bound, "id")?)?,
                draft: EventDraft {
                    timezone: parse_string_expr(required(&bound, "timezone")?)?,
                    start: parse_instant_expr(required(&bound, "start")?)?,
                    end: parse_instant_expr(required(&bound, "end")?)?,
                    profiles: parse_ulid_set(required(&bound, "profiles")?)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(relation: &TableFactor, assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            _ => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.push((name, &assignment.value));
    }

    match table.as_str() {
        "profiles" => {
            let mut patch = ProfilePatch::default();
            for (name, value) in set {
                match name.as_str() {
                    "name" => patch.name = Some(parse_string_expr(value)?),
                    "timezone" => patch.timezone = Some(parse_string_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn(name)),
                }
            }
            Ok(Command::UpdateProfile { id, patch })
        }
        "events" => {
            let mut patch = EventPatch::default();
            for (name, value) in set {
                match name.as_str() {
                    "timezone" => patch.timezone = Some(parse_string_expr(value)?),
                    "start" => patch.start = Some(parse_instant_expr(value)?),
                    "end" => patch.end = Some(parse_instant_expr(value)?),
                    "profiles" => patch.profiles = Some(parse_ulid_set(value)?),
                    _ => return Err(SqlError::UnknownColumn(name)),
                }
            }
            Ok(Command::UpdateEvent { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    profile_id: Option<Ulid>,
    event_id: Option<Ulid>,
    timezone: Option<String>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "profiles" => {
            if filters.id.is_some() || filters.profile_id.is_some() || filters.event_id.is_some() {
                return Err(SqlError::Unsupported("filters on profiles".into()));
            }
            Ok(Command::SelectProfiles)
        }
        "events" => {
            if filters.event_id.is_some() {
                return Err(SqlError::UnknownColumn("event_id".into()));
            }
            Ok(Command::SelectEvents {
                id: filters.id,
                profile_id: filters.profile_id,
                timezone: filters.timezone,
            })
        }
        "event_logs" => {
            if filters.id.is_some() {
                return Err(SqlError::UnknownColumn("id".into()));
            }
            if filters.profile_id.is_some() {
                return Err(SqlError::UnknownColumn("profile_id".into()));
            }
            Ok(Command::SelectEventLogs {
                event_id: filters.event_id.ok_or(SqlError::MissingFilter("event_id"))?,
                timezone: filters.timezone,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunctions of `column = value`; anything else is rejected rather than ignored.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            match col.as_str() {
                "id" => filters.id = Some(parse_ulid_expr(right)?),
                "profile_id" => filters.profile_id = Some(parse_ulid_expr(right)?),
                "event_id" => filters.event_id = Some(parse_ulid_expr(right)?),
                "timezone" => filters.timezone = Some(parse_string_expr(right)?),
                _ => return Err(SqlError::UnknownColumn(col)),
            }
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_str(&parse_string_expr(expr)?)
}

/// `ARRAY['a', 'b']`, a comma-separated string `'a,b'`, or the text form of a
/// Postgres array `'{a,b}'`.
fn parse_ulid_set(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid_expr).collect();
    }
    let text = parse_string_expr(expr)?;
    let text = text.trim();
    let text = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')).unwrap_or(text);
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_ulid_str)
        .collect()
}

/// Unix milliseconds as a number or string, or an RFC 3339 string.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let value = parse_instant_expr(expr)?;
        return value
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("instant -{value} out of range")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) => s.parse().map_err(|e| SqlError::Parse(format!("bad instant {s}: {e}"))),
        Some(Value::SingleQuotedString(s)) => tz::parse_instant(s).map_err(|e| SqlError::Parse(e.to_string())),
        Some(value) => Err(SqlError::Parse(format!("expected instant, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_profile() {
        let cmd = parse_sql(&format!("INSERT INTO profiles (id, name) VALUES ('{A}', 'Alice')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertProfile {
                id: ulid(A),
                name: "Alice".into(),
                timezone: None,
            }
        );
    }

    #[test]
    fn parse_insert_profile_columns_any_order() {
        let sql = format!("INSERT INTO profiles (timezone, name, id) VALUES ('Asia/Tokyo', 'Kenji', '{A}')");
        match parse_sql(&sql).unwrap() {
            Command::InsertProfile { id, name, timezone } => {
                assert_eq!(id, ulid(A));
                assert_eq!(name, "Kenji");
                assert_eq!(timezone.as_deref(), Some("Asia/Tokyo"));
            }
            other => panic!("expected InsertProfile, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_profile_null_timezone() {
        let sql = format!("INSERT INTO profiles VALUES ('{A}', 'Alice', NULL)");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertProfile { timezone: None, .. }));
    }

    #[test]
    fn parse_insert_profile_missing_name() {
        let sql = format!("INSERT INTO profiles (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("name"))));
    }

    #[test]
    fn parse_insert_event_with_array() {
        let sql = format!(
            r#"INSERT INTO events (id, timezone, start, "end", profiles) VALUES ('{A}', 'UTC', 1000, 2000, ARRAY['{A}', '{B}'])"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertEvent { id, draft } => {
                assert_eq!(id, ulid(A));
                assert_eq!(draft.timezone, "UTC");
                assert_eq!(draft.start, 1000);
                assert_eq!(draft.end, 2000);
                assert_eq!(draft.profiles, vec![ulid(A), ulid(B)]);
            }
            other => panic!("expected InsertEvent, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_event_rfc3339_and_csv() {
        let sql = format!(
            r#"INSERT INTO events (id, timezone, start, "end", profiles) VALUES ('{A}', 'Asia/Tokyo', '2025-01-10T14:00:00Z', '2025-01-11T00:00:00+09:00', '{A}, {B}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertEvent { draft, .. } => {
                assert_eq!(draft.start, 1_736_517_600_000);
                assert_eq!(draft.end, 1_736_521_200_000);
                assert_eq!(draft.profiles, vec![ulid(A), ulid(B)]);
            }
            other => panic!("expected InsertEvent, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_event_pg_array_text() {
        let sql = format!(r#"INSERT INTO events VALUES ('{A}', 'UTC', '0', '10', '{{{A},{B}}}')"#);
        match parse_sql(&sql).unwrap() {
            Command::InsertEvent { draft, .. } => assert_eq!(draft.profiles, vec![ulid(A), ulid(B)]),
            other => panic!("expected InsertEvent, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_wrong_arity() {
        let sql = format!("INSERT INTO events (id, timezone) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("events", 2, 1))));
    }

    #[test]
    fn parse_update_event_partial() {
        let sql = format!(r#"UPDATE events SET "end" = 5000, profiles = ARRAY['{B}'] WHERE id = '{A}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateEvent {
                id: ulid(A),
                patch: EventPatch {
                    end: Some(5000),
                    profiles: Some(vec![ulid(B)]),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn parse_update_event_timezone_and_start() {
        let sql = format!("UPDATE events SET timezone = 'Europe/Berlin', start = '2025-01-10T15:00:00+01:00' WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateEvent { patch, .. } => {
                assert_eq!(patch.timezone.as_deref(), Some("Europe/Berlin"));
                assert_eq!(patch.start, Some(1_736_517_600_000));
                assert!(patch.end.is_none());
            }
            other => panic!("expected UpdateEvent, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_profile() {
        let sql = format!("UPDATE profiles SET name = 'Alicia' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateProfile {
                id: ulid(A),
                patch: ProfilePatch {
                    name: Some("Alicia".into()),
                    timezone: None,
                },
            }
        );
    }

    #[test]
    fn parse_update_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE events SET start = 1"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_update_unknown_column() {
        let sql = format!("UPDATE events SET title = 'x' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "title"));
    }

    #[test]
    fn parse_select_profiles() {
        assert_eq!(parse_sql("SELECT * FROM profiles").unwrap(), Command::SelectProfiles);
    }

    #[test]
    fn parse_select_events_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM events").unwrap(),
            Command::SelectEvents {
                id: None,
                profile_id: None,
                timezone: None,
            }
        );
        let sql = format!("SELECT * FROM events WHERE profile_id = '{B}' AND timezone = 'America/New_York'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectEvents {
                id: None,
                profile_id: Some(ulid(B)),
                timezone: Some("America/New_York".into()),
            }
        );
    }

    #[test]
    fn parse_select_event_logs() {
        let sql = format!("SELECT * FROM event_logs WHERE event_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectEventLogs {
                event_id: ulid(A),
                timezone: None,
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM event_logs"),
            Err(SqlError::MissingFilter("event_id"))
        ));
    }

    #[test]
    fn parse_select_event_logs_rejects_foreign_filters() {
        let sql = format!("SELECT * FROM event_logs WHERE event_id = '{A}' AND profile_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "profile_id"));
        let sql = format!("SELECT * FROM event_logs WHERE event_id = '{A}' AND id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "id"));
    }

    #[test]
    fn parse_negated_instants() {
        let sql = format!("UPDATE events SET start = -'-5' WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateEvent { patch, .. } => assert_eq!(patch.start, Some(5)),
            other => panic!("unexpected {other:?}"),
        }
        let sql = format!("UPDATE events SET start = -'-9223372036854775808' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_select_rejects_other_predicates() {
        assert!(matches!(
            parse_sql("SELECT * FROM events WHERE start > 5"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_bad_ulid() {
        assert!(matches!(
            parse_sql("INSERT INTO profiles (id, name) VALUES ('nope', 'Alice')"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(parse_sql("SELECT * FROM bookings"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(parse_sql("").is_err());
    }
}
