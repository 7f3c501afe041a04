use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::ledger::BookingRecord;
use crate::model::Minutes;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRide {
        ride_id: String,
        duration_minutes: Minutes,
    },
    SelectRides,
    InsertHold {
        ride_id: String,
        date: Option<String>,
        time: Option<String>,
        ttl_minutes: Option<u32>,
    },
    /// Finalize: promote the caller's hold to a booking.
    InsertBooking {
        ride_id: String,
        date: Option<String>,
        time: Option<String>,
    },
    InsertBookingRecord {
        record: BookingRecord,
    },
    SelectAvailability {
        ride_id: String,
        date: String,
    },
    SelectSlots {
        ride_id: String,
        date: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "rides" => {
            let v = named_values(insert, "rides", &["ride_id", "duration_minutes"])?;
            let duration = parse_i64(required(&v[1], "duration_minutes")?)?;
            Ok(Command::InsertRide {
                ride_id: parse_string(required(&v[0], "ride_id")?)?,
                duration_minutes: Minutes::try_from(duration)
                    .map_err(|_| SqlError::Parse(format!("{duration} out of range")))?,
            })
        }
        "holds" => {
            let v = named_values(insert, "holds", &["ride_id", "date", "time", "ttl_minutes"])?;
            let ttl_minutes = match &v[3] {
                Some(expr) => parse_i64_or_null(expr)?
                    .map(|n| u32::try_from(n).map_err(|_| SqlError::Parse(format!("{n} out of u32 range"))))
                    .transpose()?,
                None => None,
            };
            Ok(Command::InsertHold {
                ride_id: parse_string(required(&v[0], "ride_id")?)?,
                date: optional_string(&v[1])?,
                time: optional_string(&v[2])?,
                ttl_minutes,
            })
        }
        "bookings" => {
            let v = named_values(insert, "bookings", &["ride_id", "date", "time"])?;
            Ok(Command::InsertBooking {
                ride_id: parse_string(required(&v[0], "ride_id")?)?,
                date: optional_string(&v[1])?,
                time: optional_string(&v[2])?,
            })
        }
        "booking_records" => {
            let v = named_values(insert, "booking_records", &["ride_id", "date", "time", "status"])?;
            Ok(Command::InsertBookingRecord {
                record: BookingRecord {
                    ride_id: parse_string(required(&v[0], "ride_id")?)?,
                    date: optional_string(&v[1])?,
                    time: optional_string(&v[2])?,
                    status: parse_string(required(&v[3], "status")?)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &'static str| {
        filters
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, v)| v.clone())
            .ok_or(SqlError::MissingFilter(col))
    };

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            ride_id: filter("ride_id")?,
            date: filter("date")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            ride_id: filter("ride_id")?,
            date: filter("date")?,
        }),
        "rides" => Ok(Command::SelectRides),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = 'literal'` pairs joined by AND.
fn extract_eq_filters(expr: &Expr, out: &mut Vec<(String, String)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, out)?;
                extract_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, parse_string(right)?));
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => extract_eq_filters(inner, out)?,
        _ => {}
    }
    Ok(())
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
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.len() != 1 {
                return Err(SqlError::Parse(format!(
                    "expected exactly one VALUES row, got {}",
                    values.rows.len()
                )));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Line up the VALUES row with `expected` columns. With a column list, values go
/// by name; without one, by position. Missing trailing columns are `None`.
fn named_values(
    insert: &ast::Insert,
    table: &'static str,
    expected: &[&'static str],
) -> Result<Vec<Option<Expr>>, SqlError> {
    let values = extract_insert_values(insert)?;
    let mut out: Vec<Option<Expr>> = vec![None; expected.len()];

    if insert.columns.is_empty() {
        if values.len() > expected.len() {
            return Err(SqlError::WrongArity(table, expected.len(), values.len()));
        }
        for (slot, value) in out.iter_mut().zip(values) {
            *slot = Some(value);
        }
        return Ok(out);
    }

    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
    }
    for (column, value) in insert.columns.iter().zip(values) {
        let name = column.value.to_lowercase();
        let idx = expected
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SqlError::UnknownColumn(table, name.clone()))?;
        out[idx] = Some(value);
    }
    Ok(out)
}

fn required<'a>(value: &'a Option<Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    value.as_ref().ok_or(SqlError::MissingColumn(column))
}

fn optional_string(value: &Option<Expr>) -> Result<Option<String>, SqlError> {
    match value {
        Some(expr) => parse_string_or_null(expr),
        None => Ok(None),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64(expr)?)),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing value for column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_hold() {
        let sql = r#"INSERT INTO holds (ride_id, "date", "time") VALUES ('60-1', '2025-03-14', '10:00')"#;
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertHold {
                ride_id: "60-1".into(),
                date: Some("2025-03-14".into()),
                time: Some("10:00".into()),
                ttl_minutes: None,
            }
        );
    }

    #[test]
    fn parse_insert_hold_with_ttl() {
        let sql = r#"INSERT INTO holds (ride_id, "date", "time", ttl_minutes) VALUES ('joy', '2025-03-14', '09:15', 5)"#;
        match parse_sql(sql).unwrap() {
            Command::InsertHold { ttl_minutes, .. } => assert_eq!(ttl_minutes, Some(5)),
            cmd => panic!("expected InsertHold, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_hold_columns_in_any_order() {
        let sql = r#"INSERT INTO holds ("time", ride_id, "date") VALUES ('09:15', 'joy', '2025-03-14')"#;
        match parse_sql(sql).unwrap() {
            Command::InsertHold { ride_id, date, time, .. } => {
                assert_eq!(ride_id, "joy");
                assert_eq!(date.as_deref(), Some("2025-03-14"));
                assert_eq!(time.as_deref(), Some("09:15"));
            }
            cmd => panic!("expected InsertHold, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_hold_with_null_parts() {
        let sql = r#"INSERT INTO holds (ride_id, "date", "time") VALUES ('group', NULL, NULL)"#;
        match parse_sql(sql).unwrap() {
            Command::InsertHold { date, time, .. } => {
                assert_eq!(date, None);
                assert_eq!(time, None);
            }
            cmd => panic!("expected InsertHold, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_hold_positional() {
        let sql = "INSERT INTO holds VALUES ('joy', '2025-03-14', '09:15')";
        assert!(matches!(parse_sql(sql).unwrap(), Command::InsertHold { .. }));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = r#"INSERT INTO bookings (ride_id, "date", "time") VALUES ('60-1', '2025-03-14', '10:00')"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertBooking {
                ride_id: "60-1".into(),
                date: Some("2025-03-14".into()),
                time: Some("10:00".into()),
            }
        );
    }

    #[test]
    fn parse_insert_ride() {
        let sql = "INSERT INTO rides (ride_id, duration_minutes) VALUES ('sunset', 90)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertRide {
                ride_id: "sunset".into(),
                duration_minutes: 90,
            }
        );
    }

    #[test]
    fn parse_insert_booking_record() {
        let sql = r#"INSERT INTO booking_records (ride_id, "date", "time", status) VALUES ('joy', '2025-03-14', '11:00', 'approved')"#;
        match parse_sql(sql).unwrap() {
            Command::InsertBookingRecord { record } => {
                assert_eq!(record.status, "approved");
                assert!(record.is_active());
            }
            cmd => panic!("expected InsertBookingRecord, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability() {
        let sql = r#"SELECT * FROM availability WHERE ride_id = '60-1' AND "date" = '2025-03-14'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability {
                ride_id: "60-1".into(),
                date: "2025-03-14".into(),
            }
        );
    }

    #[test]
    fn parse_select_slots() {
        let sql = r#"SELECT * FROM slots WHERE "date" = '2025-03-14' AND ride_id = 'joy'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectSlots {
                ride_id: "joy".into(),
                date: "2025-03-14".into(),
            }
        );
    }

    #[test]
    fn parse_select_rides() {
        assert_eq!(parse_sql("SELECT * FROM rides").unwrap(), Command::SelectRides);
    }

    #[test]
    fn availability_without_date_errors() {
        let sql = "SELECT * FROM availability WHERE ride_id = '60-1'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn hold_without_ride_errors() {
        let sql = r#"INSERT INTO holds ("date", "time") VALUES ('2025-03-14', '10:00')"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("ride_id"))));
    }

    #[test]
    fn unknown_column_errors() {
        let sql = "INSERT INTO rides (ride_id, colour) VALUES ('joy', 'red')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn("rides", _))));
    }

    #[test]
    fn multi_row_insert_errors() {
        let sql = r#"INSERT INTO holds (ride_id, "date", "time") VALUES ('joy', '2025-03-14', '09:00'), ('joy', '2025-03-14', '09:15')"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "INSERT INTO foobar (id) VALUES ('x')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
