use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input. Every command is a read of one report view.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSummary,
    SelectOccupancy {
        granularity: Granularity,
        equipment: Option<String>,
        at: Option<Ms>,
    },
    SelectMostBorrowed,
    SelectLeastBorrowed,
    SelectRunOutFrequency {
        at: Option<Ms>,
    },
    SelectRecentTransactions {
        kind: Option<FeedKind>,
    },
    SelectReport {
        at: Option<Ms>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Query(query) => parse_select(query),
        Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_) => {
            Err(SqlError::ReadOnly)
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Equality filters collected from a WHERE clause.
#[derive(Debug, Default)]
struct Filters {
    granularity: Option<Granularity>,
    equipment: Option<String>,
    kind: Option<FeedKind>,
    at: Option<Ms>,
}

impl Filters {
    fn reject(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        let present = [
            ("granularity", self.granularity.is_some()),
            ("equipment", self.equipment.is_some()),
            ("kind", self.kind.is_some()),
            ("at", self.at.is_some()),
        ];
        for (col, set) in present {
            if set && !allowed.contains(&col) {
                return Err(SqlError::UnknownColumn(format!("{table}.{col}")));
            }
        }
        Ok(())
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "summary" => {
            filters.reject("summary", &[])?;
            Ok(Command::SelectSummary)
        }
        "occupancy" | "peak_borrowing_times" => {
            filters.reject("occupancy", &["granularity", "equipment", "at"])?;
            Ok(Command::SelectOccupancy {
                granularity: filters
                    .granularity
                    .ok_or(SqlError::MissingFilter("granularity"))?,
                equipment: filters.equipment,
                at: filters.at,
            })
        }
        "most_borrowed" => {
            filters.reject("most_borrowed", &[])?;
            Ok(Command::SelectMostBorrowed)
        }
        "least_borrowed" => {
            filters.reject("least_borrowed", &[])?;
            Ok(Command::SelectLeastBorrowed)
        }
        "run_out_frequency" => {
            filters.reject("run_out_frequency", &["at"])?;
            Ok(Command::SelectRunOutFrequency { at: filters.at })
        }
        "recent_transactions" => {
            filters.reject("recent_transactions", &["kind"])?;
            Ok(Command::SelectRecentTransactions { kind: filters.kind })
        }
        "report" => {
            filters.reject("report", &["at"])?;
            Ok(Command::SelectReport { at: filters.at })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                match col.as_str() {
                    "granularity" => {
                        let raw = parse_string_expr(right)?;
                        filters.granularity = Some(
                            Granularity::parse(&raw).ok_or(SqlError::BadValue("granularity", raw))?,
                        );
                    }
                    "equipment" | "equipment_type" => {
                        filters.equipment = Some(parse_string_expr(right)?);
                    }
                    "kind" => {
                        let raw = parse_string_expr(right)?;
                        filters.kind = Some(match raw.to_lowercase().as_str() {
                            "borrow" => FeedKind::Borrow,
                            "return" => FeedKind::Return,
                            _ => return Err(SqlError::BadValue("kind", raw)),
                        });
                    }
                    "at" => filters.at = Some(parse_i64_expr(right)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    ReadOnly,
    UnknownTable(String),
    UnknownColumn(String),
    MissingFilter(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::ReadOnly => write!(f, "report views are read-only"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown filter column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(col, v) => write!(f, "bad value for {col}: {v:?}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_summary() {
        assert_eq!(parse_sql("SELECT * FROM summary").unwrap(), Command::SelectSummary);
        assert_eq!(parse_sql("select avg_borrowing_duration from SUMMARY;").unwrap(), Command::SelectSummary);
    }

    #[test]
    fn parse_occupancy_with_filters() {
        let cmd = parse_sql(
            "SELECT * FROM occupancy WHERE granularity = 'week' AND equipment = 'Yoga Mat'",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectOccupancy {
                granularity: Granularity::Week,
                equipment: Some("Yoga Mat".into()),
                at: None,
            }
        );
    }

    #[test]
    fn parse_occupancy_at_timestamp() {
        let cmd = parse_sql(
            "SELECT * FROM occupancy WHERE (granularity = 'HOUR') AND at = 1760000000000",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectOccupancy {
                granularity: Granularity::Hour,
                equipment: None,
                at: Some(1_760_000_000_000),
            }
        );
    }

    #[test]
    fn occupancy_requires_granularity() {
        let err = parse_sql("SELECT * FROM occupancy").unwrap_err();
        assert!(matches!(err, SqlError::MissingFilter("granularity")));
    }

    #[test]
    fn occupancy_rejects_unknown_granularity() {
        let err = parse_sql("SELECT * FROM occupancy WHERE granularity = 'year'").unwrap_err();
        assert!(matches!(err, SqlError::BadValue("granularity", _)));
    }

    #[test]
    fn parse_rankings() {
        assert_eq!(parse_sql("SELECT * FROM most_borrowed").unwrap(), Command::SelectMostBorrowed);
        assert_eq!(parse_sql("SELECT * FROM least_borrowed").unwrap(), Command::SelectLeastBorrowed);
        assert_eq!(
            parse_sql("SELECT * FROM run_out_frequency").unwrap(),
            Command::SelectRunOutFrequency { at: None }
        );
    }

    #[test]
    fn parse_recent_transactions_kind() {
        assert_eq!(
            parse_sql("SELECT * FROM recent_transactions WHERE kind = 'return'").unwrap(),
            Command::SelectRecentTransactions {
                kind: Some(FeedKind::Return)
            }
        );
        assert!(parse_sql("SELECT * FROM recent_transactions WHERE kind = 'lost'").is_err());
    }

    #[test]
    fn parse_report_at() {
        assert_eq!(
            parse_sql("SELECT report FROM report WHERE at = '42'").unwrap(),
            Command::SelectReport { at: Some(42) }
        );
    }

    #[test]
    fn filter_not_valid_for_view_rejected() {
        let err = parse_sql("SELECT * FROM summary WHERE equipment = 'Chess'").unwrap_err();
        assert!(matches!(err, SqlError::UnknownColumn(_)));
        let err = parse_sql("SELECT * FROM most_borrowed WHERE borrower = 'x'").unwrap_err();
        assert!(matches!(err, SqlError::UnknownColumn(_)));
    }

    #[test]
    fn range_filters_unsupported() {
        let err = parse_sql("SELECT * FROM report WHERE at > 5").unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn writes_rejected() {
        for sql in [
            "INSERT INTO summary VALUES (1, 2)",
            "DELETE FROM recent_transactions",
            "UPDATE most_borrowed SET borrow_count = 0",
        ] {
            assert!(matches!(parse_sql(sql).unwrap_err(), SqlError::ReadOnly), "{sql}");
        }
    }

    #[test]
    fn unknown_table() {
        let err = parse_sql("SELECT * FROM bookings").unwrap_err();
        assert!(matches!(err, SqlError::UnknownTable(t) if t == "bookings"));
    }

    #[test]
    fn empty_and_garbage() {
        assert!(matches!(parse_sql("").unwrap_err(), SqlError::Empty));
        assert!(matches!(parse_sql("SELEC nonsense").unwrap_err(), SqlError::Parse(_)));
    }
}
