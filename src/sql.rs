use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{Invalidation, Minutes};
use crate::time::parse_clock;

/// How a query names the service length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurationSpec {
    /// The tenant's default duration.
    Default,
    Minutes(Minutes),
    /// Duration of a catalogue product, by id.
    Product(String),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability {
        date: NaiveDate,
        duration: DurationSpec,
    },
    SelectFirstAvailable {
        date: NaiveDate,
        duration: DurationSpec,
    },
    SelectBookable {
        date: NaiveDate,
        start: Minutes,
        duration: DurationSpec,
    },
    SelectAlternatives {
        date: NaiveDate,
        start: Minutes,
        duration: DurationSpec,
    },
    SelectOccupied {
        date: Option<NaiveDate>,
    },
    SelectContext,
    InsertCommitment {
        date: NaiveDate,
        start: Minutes,
        duration: DurationSpec,
        label: String,
    },
    DeleteCommitment {
        id: Ulid,
    },
    InvalidateCache {
        reason: Invalidation,
    },
}

/// Shape of the rows a statement returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Slots,
    Bookable,
    Alternatives,
    Occupied,
    Context,
    Inserted,
    NoRows,
}

impl Command {
    pub fn result_kind(&self) -> ResultKind {
        match self {
            Command::SelectAvailability { .. } | Command::SelectFirstAvailable { .. } => {
                ResultKind::Slots
            }
            Command::SelectBookable { .. } => ResultKind::Bookable,
            Command::SelectAlternatives { .. } => ResultKind::Alternatives,
            Command::SelectOccupied { .. } => ResultKind::Occupied,
            Command::SelectContext => ResultKind::Context,
            Command::InsertCommitment { .. } => ResultKind::Inserted,
            Command::DeleteCommitment { .. } | Command::InvalidateCache { .. } => {
                ResultKind::NoRows
            }
        }
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match &parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape of `sql` from its statement kind and target table alone.
/// Filter values are not evaluated, so unbound `$N` placeholders are fine.
pub fn result_kind(sql: &str) -> Result<ResultKind, SqlError> {
    match &parse_statement(sql)? {
        Statement::Insert(insert) => {
            let table = insert_table_name(insert)?;
            if table != "commitments" {
                return Err(SqlError::UnknownTable(table));
            }
            Ok(ResultKind::Inserted)
        }
        Statement::Delete(_) => Ok(ResultKind::NoRows),
        Statement::Query(query) => {
            let table = select_table_name(query)?;
            match table.as_str() {
                "availability" | "first_available" => Ok(ResultKind::Slots),
                "bookable" => Ok(ResultKind::Bookable),
                "alternatives" => Ok(ResultKind::Alternatives),
                "occupied" => Ok(ResultKind::Occupied),
                "context" => Ok(ResultKind::Context),
                _ => Err(SqlError::UnknownTable(table)),
            }
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "commitments" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    // Named columns when given, else (date, start, duration, label).
    let columns: Vec<String> = if insert.columns.is_empty() {
        ["date", "start", "duration", "label"]
            .iter()
            .take(values.len())
            .map(|c| c.to_string())
            .collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("commitments", columns.len(), values.len()));
    }
    let mut filters = Filters::default();
    for (col, expr) in columns.iter().zip(values) {
        filters.set(col, expr)?;
    }
    let label = match filters.take("label") {
        Some(expr) => parse_string_or_null(expr)?.unwrap_or_default(),
        None => String::new(),
    };

    let command = Command::InsertCommitment {
        date: filters.required_date()?,
        start: filters.required_start()?,
        duration: filters.duration()?,
        label,
    };
    filters.finish()?;
    Ok(command)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        filters.collect(selection)?;
    }

    let command = match table.as_str() {
        "commitments" => {
            let expr = filters.take("id").ok_or(SqlError::MissingFilter("id"))?;
            Command::DeleteCommitment {
                id: parse_ulid_expr(expr)?,
            }
        }
        "cache" => {
            let reason = match filters.take("reason") {
                None => Invalidation::BookingCreated,
                Some(expr) => match parse_string(expr)?.to_lowercase().as_str() {
                    "config" => Invalidation::ConfigChanged,
                    "booking" => Invalidation::BookingCreated,
                    other => return Err(SqlError::Parse(format!("unknown reason: {other}"))),
                },
            };
            Command::InvalidateCache { reason }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(command)
}

fn select_of(query: &ast::Query) -> Result<&ast::Select, SqlError> {
    match query.body.as_ref() {
        SetExpr::Select(s) => Ok(s),
        _ => Err(SqlError::Unsupported("non-SELECT query".into())),
    }
}

fn select_table_name(query: &ast::Query) -> Result<String, SqlError> {
    let select = select_of(query)?;
    match select.from.first() {
        Some(from) => table_factor_name(&from.relation),
        None => Err(SqlError::Parse("SELECT without FROM".into())),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let table = select_table_name(query)?;
    let mut filters = Filters::default();
    if let Some(selection) = &select_of(query)?.selection {
        filters.collect(selection)?;
    }

    let command = match table.as_str() {
        "availability" => Command::SelectAvailability {
            date: filters.required_date()?,
            duration: filters.duration()?,
        },
        "first_available" => Command::SelectFirstAvailable {
            date: filters.required_date()?,
            duration: filters.duration()?,
        },
        "bookable" => Command::SelectBookable {
            date: filters.required_date()?,
            start: filters.required_start()?,
            duration: filters.duration()?,
        },
        "alternatives" => Command::SelectAlternatives {
            date: filters.required_date()?,
            start: filters.required_start()?,
            duration: filters.duration()?,
        },
        "occupied" => Command::SelectOccupied {
            date: filters.take("date").map(parse_date_expr).transpose()?,
        },
        "context" => Command::SelectContext,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(command)
}

/// `column = value` pairs pulled out of a conjunction or an INSERT row.
#[derive(Default)]
struct Filters<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => match expr_column_name(left) {
                Some(col) => self.set(&col, right),
                None => Err(SqlError::Unsupported(format!("filter {expr}"))),
            },
            Expr::Nested(inner) => self.collect(inner),
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn set(&mut self, col: &str, expr: &'a Expr) -> Result<(), SqlError> {
        if self.pairs.iter().any(|(c, _)| c == col) {
            return Err(SqlError::Parse(format!("duplicate column: {col}")));
        }
        self.pairs.push((col.to_string(), expr));
        Ok(())
    }

    fn take(&mut self, col: &str) -> Option<&'a Expr> {
        let pos = self.pairs.iter().position(|(c, _)| c == col)?;
        Some(self.pairs.remove(pos).1)
    }

    fn required_date(&mut self) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.take("date").ok_or(SqlError::MissingFilter("date"))?)
    }

    fn required_start(&mut self) -> Result<Minutes, SqlError> {
        parse_clock_expr(self.take("start").ok_or(SqlError::MissingFilter("start"))?)
    }

    /// Every filter must have been consumed by the command.
    fn finish(self) -> Result<(), SqlError> {
        match self.pairs.into_iter().next() {
            Some((col, _)) => Err(SqlError::UnknownColumn(col)),
            None => Ok(()),
        }
    }

    /// `duration = N` or `product = 'id'`, never both.
    fn duration(&mut self) -> Result<DurationSpec, SqlError> {
        let minutes = self.take("duration");
        let product = self.take("product");
        match (minutes, product) {
            (Some(_), Some(_)) => Err(SqlError::Parse(
                "duration and product are mutually exclusive".into(),
            )),
            (Some(expr), None) => Ok(parse_i64_or_null(expr)?
                .map(DurationSpec::Minutes)
                .unwrap_or(DurationSpec::Default)),
            (None, Some(expr)) => Ok(parse_string_or_null(expr)?
                .map(DurationSpec::Product)
                .unwrap_or(DurationSpec::Default)),
            (None, None) => Ok(DurationSpec::Default),
        }
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
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_clock_expr(expr: &Expr) -> Result<Minutes, SqlError> {
    let s = parse_string(expr)?;
    parse_clock(&s).ok_or_else(|| SqlError::Parse(format!("bad time '{s}', expected HH:MM")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64_expr(expr).map(Some),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[test]
    fn parse_availability_default_duration() {
        let cmd = parse_sql("SELECT * FROM availability WHERE date = '2026-10-19'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectAvailability {
                date: date(19),
                duration: DurationSpec::Default,
            }
        );
    }

    #[test]
    fn parse_availability_with_duration_or_product() {
        let cmd = parse_sql(
            "SELECT * FROM availability WHERE date = '2026-10-19' AND duration = 45",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectAvailability {
                date: date(19),
                duration: DurationSpec::Minutes(45),
            }
        );

        let cmd = parse_sql(
            "SELECT * FROM first_available WHERE product = 'corte' AND date = '2026-10-20'",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectFirstAvailable {
                date: date(20),
                duration: DurationSpec::Product("corte".into()),
            }
        );
    }

    #[test]
    fn duration_and_product_conflict() {
        let err = parse_sql(
            "SELECT * FROM availability WHERE date = '2026-10-19' AND duration = 30 AND product = 'x'",
        )
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn parse_bookable_and_alternatives() {
        let cmd = parse_sql(
            "SELECT * FROM bookable WHERE date = '2026-10-19' AND start = '10:30' AND duration = 60",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookable {
                date: date(19),
                start: 630,
                duration: DurationSpec::Minutes(60),
            }
        );

        let cmd =
            parse_sql("SELECT * FROM alternatives WHERE (date = '2026-10-19' AND start = '9:00')")
                .unwrap();
        assert_eq!(
            cmd,
            Command::SelectAlternatives {
                date: date(19),
                start: 540,
                duration: DurationSpec::Default,
            }
        );
    }

    #[test]
    fn bookable_requires_start() {
        let err = parse_sql("SELECT * FROM bookable WHERE date = '2026-10-19'").unwrap_err();
        assert!(matches!(err, SqlError::MissingFilter("start")));
    }

    #[test]
    fn parse_occupied_and_context() {
        assert_eq!(
            parse_sql("SELECT * FROM occupied").unwrap(),
            Command::SelectOccupied { date: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM occupied WHERE date = '2026-10-21'").unwrap(),
            Command::SelectOccupied {
                date: Some(date(21))
            }
        );
        assert_eq!(parse_sql("SELECT * FROM context").unwrap(), Command::SelectContext);
    }

    #[test]
    fn parse_insert_commitment_named_columns() {
        let sql = "INSERT INTO commitments (label, date, start, duration) VALUES ('Ana', '2026-10-19', '10:00', 45)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertCommitment {
                date: date(19),
                start: 600,
                duration: DurationSpec::Minutes(45),
                label: "Ana".into(),
            }
        );
    }

    #[test]
    fn parse_insert_commitment_positional_with_product() {
        let sql = "INSERT INTO commitments (date, start, product, label) VALUES ('2026-10-19', '14:00', 'corte', NULL)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertCommitment {
                date: date(19),
                start: 840,
                duration: DurationSpec::Product("corte".into()),
                label: String::new(),
            }
        );

        let sql = "INSERT INTO commitments VALUES ('2026-10-19', '14:00')";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::InsertCommitment {
                duration: DurationSpec::Default,
                ..
            }
        ));
    }

    #[test]
    fn insert_arity_mismatch() {
        let sql = "INSERT INTO commitments (date, start) VALUES ('2026-10-19', '14:00', 30)";
        assert!(matches!(
            parse_sql(sql).unwrap_err(),
            SqlError::WrongArity("commitments", 2, 3)
        ));
    }

    #[test]
    fn parse_delete_commitment() {
        let cmd = parse_sql("DELETE FROM commitments WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'")
            .unwrap();
        match cmd {
            Command::DeleteCommitment { id } => {
                assert_eq!(id.to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
            }
            _ => panic!("expected DeleteCommitment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_cache_invalidation() {
        assert_eq!(
            parse_sql("DELETE FROM cache").unwrap(),
            Command::InvalidateCache {
                reason: Invalidation::BookingCreated
            }
        );
        assert_eq!(
            parse_sql("DELETE FROM cache WHERE reason = 'config'").unwrap(),
            Command::InvalidateCache {
                reason: Invalidation::ConfigChanged
            }
        );
        assert!(parse_sql("DELETE FROM cache WHERE reason = 'weather'").is_err());
    }

    #[test]
    fn bad_values_rejected() {
        assert!(parse_sql("SELECT * FROM availability WHERE date = '19/10/2026'").is_err());
        assert!(
            parse_sql("SELECT * FROM bookable WHERE date = '2026-10-19' AND start = '25:00'")
                .is_err()
        );
        assert!(parse_sql("DELETE FROM commitments WHERE id = 'nope'").is_err());
    }

    #[test]
    fn unknown_table_and_statement() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings").unwrap_err(),
            SqlError::UnknownTable(t) if t == "bookings"
        ));
        assert!(matches!(
            parse_sql("CREATE TABLE x (a INT)").unwrap_err(),
            SqlError::Unsupported(_)
        ));
    }

    #[test]
    fn unknown_filter_columns_rejected() {
        assert!(matches!(
            parse_sql("SELECT * FROM availability WHERE date = '2026-10-19' AND staff = 'rita'")
                .unwrap_err(),
            SqlError::UnknownColumn(c) if c == "staff"
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM context WHERE date = '2026-10-19'").unwrap_err(),
            SqlError::UnknownColumn(c) if c == "date"
        ));
        assert!(matches!(
            parse_sql("DELETE FROM cache WHERE tenant = 'salon'").unwrap_err(),
            SqlError::UnknownColumn(c) if c == "tenant"
        ));
        let sql = "INSERT INTO commitments (date, start, phone) VALUES ('2026-10-19', '14:00', '91')";
        assert!(matches!(
            parse_sql(sql).unwrap_err(),
            SqlError::UnknownColumn(c) if c == "phone"
        ));
    }

    #[test]
    fn result_kind_comes_from_target_table() {
        assert_eq!(
            result_kind("SELECT * FROM bookable WHERE date = $1 AND start = $2").unwrap(),
            ResultKind::Bookable
        );
        assert_eq!(
            result_kind("SELECT * FROM occupied WHERE date = $1 AND product = 'availability'")
                .unwrap(),
            ResultKind::Occupied
        );
        assert_eq!(
            result_kind("INSERT INTO commitments VALUES ($1, $2)").unwrap(),
            ResultKind::Inserted
        );
        assert_eq!(result_kind("DELETE FROM cache").unwrap(), ResultKind::NoRows);
        assert!(result_kind("SELECT * FROM bookings").is_err());

        let cmd = parse_sql("SELECT * FROM first_available WHERE date = '2026-10-19'").unwrap();
        assert_eq!(cmd.result_kind(), ResultKind::Slots);
    }

    #[test]
    fn unsupported_filter_operator() {
        assert!(matches!(
            parse_sql("SELECT * FROM occupied WHERE date >= '2026-10-19'").unwrap_err(),
            SqlError::Unsupported(_)
        ));
    }
}
