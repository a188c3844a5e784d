//! MySQL-protocol backend using `mysql_async`.
//!
//! Doris FE speaks the MySQL wire protocol on its query port, so this is the
//! production transport.

use crate::config::DatabaseConfig;
use crate::database::result::CellValue;
use crate::database::traits::{Backend, RawConnection, RawOutcome};
use crate::error::{DatabaseError, DbResult};
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Column, Conn, OptsBuilder, Params, Row as MysqlRow, Value};
use tracing::{debug, instrument};

/// Dials plain `mysql_async` connections; pooling happens one layer up.
#[derive(Debug, Default, Clone, Copy)]
pub struct MysqlBackend;

impl MysqlBackend {
    pub fn new() -> Self {
        Self
    }

    fn opts(config: &DatabaseConfig) -> OptsBuilder {
        let password = (!config.password.is_empty()).then(|| config.password.clone());
        let database = (!config.database.is_empty()).then(|| config.database.clone());

        OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(password)
            .db_name(database)
            .init(vec![format!("SET NAMES {}", config.charset)])
    }
}

#[async_trait]
impl Backend for MysqlBackend {
    fn name(&self) -> &'static str {
        "mysql"
    }

    #[instrument(skip(self, config), fields(endpoint = %config.endpoint()))]
    async fn dial(&self, config: &DatabaseConfig) -> DbResult<Box<dyn RawConnection>> {
        let conn = Conn::new(Self::opts(config))
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let thread_id = u64::from(conn.id());
        debug!(thread_id, "Dialed backend connection");

        Ok(Box::new(MysqlConnection {
            conn: Some(conn),
            thread_id,
            closed: false,
        }))
    }
}

/// One `mysql_async` connection.
pub struct MysqlConnection {
    conn: Option<Conn>,
    thread_id: u64,
    closed: bool,
}

impl MysqlConnection {
    async fn fetch(
        conn: &mut Conn,
        sql: &str,
        params: &[CellValue],
    ) -> mysql_async::Result<RawOutcome> {
        // Column metadata comes from the result set, so empty results keep it.
        let (columns, rows) = if params.is_empty() {
            let mut result = conn.query_iter(sql).await?;
            let columns = result.columns();
            let rows: Vec<MysqlRow> = result.collect().await?;
            result.drop_result().await?;
            (columns, rows)
        } else {
            let mut result = conn.exec_iter(sql, to_params(params)).await?;
            let columns = result.columns();
            let rows: Vec<MysqlRow> = result.collect().await?;
            result.drop_result().await?;
            (columns, rows)
        };

        Ok(into_outcome(columns.as_deref().unwrap_or_default(), &rows))
    }

    async fn execute(
        conn: &mut Conn,
        sql: &str,
        params: &[CellValue],
    ) -> mysql_async::Result<RawOutcome> {
        if params.is_empty() {
            conn.query_drop(sql).await?;
        } else {
            conn.exec_drop(sql, to_params(params)).await?;
        }
        Ok(RawOutcome::Affected(conn.affected_rows()))
    }

    fn classify(&mut self, error: mysql_async::Error) -> DatabaseError {
        match error {
            mysql_async::Error::Io(e) => {
                self.closed = true;
                debug!(thread_id = self.thread_id, "Transport failed: {}", e);
                DatabaseError::ConnectionClosed
            }
            other => DatabaseError::QueryFailed(other.to_string()),
        }
    }
}

#[async_trait]
impl RawConnection for MysqlConnection {
    fn thread_id(&self) -> Option<u64> {
        Some(self.thread_id)
    }

    fn is_closed(&self) -> bool {
        self.closed || self.conn.is_none()
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[CellValue],
        fetch_rows: bool,
    ) -> DbResult<RawOutcome> {
        if self.closed {
            return Err(DatabaseError::ConnectionClosed);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(DatabaseError::ConnectionClosed);
        };

        let outcome = if fetch_rows {
            Self::fetch(conn, sql, params).await
        } else {
            Self::execute(conn, sql, params).await
        };

        outcome.map_err(|e| self.classify(e))
    }

    async fn close(&mut self) -> DbResult<()> {
        self.closed = true;
        if let Some(conn) = self.conn.take()
            && let Err(e) = conn.disconnect().await
        {
            debug!(thread_id = self.thread_id, "Ignoring error on disconnect: {}", e);
        }
        Ok(())
    }
}

fn into_outcome(columns: &[Column], rows: &[MysqlRow]) -> RawOutcome {
    let (names, types): (Vec<String>, Vec<ColumnType>) = columns
        .iter()
        .map(|c| (c.name_str().into_owned(), c.column_type()))
        .unzip();

    let rows = rows
        .iter()
        .map(|row| {
            types
                .iter()
                .enumerate()
                .map(|(i, ty)| {
                    row.as_ref(i)
                        .map(|value| convert_value(value, *ty))
                        .unwrap_or(CellValue::Null)
                })
                .collect()
        })
        .collect();

    RawOutcome::Rows {
        columns: names,
        rows,
    }
}

fn to_params(params: &[CellValue]) -> Params {
    Params::Positional(params.iter().map(to_value).collect())
}

fn to_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::NULL,
        CellValue::Bool(b) => Value::Int(i64::from(*b)),
        CellValue::Int(n) => Value::Int(*n),
        CellValue::Float(f) => Value::Double(*f),
        CellValue::String(s) => Value::Bytes(s.as_bytes().to_vec()),
        CellValue::DateTime(dt) => {
            Value::Bytes(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string().into_bytes())
        }
        CellValue::Bytes(b) => Value::Bytes(b.clone()),
    }
}

/// The text protocol sends every value as bytes; the column type decides
/// whether it is surfaced as a number.
fn convert_value(value: &Value, column_type: ColumnType) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(n) => CellValue::Int(*n),
        Value::UInt(n) => i64::try_from(*n)
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::String(n.to_string())),
        Value::Float(f) => CellValue::Float(f64::from(*f)),
        Value::Double(f) => CellValue::Float(*f),
        Value::Bytes(bytes) => convert_bytes(bytes, column_type),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            CellValue::String(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u32::from(*hours) + days * 24;
            let mut text = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            CellValue::String(text)
        }
    }
}

fn convert_bytes(bytes: &[u8], column_type: ColumnType) -> CellValue {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return CellValue::Bytes(bytes.to_vec());
    };

    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::String(text.to_owned())),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .map(CellValue::Float)
            .unwrap_or_else(|_| CellValue::String(text.to_owned())),
        // DECIMAL stays textual to keep its precision.
        _ => CellValue::String(text.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_columns_parse_from_text() {
        let value = Value::Bytes(b"1".to_vec());
        assert_eq!(
            convert_value(&value, ColumnType::MYSQL_TYPE_LONGLONG),
            CellValue::Int(1)
        );
        assert_eq!(
            convert_value(&value, ColumnType::MYSQL_TYPE_VAR_STRING),
            CellValue::String("1".into())
        );
    }

    #[test]
    fn test_decimal_stays_textual() {
        let value = Value::Bytes(b"12.3400".to_vec());
        assert_eq!(
            convert_value(&value, ColumnType::MYSQL_TYPE_NEWDECIMAL),
            CellValue::String("12.3400".into())
        );
    }

    #[test]
    fn test_temporal_values() {
        let date = Value::Date(2024, 1, 8, 13, 5, 9, 0);
        assert_eq!(
            convert_value(&date, ColumnType::MYSQL_TYPE_DATETIME),
            CellValue::String("2024-01-08 13:05:09".into())
        );

        let time = Value::Time(true, 1, 2, 3, 4, 0);
        assert_eq!(
            convert_value(&time, ColumnType::MYSQL_TYPE_TIME),
            CellValue::String("-26:03:04".into())
        );
    }

    #[test]
    fn test_unsigned_overflow_falls_back_to_text() {
        let value = Value::UInt(u64::MAX);
        assert_eq!(
            convert_value(&value, ColumnType::MYSQL_TYPE_LONGLONG),
            CellValue::String(u64::MAX.to_string())
        );
    }

    #[test]
    fn test_empty_result_keeps_columns() {
        let columns = [
            Column::new(ColumnType::MYSQL_TYPE_LONGLONG).with_name(b"id"),
            Column::new(ColumnType::MYSQL_TYPE_VAR_STRING).with_name(b"name"),
        ];
        assert_eq!(
            into_outcome(&columns, &[]),
            RawOutcome::Rows {
                columns: vec!["id".into(), "name".into()],
                rows: vec![],
            }
        );
        assert_eq!(
            into_outcome(&[], &[]),
            RawOutcome::Rows {
                columns: vec![],
                rows: vec![],
            }
        );
    }

    #[test]
    fn test_params_conversion() {
        let params = to_params(&[CellValue::Bool(true), CellValue::from("x"), CellValue::Null]);
        match params {
            Params::Positional(values) => {
                assert_eq!(values[0], Value::Int(1));
                assert_eq!(values[1], Value::Bytes(b"x".to_vec()));
                assert_eq!(values[2], Value::NULL);
            }
            other => panic!("unexpected params: {:?}", other),
        }
    }
}
