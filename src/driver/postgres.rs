//! Driver adapter over tokio-postgres. Everything wire-level lives on
//! the other side of this file; the engine sees only the traits in the
//! parent module.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, RowStream};

use crate::config::{ConnectionOptions, SslMode};
use crate::type_registry::TypeRegistry;
use crate::value::PrimitiveValue;

use super::{
    CancelHandle, Driver, DriverConnection, DriverError, ExecutionResult, Field, Notice,
};

/// The bundled wire driver.
#[derive(Debug, Default)]
pub struct PgDriver;

impl PgDriver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn connect(
        &self,
        options: &ConnectionOptions,
        registry: &TypeRegistry,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        if options.ssl_mode != SslMode::Disable {
            return Err(DriverError::new(
                "this driver build connects without TLS; use sslmode=disable or supply a TLS-capable driver",
            ));
        }

        let mut config = Config::new();
        config
            .host(&options.host)
            .port(options.port)
            .user(&options.username)
            .dbname(&options.database_name);
        if let Some(password) = &options.password {
            config.password(password);
        }
        if let Some(application_name) = &options.application_name {
            config.application_name(application_name);
        }

        let (client, mut connection) = config.connect(NoTls).await.map_err(map_pg_error)?;

        // The connection task owns the socket; notices are forwarded so
        // each execute call can drain the ones it provoked.
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages =
                futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        let _ = notice_tx.send(Notice {
                            severity: notice.severity().to_string(),
                            code: Some(notice.code().code().to_string()),
                            message: notice.message().to_string(),
                        });
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        Ok(Box::new(PgDriverConnection {
            client,
            notices: notice_rx,
            registry: registry.clone(),
            cursors: HashMap::new(),
        }))
    }
}

struct PgCursor {
    stream: Pin<Box<RowStream>>,
    fields: Vec<Field>,
}

struct PgDriverConnection {
    client: Client,
    notices: mpsc::UnboundedReceiver<Notice>,
    registry: TypeRegistry,
    cursors: HashMap<String, PgCursor>,
}

impl PgDriverConnection {
    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn extract_row(
        &self,
        row: &tokio_postgres::Row,
    ) -> Result<Vec<PrimitiveValue>, DriverError> {
        let mut values = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            values.push(extract_value(&self.registry, row, index)?);
        }
        Ok(values)
    }
}

#[async_trait]
impl DriverConnection for PgDriverConnection {
    async fn execute(
        &mut self,
        sql: &str,
        values: &[PrimitiveValue],
    ) -> Result<ExecutionResult, DriverError> {
        // Leftovers belong to no statement.
        self.drain_notices();

        let statement = self.client.prepare(sql).await.map_err(map_pg_error)?;
        let fields: Vec<Field> = statement
            .columns()
            .iter()
            .map(|column| Field {
                name: column.name().to_string(),
                type_name: column.type_().name().to_string(),
            })
            .collect();

        let params = values.iter().map(|value| value as &dyn ToSql);
        let stream = self
            .client
            .query_raw(&statement, params)
            .await
            .map_err(map_pg_error)?;
        futures::pin_mut!(stream);

        let mut rows = Vec::new();
        while let Some(row) = stream.next().await {
            let row = row.map_err(map_pg_error)?;
            rows.push(self.extract_row(&row)?);
        }
        let rows_affected = stream.rows_affected().unwrap_or(rows.len() as u64);

        Ok(ExecutionResult {
            command_tag: None,
            rows_affected,
            fields,
            rows,
            notices: self.drain_notices(),
        })
    }

    async fn open_cursor(
        &mut self,
        name: &str,
        sql: &str,
        values: &[PrimitiveValue],
    ) -> Result<(), DriverError> {
        let statement = self.client.prepare(sql).await.map_err(map_pg_error)?;
        let fields: Vec<Field> = statement
            .columns()
            .iter()
            .map(|column| Field {
                name: column.name().to_string(),
                type_name: column.type_().name().to_string(),
            })
            .collect();
        let params = values.iter().map(|value| value as &dyn ToSql);
        let stream = self
            .client
            .query_raw(&statement, params)
            .await
            .map_err(map_pg_error)?;
        self.cursors.insert(
            name.to_string(),
            PgCursor {
                stream: Box::pin(stream),
                fields,
            },
        );
        Ok(())
    }

    async fn fetch_from_cursor(
        &mut self,
        name: &str,
        batch_size: usize,
    ) -> Result<ExecutionResult, DriverError> {
        let cursor = self
            .cursors
            .get_mut(name)
            .ok_or_else(|| DriverError::new(format!("no open cursor named {name}")))?;

        let mut raw_rows = Vec::new();
        while raw_rows.len() < batch_size {
            match cursor.stream.next().await {
                Some(row) => raw_rows.push(row.map_err(map_pg_error)?),
                None => break,
            }
        }
        let fields = cursor.fields.clone();
        let mut rows = Vec::with_capacity(raw_rows.len());
        for row in &raw_rows {
            rows.push(self.extract_row(row)?);
        }

        Ok(ExecutionResult {
            command_tag: None,
            rows_affected: rows.len() as u64,
            fields,
            rows,
            notices: self.drain_notices(),
        })
    }

    async fn close_cursor(&mut self, name: &str) -> Result<(), DriverError> {
        // Dropping the stream discards any rows still in flight.
        self.cursors.remove(name);
        Ok(())
    }

    async fn copy_in_binary(
        &mut self,
        sql: &str,
        column_types: &[String],
        tuples: &[Vec<PrimitiveValue>],
    ) -> Result<u64, DriverError> {
        let types = column_types
            .iter()
            .map(|name| type_from_name(name))
            .collect::<Result<Vec<_>, _>>()?;

        let sink = self
            .client
            .copy_in::<_, bytes::Bytes>(sql)
            .await
            .map_err(map_pg_error)?;
        let writer = BinaryCopyInWriter::new(sink, &types);
        futures::pin_mut!(writer);

        for (index, tuple) in tuples.iter().enumerate() {
            if tuple.len() != types.len() {
                return Err(DriverError::new(format!(
                    "copy tuple {} has {} members, expected {}",
                    index,
                    tuple.len(),
                    types.len()
                )));
            }
            let refs: Vec<&(dyn ToSql + Sync)> =
                tuple.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
            writer.as_mut().write(&refs).await.map_err(map_pg_error)?;
        }

        writer.finish().await.map_err(map_pg_error)
    }

    async fn set_session_parameters(
        &mut self,
        parameters: &[(String, String)],
    ) -> Result<(), DriverError> {
        for (name, value) in parameters {
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(DriverError::new(format!(
                    "invalid session parameter name {name:?}"
                )));
            }
            let escaped = value.replace('\'', "''");
            self.client
                .batch_execute(&format!("SET {name} = '{escaped}'"))
                .await
                .map_err(map_pg_error)?;
        }
        Ok(())
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle> {
        Box::new(PgCancelHandle {
            token: self.client.cancel_token(),
        })
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        // Dropping the client shuts the connection task down; nothing
        // further to flush.
        self.cursors.clear();
        Ok(())
    }
}

struct PgCancelHandle {
    token: tokio_postgres::CancelToken,
}

#[async_trait]
impl CancelHandle for PgCancelHandle {
    async fn cancel(&self) -> Result<(), DriverError> {
        self.token.cancel_query(NoTls).await.map_err(map_pg_error)
    }
}

fn map_pg_error(error: tokio_postgres::Error) -> DriverError {
    let sqlstate = error.code().map(|state| state.code().to_string());
    let message = error
        .as_db_error()
        .map_or_else(|| error.to_string(), |db| db.message().to_string());
    let mut mapped = DriverError::new(message).with_source(error);
    if let Some(state) = sqlstate {
        mapped = mapped.with_sqlstate(state);
    }
    mapped
}

/// Column types the COPY path knows how to spell.
fn type_from_name(name: &str) -> Result<Type, DriverError> {
    let ty = match name {
        "bool" => Type::BOOL,
        "int2" => Type::INT2,
        "int4" => Type::INT4,
        "int8" => Type::INT8,
        "float4" => Type::FLOAT4,
        "float8" => Type::FLOAT8,
        "text" => Type::TEXT,
        "varchar" => Type::VARCHAR,
        "bytea" => Type::BYTEA,
        "json" => Type::JSON,
        "jsonb" => Type::JSONB,
        "date" => Type::DATE,
        "timestamp" => Type::TIMESTAMP,
        "timestamptz" => Type::TIMESTAMPTZ,
        other => {
            return Err(DriverError::new(format!(
                "unsupported copy column type {other:?}"
            )));
        }
    };
    Ok(ty)
}

/// Reads any column's raw bytes as UTF-8 so the type registry can have
/// a go at types outside the native set (enums, domains, custom types).
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawText(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn extract_value(
    registry: &TypeRegistry,
    row: &tokio_postgres::Row,
    index: usize,
) -> Result<PrimitiveValue, DriverError> {
    let column_type = row.columns()[index].type_();
    let type_name = column_type.name();

    let value = match type_name {
        "int2" => row
            .try_get::<_, Option<i16>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, |v| PrimitiveValue::Int(i64::from(v)))),
        "int4" => row
            .try_get::<_, Option<i32>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, |v| PrimitiveValue::Int(i64::from(v)))),
        "int8" => row
            .try_get::<_, Option<i64>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, PrimitiveValue::Int)),
        "float4" => row
            .try_get::<_, Option<f32>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, |v| PrimitiveValue::Float(f64::from(v)))),
        "float8" => row
            .try_get::<_, Option<f64>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, PrimitiveValue::Float)),
        "bool" => row
            .try_get::<_, Option<bool>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, PrimitiveValue::Bool)),
        "text" | "varchar" | "bpchar" | "name" => row
            .try_get::<_, Option<String>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, PrimitiveValue::Text)),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(index)
            .map(|v| v.map_or(PrimitiveValue::Null, PrimitiveValue::Bytes)),
        "timestamptz" => row.try_get::<_, Option<DateTime<Utc>>>(index).map(|v| {
            v.map_or(PrimitiveValue::Null, |v| {
                PrimitiveValue::Text(v.to_rfc3339())
            })
        }),
        "timestamp" => row.try_get::<_, Option<NaiveDateTime>>(index).map(|v| {
            v.map_or(PrimitiveValue::Null, |v| {
                PrimitiveValue::Text(v.and_utc().to_rfc3339())
            })
        }),
        "date" => row.try_get::<_, Option<NaiveDate>>(index).map(|v| {
            v.map_or(PrimitiveValue::Null, |v| {
                PrimitiveValue::Text(v.format("%Y-%m-%d").to_string())
            })
        }),
        "json" | "jsonb" => row.try_get::<_, Option<serde_json::Value>>(index).map(|v| {
            v.map_or(PrimitiveValue::Null, |v| {
                PrimitiveValue::Text(v.to_string())
            })
        }),
        "_int2" => row
            .try_get::<_, Option<Vec<Option<i16>>>>(index)
            .map(|v| int_array_value(v.map(widen_ints))),
        "_int4" => row
            .try_get::<_, Option<Vec<Option<i32>>>>(index)
            .map(|v| int_array_value(v.map(widen_ints))),
        "_int8" => row
            .try_get::<_, Option<Vec<Option<i64>>>>(index)
            .map(int_array_value),
        "_float4" => row
            .try_get::<_, Option<Vec<Option<f32>>>>(index)
            .map(|v| {
                float_array_value(v.map(|members| {
                    members
                        .into_iter()
                        .map(|m| m.map(f64::from))
                        .collect()
                }))
            }),
        "_float8" => row
            .try_get::<_, Option<Vec<Option<f64>>>>(index)
            .map(float_array_value),
        "_bool" => row
            .try_get::<_, Option<Vec<Option<bool>>>>(index)
            .map(bool_array_value),
        "_text" | "_varchar" => row
            .try_get::<_, Option<Vec<Option<String>>>>(index)
            .map(text_array_value),
        _ => {
            // Out of the native set: hand the raw text to the registry.
            return match row.try_get::<_, Option<RawText>>(index) {
                Ok(None) => Ok(PrimitiveValue::Null),
                Ok(Some(RawText(text))) => registry
                    .parse(type_name, &text)
                    .map_err(|message| DriverError::new(format!(
                        "column {index} ({type_name}): {message}"
                    ))),
                Err(error) => Err(map_pg_error(error)),
            };
        }
    };

    value.map_err(map_pg_error)
}

fn widen_ints<T: Into<i64>>(members: Vec<Option<T>>) -> Vec<Option<i64>> {
    members.into_iter().map(|m| m.map(Into::into)).collect()
}

fn int_array_value(value: Option<Vec<Option<i64>>>) -> PrimitiveValue {
    value.map_or(PrimitiveValue::Null, |members| {
        PrimitiveValue::Array(
            members
                .into_iter()
                .map(|m| m.map_or(PrimitiveValue::Null, PrimitiveValue::Int))
                .collect(),
        )
    })
}

fn float_array_value(value: Option<Vec<Option<f64>>>) -> PrimitiveValue {
    value.map_or(PrimitiveValue::Null, |members| {
        PrimitiveValue::Array(
            members
                .into_iter()
                .map(|m| m.map_or(PrimitiveValue::Null, PrimitiveValue::Float))
                .collect(),
        )
    })
}

fn bool_array_value(value: Option<Vec<Option<bool>>>) -> PrimitiveValue {
    value.map_or(PrimitiveValue::Null, |members| {
        PrimitiveValue::Array(
            members
                .into_iter()
                .map(|m| m.map_or(PrimitiveValue::Null, PrimitiveValue::Bool))
                .collect(),
        )
    })
}

fn text_array_value(value: Option<Vec<Option<String>>>) -> PrimitiveValue {
    value.map_or(PrimitiveValue::Null, |members| {
        PrimitiveValue::Array(
            members
                .into_iter()
                .map(|m| m.map_or(PrimitiveValue::Null, PrimitiveValue::Text))
                .collect(),
        )
    })
}

impl ToSql for PrimitiveValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            PrimitiveValue::Null => Ok(IsNull::Yes),
            PrimitiveValue::Bool(value) => value.to_sql(ty, out),
            PrimitiveValue::Int(value) => {
                if *ty == Type::INT2 {
                    i16::try_from(*value)
                        .map_err(|e| Box::new(e) as Box<dyn StdError + Sync + Send>)?
                        .to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*value)
                        .map_err(|e| Box::new(e) as Box<dyn StdError + Sync + Send>)?
                        .to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    #[allow(clippy::cast_precision_loss)]
                    (*value as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    #[allow(clippy::cast_precision_loss)]
                    (*value as f64).to_sql(ty, out)
                } else {
                    value.to_sql(ty, out)
                }
            }
            PrimitiveValue::Float(value) => {
                if *ty == Type::FLOAT4 {
                    #[allow(clippy::cast_possible_truncation)]
                    (*value as f32).to_sql(ty, out)
                } else {
                    value.to_sql(ty, out)
                }
            }
            PrimitiveValue::Text(value) => {
                if *ty == Type::JSON {
                    // JSON wire format is the serialised text.
                    out.extend_from_slice(value.as_bytes());
                    Ok(IsNull::No)
                } else if *ty == Type::JSONB {
                    // jsonb is version-prefixed.
                    out.put_u8(1);
                    out.extend_from_slice(value.as_bytes());
                    Ok(IsNull::No)
                } else if *ty == Type::TIMESTAMPTZ {
                    DateTime::parse_from_rfc3339(value)?
                        .with_timezone(&Utc)
                        .to_sql(ty, out)
                } else if *ty == Type::TIMESTAMP {
                    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))?
                        .to_sql(ty, out)
                } else if *ty == Type::DATE {
                    NaiveDate::parse_from_str(value, "%Y-%m-%d")?.to_sql(ty, out)
                } else {
                    // Everything else takes the text representation;
                    // enum and domain binary formats are their labels.
                    out.extend_from_slice(value.as_bytes());
                    Ok(IsNull::No)
                }
            }
            PrimitiveValue::Bytes(value) => value.as_slice().to_sql(ty, out),
            PrimitiveValue::Array(values) => match ty.kind() {
                Kind::Array(_) => values.to_sql(ty, out),
                _ => Err(Box::new(DriverError::new(format!(
                    "array value cannot be bound to non-array type {ty}"
                )))),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Dynamically typed values; unsupported conversions surface as
        // per-value encode errors instead of a blanket type mismatch.
        true
    }

    to_sql_checked!();
}
