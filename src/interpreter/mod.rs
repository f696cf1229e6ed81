//! Flattens a token tree into one parameterised statement with a flat,
//! re-indexed value list. A single linear pass with a global counter
//! keeps the renumbering monotonic and collision-free.

mod scanner;

use scanner::{Piece, split_sentinels};

use crate::error::TuskerError;
use crate::sql::{RawSql, SqlExpression, SqlToken, TypeSpec};
use crate::value::PrimitiveValue;

/// A wire-ready statement: positional placeholders `$1..$N` and the
/// matching flat bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub values: Vec<PrimitiveValue>,
}

/// Interpret a fragment into a single statement.
///
/// # Errors
/// `TuskerError::InvalidInput` on malformed placeholders, non-finite
/// numbers, empty identifiers, glue fragments carrying values, or
/// width-mismatched unnest tuples.
pub fn interpret(fragment: &RawSql) -> Result<Query, TuskerError> {
    let mut flattener = Flattener {
        sql: String::new(),
        values: Vec::new(),
    };
    flattener.render_raw(fragment)?;
    Ok(Query {
        sql: flattener.sql,
        values: flattener.values,
    })
}

struct Flattener {
    sql: String,
    values: Vec<PrimitiveValue>,
}

impl Flattener {
    /// Append a bind value and render its global placeholder.
    fn bind(&mut self, value: PrimitiveValue) -> Result<(), TuskerError> {
        value.ensure_finite()?;
        self.values.push(value);
        self.sql.push('$');
        self.sql.push_str(&self.values.len().to_string());
        Ok(())
    }

    fn render_expression(&mut self, expression: &SqlExpression) -> Result<(), TuskerError> {
        match expression {
            SqlExpression::Value(value) => self.bind(value.clone()),
            SqlExpression::Token(token) => self.render_token(token),
        }
    }

    fn render_raw(&mut self, raw: &RawSql) -> Result<(), TuskerError> {
        let mut used = vec![false; raw.values.len()];
        for piece in split_sentinels(&raw.sql)? {
            match piece {
                Piece::Text(text) => self.sql.push_str(text),
                Piece::Placeholder(index) => {
                    let expression = index
                        .checked_sub(1)
                        .and_then(|i| raw.values.get(i))
                        .ok_or_else(|| {
                            TuskerError::InvalidInput(format!(
                                "placeholder {index} exceeds the fragment's {} values",
                                raw.values.len()
                            ))
                        })?;
                    used[index - 1] = true;
                    self.render_expression(expression)?;
                }
            }
        }
        if let Some(unused) = used.iter().position(|u| !u) {
            return Err(TuskerError::InvalidInput(format!(
                "fragment value {} has no placeholder",
                unused + 1
            )));
        }
        Ok(())
    }

    fn render_token(&mut self, token: &SqlToken) -> Result<(), TuskerError> {
        match token {
            SqlToken::Raw(raw) => self.render_raw(raw),
            SqlToken::Identifier(names) => self.render_identifier(names),
            SqlToken::Array {
                values,
                member_type,
            } => {
                self.bind(PrimitiveValue::Array(values.clone()))?;
                self.sql.push_str("::");
                self.render_type_spec(member_type)?;
                self.sql.push_str("[]");
                Ok(())
            }
            SqlToken::Binary(data) => {
                self.bind(PrimitiveValue::Bytes(data.clone()))?;
                self.sql.push_str("::bytea");
                Ok(())
            }
            SqlToken::Json(value) => {
                let serialised = serialise_json(value)?;
                self.bind(PrimitiveValue::Text(serialised))?;
                self.sql.push_str("::json");
                Ok(())
            }
            SqlToken::JsonBinary(value) => {
                let serialised = serialise_json(value)?;
                self.bind(PrimitiveValue::Text(serialised))?;
                self.sql.push_str("::jsonb");
                Ok(())
            }
            SqlToken::List { members, glue } => self.render_list(members, glue),
            SqlToken::Unnest {
                tuples,
                column_types,
            } => self.render_unnest(tuples, column_types),
        }
    }

    fn render_identifier(&mut self, names: &[String]) -> Result<(), TuskerError> {
        if names.is_empty() {
            return Err(TuskerError::InvalidInput(
                "identifier requires at least one name".into(),
            ));
        }
        for (index, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(TuskerError::InvalidInput(
                    "identifier names must be non-empty".into(),
                ));
            }
            if index > 0 {
                self.sql.push('.');
            }
            self.sql.push('"');
            for ch in name.chars() {
                if ch == '"' {
                    self.sql.push('"');
                }
                self.sql.push(ch);
            }
            self.sql.push('"');
        }
        Ok(())
    }

    fn render_list(
        &mut self,
        members: &[SqlExpression],
        glue: &RawSql,
    ) -> Result<(), TuskerError> {
        if members.is_empty() {
            return Err(TuskerError::InvalidInput(
                "join requires at least one member".into(),
            ));
        }
        if !glue.values.is_empty() {
            return Err(TuskerError::InvalidInput(
                "join glue must be a fragment without values".into(),
            ));
        }
        for (index, member) in members.iter().enumerate() {
            if index > 0 {
                self.sql.push_str(&glue.sql);
            }
            self.render_expression(member)?;
        }
        Ok(())
    }

    fn render_unnest(
        &mut self,
        tuples: &[Vec<PrimitiveValue>],
        column_types: &[TypeSpec],
    ) -> Result<(), TuskerError> {
        if column_types.is_empty() {
            return Err(TuskerError::InvalidInput(
                "unnest requires at least one column type".into(),
            ));
        }
        for (index, tuple) in tuples.iter().enumerate() {
            if tuple.len() != column_types.len() {
                return Err(TuskerError::InvalidInput(format!(
                    "unnest tuple {} has {} members, expected {}",
                    index,
                    tuple.len(),
                    column_types.len()
                )));
            }
        }

        self.sql.push_str("unnest(");
        for (column, column_type) in column_types.iter().enumerate() {
            if column > 0 {
                self.sql.push_str(", ");
            }
            let column_values: Vec<PrimitiveValue> =
                tuples.iter().map(|tuple| tuple[column].clone()).collect();
            self.bind(PrimitiveValue::Array(column_values))?;
            self.sql.push_str("::");
            self.render_type_spec(column_type)?;
            self.sql.push_str("[]");
        }
        self.sql.push(')');
        Ok(())
    }

    fn render_type_spec(&mut self, spec: &TypeSpec) -> Result<(), TuskerError> {
        match spec {
            TypeSpec::Name(name) => {
                if name.is_empty()
                    || !name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '.'))
                {
                    return Err(TuskerError::InvalidInput(format!(
                        "invalid type name {name:?}"
                    )));
                }
                self.sql.push_str(name);
                Ok(())
            }
            TypeSpec::Fragment(fragment) => self.render_raw(fragment),
        }
    }
}

fn serialise_json(value: &serde_json::Value) -> Result<String, TuskerError> {
    // Map keys are BTreeMap-backed, so output key order is stable.
    serde_json::to_string(value)
        .map_err(|e| TuskerError::InvalidInput(format!("JSON value cannot be serialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql;

    #[test]
    fn flattens_primitives_and_identifiers() {
        let frag = sql::tagged(
            &["SELECT ", ", ", ", ", ""],
            vec![1.into(), "a".into(), sql::identifier(["u", "id"]).into()],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, r#"SELECT $1, $2, "u"."id""#);
        assert_eq!(
            query.values,
            vec![PrimitiveValue::Int(1), PrimitiveValue::Text("a".into())]
        );
    }

    #[test]
    fn join_renumbers_across_members() {
        let a = sql::tagged(&["a=", ""], vec![1.into()]).unwrap();
        let b = sql::tagged(&["b=", ""], vec![2.into()]).unwrap();
        let glue = sql::tagged(&[" AND "], vec![]).unwrap();
        let frag = sql::tagged(
            &["", ""],
            vec![sql::join([a.into(), b.into()], glue).into()],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "a=$1 AND b=$2");
        assert_eq!(
            query.values,
            vec![PrimitiveValue::Int(1), PrimitiveValue::Int(2)]
        );
    }

    #[test]
    fn unnest_transposes_tuples_into_column_arrays() {
        let unnest = sql::unnest(
            vec![
                vec![PrimitiveValue::Int(1), PrimitiveValue::Text("x".into())],
                vec![PrimitiveValue::Int(2), PrimitiveValue::Text("y".into())],
            ],
            ["int4", "text"],
        );
        let frag = sql::tagged(&["SELECT * FROM ", ""], vec![unnest.into()]).unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "SELECT * FROM unnest($1::int4[], $2::text[])");
        assert_eq!(
            query.values,
            vec![
                PrimitiveValue::Array(vec![PrimitiveValue::Int(1), PrimitiveValue::Int(2)]),
                PrimitiveValue::Array(vec![
                    PrimitiveValue::Text("x".into()),
                    PrimitiveValue::Text("y".into())
                ]),
            ]
        );
    }

    #[test]
    fn unnest_rejects_width_mismatch() {
        let unnest = sql::unnest(
            vec![vec![PrimitiveValue::Int(1)]],
            ["int4", "text"],
        );
        let frag = sql::tagged(&["SELECT ", ""], vec![unnest.into()]).unwrap();
        assert!(matches!(
            interpret(&frag),
            Err(TuskerError::InvalidInput(_))
        ));
    }

    #[test]
    fn identifier_quoting_doubles_embedded_quotes() {
        let frag = sql::tagged(
            &["SELECT ", ""],
            vec![sql::identifier([r#"a"b"#]).into()],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, r#"SELECT "a""b""#);

        // Re-feeding the rendered form doubles again; there is no
        // magic inverse.
        let refed = sql::tagged(
            &["SELECT ", ""],
            vec![sql::identifier([r#"a""b"#]).into()],
        )
        .unwrap();
        assert_eq!(interpret(&refed).unwrap().sql, r#"SELECT "a""""b""#);
    }

    #[test]
    fn array_binds_one_parameter_with_cast() {
        let frag = sql::tagged(
            &["SELECT * FROM t WHERE id = ANY(", ")"],
            vec![sql::array(
                [PrimitiveValue::Int(1), PrimitiveValue::Int(2)],
                "int4",
            )
            .into()],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "SELECT * FROM t WHERE id = ANY($1::int4[])");
        assert_eq!(query.values.len(), 1);
    }

    #[test]
    fn json_serialises_with_stable_key_order() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        let frag =
            sql::tagged(&["SELECT ", ""], vec![sql::jsonb(value).into()]).unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "SELECT $1::jsonb");
        assert_eq!(
            query.values,
            vec![PrimitiveValue::Text(r#"{"a":{"c":3,"d":2},"b":1}"#.into())]
        );
    }

    #[test]
    fn binary_binds_bytea() {
        let frag = sql::tagged(
            &["SELECT ", ""],
            vec![sql::binary(vec![0x01, 0x02]).into()],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "SELECT $1::bytea");
        assert_eq!(
            query.values,
            vec![PrimitiveValue::Bytes(vec![0x01, 0x02])]
        );
    }

    #[test]
    fn literal_value_survives_interpretation_untouched() {
        let frag = sql::tagged(
            &["SELECT ", ", ", ""],
            vec![
                sql::literal_value("it's $tusker_1").into(),
                7.into(),
            ],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "SELECT 'it''s $tusker_1', $1");
        assert_eq!(query.values, vec![PrimitiveValue::Int(7)]);
    }

    #[test]
    fn rejects_non_finite_floats() {
        let frag = sql::tagged(&["SELECT ", ""], vec![f64::NAN.into()]).unwrap();
        assert!(matches!(
            interpret(&frag),
            Err(TuskerError::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_glue_with_values() {
        let glue = sql::tagged(&[" AND x = ", ""], vec![1.into()]).unwrap();
        let member = sql::tagged(&["a"], vec![]).unwrap();
        let frag = sql::tagged(
            &["", ""],
            vec![sql::join([member.into()], glue).into()],
        )
        .unwrap();
        // Single member never renders glue, so force two members.
        let glue2 = sql::tagged(&[" OR ", ""], vec![2.into()]).unwrap();
        let m1 = sql::tagged(&["a"], vec![]).unwrap();
        let m2 = sql::tagged(&["b"], vec![]).unwrap();
        let frag2 = sql::tagged(
            &["", ""],
            vec![sql::join([m1.into(), m2.into()], glue2).into()],
        )
        .unwrap();
        assert!(interpret(&frag).is_err());
        assert!(interpret(&frag2).is_err());
    }

    #[test]
    fn nested_fragments_renumber_globally() {
        let inner = sql::tagged(&["b = ", ""], vec![10.into()]).unwrap();
        let frag = sql::tagged(
            &["SELECT * FROM t WHERE a = ", " AND ", ""],
            vec![5.into(), inner.into()],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        assert_eq!(query.sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(
            query.values,
            vec![PrimitiveValue::Int(5), PrimitiveValue::Int(10)]
        );
    }

    #[test]
    fn every_output_placeholder_is_in_range() {
        let frag = sql::tagged(
            &["SELECT ", ", ", ", ", ""],
            vec![
                1.into(),
                sql::array([PrimitiveValue::Int(2)], "int8").into(),
                "z".into(),
            ],
        )
        .unwrap();
        let query = interpret(&frag).unwrap();
        for index in 1..=query.values.len() {
            assert!(query.sql.contains(&format!("${index}")));
        }
        for value in &query.values {
            assert!(value.ensure_finite().is_ok());
        }
    }
}
