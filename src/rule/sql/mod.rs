//! SQL handler for rules
//!
//! Supports `SELECT <projections> [FROM <source>] [WHERE <condition>]` over a
//! JSON object payload. Projections are applied in order and later columns
//! overwrite earlier ones with the same name; null results are omitted.

mod eval;
mod lexer;
mod parser;

use std::fmt;

use serde_json::{Map, Value};

use super::MessageContext;
use eval::{truthy, Env};
use parser::{Parser, Projection, Statement};

/// Errors raised while compiling a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    Syntax(String),
    UnknownFunction(String),
    Arity {
        function: &'static str,
        given: usize,
    },
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::Syntax(msg) => write!(f, "syntax error: {}", msg),
            SqlError::UnknownFunction(name) => write!(f, "unknown function: {}", name),
            SqlError::Arity { function, given } => {
                write!(f, "wrong number of arguments to {}: {}", function, given)
            }
        }
    }
}

impl std::error::Error for SqlError {}

/// Compiled query
#[derive(Debug, Clone)]
pub struct SqlQuery {
    text: String,
    statement: Statement,
}

impl SqlQuery {
    pub fn parse(sql: &str) -> Result<Self, SqlError> {
        let tokens = lexer::tokenize(sql)?;
        let statement = Parser::new(tokens).parse_statement()?;
        Ok(Self {
            text: sql.to_string(),
            statement,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Run the query over a payload
    ///
    /// Payloads that are not a JSON object are treated as `{}`. Returns
    /// `None` when the condition filters the message out.
    pub fn apply(&self, payload: &[u8], context: &MessageContext) -> Option<Vec<u8>> {
        let message = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let output = self.evaluate(&message, context)?;
        serde_json::to_vec(&Value::Object(output)).ok()
    }

    fn evaluate(
        &self,
        message: &Map<String, Value>,
        context: &MessageContext,
    ) -> Option<Map<String, Value>> {
        let env = Env { message, context };

        if let Some(ref condition) = self.statement.condition {
            if !truthy(&env.eval(condition)) {
                return None;
            }
        }

        let mut output = Map::new();
        for projection in &self.statement.projections {
            match projection {
                Projection::Wildcard => {
                    for (key, value) in message {
                        output.insert(key.clone(), value.clone());
                    }
                }
                Projection::Column { expr, name } => {
                    let value = env.eval(expr);
                    if !value.is_null() {
                        output.insert(name.clone(), value);
                    }
                }
            }
        }
        Some(output)
    }
}

impl fmt::Display for SqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use test_case::test_case;

    fn context() -> MessageContext {
        MessageContext {
            client_id: "device_abc".into(),
            client_ip: None,
            topic: "where/test".into(),
            qos: QoS::AtLeastOnce,
        }
    }

    fn run(sql: &str, input: Value) -> Option<Value> {
        let query = SqlQuery::parse(sql).unwrap();
        let payload = serde_json::to_vec(&input).unwrap();
        query
            .apply(&payload, &context())
            .map(|out| serde_json::from_slice(&out).unwrap())
    }

    #[test]
    fn test_select_many_applies_columns_in_order() {
        let sql = "select device as `key`, `key` AS `value`, `value` as data, boolValue, * \
                   where `value` >= 10";

        let out = run(
            sql,
            json!({"device": "d1", "value": 12, "boolValue": 1, "other": "x"}),
        )
        .unwrap();
        assert_eq!(
            out,
            json!({
                "key": "d1",
                "data": 12,
                "boolValue": 1,
                "device": "d1",
                "value": 12,
                "other": "x"
            })
        );

        // `*` runs last, so the message's own key wins
        let out = run(sql, json!({"device": "d1", "key": "k9", "value": 10})).unwrap();
        assert_eq!(out["key"], json!("k9"));
        assert_eq!(out["value"], json!(10));

        assert_eq!(run(sql, json!({"device": "d1", "value": 9})), None);
    }

    #[test]
    fn test_select_functions() {
        let sql = "select `value` + 1 as `value`, doubleValue * `value` as doubleValue, \
                   ceil(doubleValue) as ceilValue, floor(doubleValue) as floorValue, \
                   mod(doubleValue, `value`) as modValue where device = 'device_abc'";

        let out = run(sql, json!({"device": "device_abc", "value": 12, "doubleValue": 25.5}))
            .unwrap();
        assert_eq!(
            out,
            json!({
                "value": 13,
                "doubleValue": 306.0,
                "ceilValue": 26,
                "floorValue": 25,
                "modValue": 1.5,
            })
        );

        assert_eq!(run(sql, json!({"device": "other", "value": 12})), None);
    }

    #[test]
    fn test_context_functions() {
        let query = SqlQuery::parse(
            "select clientid() AS device, clientip() AS data, topic() as topic, qos() as value, \
             topic(2) as level",
        )
        .unwrap();

        let out: Value =
            serde_json::from_slice(&query.apply(b"{}", &context()).unwrap()).unwrap();
        // Unknown client ip is null and therefore omitted
        assert_eq!(
            out,
            json!({"device": "device_abc", "topic": "where/test", "value": 1, "level": "test"})
        );

        let mut ctx = context();
        ctx.client_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let out: Value = serde_json::from_slice(&query.apply(b"{}", &ctx).unwrap()).unwrap();
        assert_eq!(out["data"], json!("127.0.0.1"));
    }

    #[test]
    fn test_timestamps_and_ids() {
        let before = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;

        let out = run(
            "select CURRENT_TIMESTAMP AS current, LOCALTIMESTAMP AS local, uuid() as uuid, \
             newid() as newId",
            json!({}),
        )
        .unwrap();

        let current = out["current"].as_i64().unwrap();
        let local = out["local"].as_i64().unwrap();
        assert!(current >= before && current - before < 5_000);
        assert!(local >= before && local - before < 5_000);

        let uuid = out["uuid"].as_str().unwrap();
        let new_id = out["newId"].as_str().unwrap();
        assert_eq!(uuid.len(), 36);
        assert_ne!(uuid, new_id);
    }

    fn where_message(ce: &str, cne: &str, cv1: i64, cv2: i64, cv3: &str) -> Value {
        json!({"ce": ce, "cne": cne, "cv1": cv1, "cv2": cv2, "cv3": cv3})
    }

    const WHERE_TEST1: &str = "select * where ce='eq' AND cne <> 'eq' AND \
        ((cv1 <= 10 OR cv2 > cv1 + 10) OR cv3 IN ('expectA', 'expectB'))";
    const WHERE_TEST2: &str = "select * where cv3 like 'expect%' AND abs(cv1) > 10";

    #[test_case("eq", "neq", 10, 17, "expectA", true, false; "a")]
    #[test_case("eq", "neq", 11, 22, "expectB", true, true; "b")]
    #[test_case("eq", "neq", 7, 2, "expectA", true, false; "c")]
    #[test_case("eq", "neq", 10, 22, "expectD", true, false; "d")]
    #[test_case("neq", "neq", 11, 22, "expectA", false, true; "e")]
    #[test_case("eq", "neq", 11, 21, "expectF", false, true; "f")]
    #[test_case("eq", "neq", 10, 17, "expectE", true, false; "g")]
    #[test_case("eq", "eq", 10, 22, "expectF", false, false; "h")]
    #[test_case("eq", "eq", 15, 22, "WRONG", false, false; "i")]
    fn test_where_conditions(
        ce: &str,
        cne: &str,
        cv1: i64,
        cv2: i64,
        cv3: &str,
        first: bool,
        second: bool,
    ) {
        let message = where_message(ce, cne, cv1, cv2, cv3);
        assert_eq!(run(WHERE_TEST1, message.clone()).is_some(), first);
        assert_eq!(run(WHERE_TEST2, message.clone()).is_some(), second);
        if first {
            assert_eq!(run(WHERE_TEST1, message.clone()), Some(message));
        }
    }

    #[test]
    fn test_nested_paths() {
        let sql = "select nestMsg.device AS `key`, nestMsg.`value` AS `value` \
                   where nestMsg.`value` <> 5";

        let out = run(sql, json!({"id": "x", "nestMsg": {"device": "d1", "value": 42}}));
        assert_eq!(out, Some(json!({"key": "d1", "value": 42})));

        assert_eq!(run(sql, json!({"nestMsg": {"device": "d1", "value": 5}})), None);
        assert_eq!(run(sql, json!({})), None);
    }

    #[test]
    fn test_non_json_payload_is_empty_object() {
        let query = SqlQuery::parse("select topic() as t, missing").unwrap();
        let out: Value =
            serde_json::from_slice(&query.apply(b"not json", &context()).unwrap()).unwrap();
        assert_eq!(out, json!({"t": "where/test"}));
    }

    #[test]
    fn test_default_column_names() {
        let out = run("SELECT a.b, x + 1, NOT flag FROM src", json!({"a": {"b": 1}, "x": 2}))
            .unwrap();
        assert_eq!(out, json!({"a.b": 1, "x + 1": 3, "NOT flag": true}));
    }

    #[test]
    fn test_division_and_round() {
        let out = run(
            "select a / b as q, a / c as r, a / 0 as z, round(f) as i, round(f, 1) as g",
            json!({"a": 7, "b": 2, "c": 7, "f": 2.46}),
        )
        .unwrap();
        assert_eq!(out, json!({"q": 3.5, "r": 1, "i": 2, "g": 2.5}));
    }

    #[test]
    fn test_is_null_and_not_in() {
        let sql = "select * where missing IS NULL AND present IS NOT NULL AND x NOT IN (1, 2)";
        assert!(run(sql, json!({"present": 0, "x": 3})).is_some());
        assert!(run(sql, json!({"present": 0, "x": 2})).is_none());
        assert!(run(sql, json!({"x": 3})).is_none());
    }

    #[test_case("SELECT"; "no projections")]
    #[test_case("SELECT a,"; "trailing comma")]
    #[test_case("SELECT a WHERE"; "empty condition")]
    #[test_case("SELECT foo(a)"; "unknown function")]
    #[test_case("SELECT ceil(a, b)"; "wrong arity")]
    #[test_case("SELECT a b c"; "trailing tokens")]
    #[test_case("UPDATE t"; "not a select")]
    #[test_case("SELECT a WHERE x NOT 1"; "dangling not")]
    fn test_parse_errors(sql: &str) {
        assert!(SqlQuery::parse(sql).is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SqlQuery::parse("SELECT nope(1)").unwrap_err(),
            SqlError::UnknownFunction("nope".into())
        );
        assert_eq!(
            SqlQuery::parse("SELECT mod(1)").unwrap_err(),
            SqlError::Arity {
                function: "mod",
                given: 1
            }
        );
    }

    #[test]
    fn test_integer_overflow_falls_back_to_float() {
        let overflowed = json!(-(i64::MIN as f64));
        let out = run(
            "SELECT a / b AS q, -a AS n, abs(a) AS m",
            json!({"a": i64::MIN, "b": -1}),
        )
        .unwrap();
        assert_eq!(out, json!({"q": overflowed, "n": overflowed, "m": overflowed}));

        let out = run("SELECT a % b AS r", json!({"a": i64::MIN, "b": -1})).unwrap();
        assert!(out["r"].is_number());
    }
}
