// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Headers and Argument Tables
//!
//! Broker-neutral header values plus the conversions to and from lapin's
//! `FieldTable`. Declaration arguments come from configuration as JSON values
//! and are converted with [`arguments_to_field_table`].

use crate::config::Arguments;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Headers of an outbound or inbound message.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value.
///
/// Maps to AMQP long strings, signed 64 bit integers, booleans and doubles.
/// Other AMQP types received from the broker are rendered as strings.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    Float(f64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
        }
    }
}

impl From<&AMQPValue> for HeaderValue {
    fn from(value: &AMQPValue) -> Self {
        match value {
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
            AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
            AMQPValue::Double(v) => HeaderValue::Float(*v),
            AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
            AMQPValue::LongString(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            other => HeaderValue::String(format!("{:?}", other)),
        }
    }
}

pub fn headers_to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        btree.insert(ShortString::from(key.as_str()), AMQPValue::from(value));
    }

    FieldTable::from(btree)
}

pub fn field_table_to_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), HeaderValue::from(value)))
        .collect()
}

/// Converts configuration arguments into an AMQP argument table.
pub fn arguments_to_field_table(arguments: &Arguments) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in arguments {
        btree.insert(ShortString::from(key.as_str()), json_to_amqp(value));
    }

    FieldTable::from(btree)
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                AMQPValue::LongLongInt(v)
            } else if let Some(v) = n.as_u64() {
                AMQPValue::LongLongInt(i64::try_from(v).unwrap_or(i64::MAX))
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        Value::Array(values) => {
            let values: Vec<AMQPValue> = values.iter().map(json_to_amqp).collect();
            AMQPValue::FieldArray(FieldArray::from(values))
        }
        Value::Object(map) => {
            let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
            for (key, value) in map {
                btree.insert(ShortString::from(key.as_str()), json_to_amqp(value));
            }
            AMQPValue::FieldTable(FieldTable::from(btree))
        }
    }
}
