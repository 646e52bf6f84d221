//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::{ser, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, TqError};

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = TqError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TqError::Backend(format!("Invalid job id {:?}: {}", s, e)))
    }
}

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is waiting to be claimed.
    Pending,
    /// Job has been claimed by a worker.
    Running,
    /// Job completed successfully.
    Success,
    /// The last attempt failed.
    Failed,
}

impl JobStatus {
    /// The persisted spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(TqError::Backend(format!("Unknown job status {:?}", other))),
        }
    }
}

/// A unit of work: a task name plus its arguments and lifecycle metadata.
///
/// Values handed out by a storage are copies of its authoritative record;
/// changing them has no effect until passed back through a storage method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Case-insensitive key into the task registry.
    pub func_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: Map<String, Value>,
    /// Current job status.
    pub status: JobStatus,
    /// Number of successful claims.
    pub attempts: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last claimed.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Description of the last failure.
    pub error: Option<String>,
}

impl Job {
    /// Create a new pending job with no arguments.
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            func_name: func_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            status: JobStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            heartbeat_at: None,
            error: None,
        }
    }

    /// Set the positional arguments.
    ///
    /// `args` must serialize to a JSON array; tuples, slices and vectors do.
    /// NaN and infinite floats are rejected rather than stored as null.
    pub fn with_args<A: Serialize>(mut self, args: A) -> Result<Self> {
        args.serialize(FiniteFloats)?;
        match serde_json::to_value(args)? {
            Value::Array(values) => {
                self.args = values;
                Ok(self)
            }
            other => Err(TqError::Serialization(ser::Error::custom(format!(
                "positional arguments must serialize to an array, got {}",
                json_kind(&other)
            )))),
        }
    }

    /// Set the named arguments.
    ///
    /// `kwargs` must serialize to a JSON object; maps and structs do.
    /// NaN and infinite floats are rejected rather than stored as null.
    pub fn with_kwargs<K: Serialize>(mut self, kwargs: K) -> Result<Self> {
        kwargs.serialize(FiniteFloats)?;
        match serde_json::to_value(kwargs)? {
            Value::Object(map) => {
                self.kwargs = map;
                Ok(self)
            }
            other => Err(TqError::Serialization(ser::Error::custom(format!(
                "named arguments must serialize to an object, got {}",
                json_kind(&other)
            )))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Walks a value and fails on the first NaN or infinite float.
///
/// `serde_json` silently writes those as `null`, which would change a
/// handler's arguments between enqueue and execution.
struct FiniteFloats;

fn check_finite(v: f64) -> std::result::Result<(), serde_json::Error> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(ser::Error::custom(format!(
            "non-finite float {} has no JSON representation",
            v
        )))
    }
}

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_f32(self, v: f32) -> std::result::Result<(), Self::Error> {
        check_finite(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> std::result::Result<(), Self::Error> {
        check_finite(v)
    }

    fn serialize_bool(self, _: bool) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_char(self, _: char) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_none(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(
        self,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, Self::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: ?Sized + Serialize>(
        &mut self,
        key: &T,
    ) -> std::result::Result<(), Self::Error> {
        key.serialize(FiniteFloats)
    }

    fn serialize_value<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> std::result::Result<(), Self::Error> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}
