//! Logical messages carried inside frames.
//!
//! Request: `{"endpoint": <int>, "method": <int>, "uuid": <int>, "body": {...}}`
//! Response: `{"endpoint": <int>, "status": <int>, "uuid": <int|string>, "body": {...}}`
//!
//! The device echoes `uuid` as a decimal string, so both forms are accepted
//! when decoding.

use std::fmt;

use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::JsonCodec;
use crate::error::{LinkError, Result};

/// Endpoint identifier. Open set; unknown ids pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(pub u8);

impl Endpoint {
    pub const DEVICE_INFO: Endpoint = Endpoint(1);
    pub const UPDATE: Endpoint = Endpoint(2);
    pub const FILESYSTEM: Endpoint = Endpoint(3);
    pub const BACKUP: Endpoint = Endpoint(4);
    pub const RESTORE: Endpoint = Endpoint(5);
    pub const FACTORY: Endpoint = Endpoint(6);
    pub const CONTACTS: Endpoint = Endpoint(7);
    pub const MESSAGES: Endpoint = Endpoint(8);
    pub const CALLLOG: Endpoint = Endpoint(9);
    pub const CALENDAR_EVENTS: Endpoint = Endpoint(10);
    pub const DEVELOPER_MODE: Endpoint = Endpoint(11);
    pub const BLUETOOTH: Endpoint = Endpoint(12);
    pub const USB_SECURITY: Endpoint = Endpoint(13);
    pub const OUTBOX: Endpoint = Endpoint(14);
    pub const REBOOT: Endpoint = Endpoint(15);
    pub const TIME_SYNC: Endpoint = Endpoint(16);

    /// Human-readable name, if the id is known.
    pub fn name(&self) -> Option<&'static str> {
        Some(match self.0 {
            1 => "deviceInfo",
            2 => "update",
            3 => "filesystem",
            4 => "backup",
            5 => "restore",
            6 => "factory",
            7 => "contacts",
            8 => "messages",
            9 => "calllog",
            10 => "calendarEvents",
            11 => "developerMode",
            12 => "bluetooth",
            13 => "usbSecurity",
            14 => "outbox",
            15 => "reboot",
            16 => "timeSync",
            _ => return None,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "endpoint({})", self.0),
        }
    }
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

impl From<Method> for u8 {
    fn from(method: Method) -> u8 {
        method as u8
    }
}

impl TryFrom<u8> for Method {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Method::Get),
            2 => Ok(Method::Post),
            3 => Ok(Method::Put),
            4 => Ok(Method::Delete),
            other => Err(format!("unknown method id {other}")),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// HTTP-style status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const CREATED: Status = Status(201);
    pub const ACCEPTED: Status = Status(202);
    pub const NO_CONTENT: Status = Status(204);
    pub const SEE_OTHER: Status = Status(303);
    pub const BAD_REQUEST: Status = Status(400);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const NOT_ACCEPTABLE: Status = Status(406);
    pub const CONFLICT: Status = Status(409);
    pub const UNPROCESSABLE_ENTITY: Status = Status(422);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const INSUFFICIENT_STORAGE: Status = Status(507);

    /// 2xx.
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// 3xx. The device answers a finished backup with 303.
    #[inline]
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.0)
    }

    /// 4xx.
    #[inline]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    /// Reason phrase for the codes this protocol uses.
    pub fn reason_phrase(&self) -> Option<&'static str> {
        Some(match self.0 {
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            303 => "See Other",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            406 => "Not Acceptable",
            409 => "Conflict",
            422 => "Unprocessable Entity",
            500 => "Internal Server Error",
            507 => "Insufficient Storage",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason_phrase() {
            Some(phrase) => write!(f, "{} {}", self.0, phrase),
            None => write!(f, "{}", self.0),
        }
    }
}

/// A logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub endpoint: Endpoint,
    pub method: Method,
    /// Correlation id, echoed by the peer.
    #[serde(deserialize_with = "deserialize_uuid")]
    pub uuid: u32,
    #[serde(default = "empty_body")]
    pub body: Value,
}

impl Request {
    /// Build a request from any serializable body.
    ///
    /// The body must serialize to a JSON object (or unit, which becomes `{}`).
    pub fn new<B: Serialize>(endpoint: Endpoint, method: Method, uuid: u32, body: &B) -> Result<Self> {
        let body = match serde_json::to_value(body)? {
            Value::Null => empty_body(),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(LinkError::Json(serde::ser::Error::custom(format!(
                    "request body must be a JSON object, got {other}"
                ))))
            }
        };
        Ok(Self {
            endpoint,
            method,
            uuid,
            body,
        })
    }

    /// Serialize to the wire payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        JsonCodec::encode(self)
    }
}

/// A logical response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub endpoint: Endpoint,
    pub status: Status,
    #[serde(deserialize_with = "deserialize_uuid")]
    pub uuid: u32,
    #[serde(default = "empty_body", deserialize_with = "deserialize_body")]
    pub body: Value,
}

impl Response {
    /// Build a response.
    pub fn new(endpoint: Endpoint, status: Status, uuid: u32, body: Value) -> Self {
        Self {
            endpoint,
            status,
            uuid,
            body,
        }
    }

    /// Parse a response from a frame payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        JsonCodec::decode(payload)
    }

    /// Decode the body into a typed structure.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body).map_err(|e| {
            LinkError::MalformedResponse(format!("{} response body: {}", self.endpoint, e))
        })
    }

    /// `reason` field of the body, when present.
    pub fn reason(&self) -> Option<String> {
        self.body
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Pass through 2xx responses, turn anything else into a `Status` error.
    pub fn require_success(self, context: &str) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(LinkError::Status {
            status: self.status,
            context: context.to_string(),
            reason: self.reason(),
        })
    }
}

fn empty_body() -> Value {
    Value::Object(Map::new())
}

fn deserialize_body<'de, D>(deserializer: D) -> std::result::Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => empty_body(),
        other => other,
    })
}

/// Accept `uuid` as a JSON number or a decimal string.
fn deserialize_uuid<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    struct UuidVisitor;

    impl<'de> Visitor<'de> for UuidVisitor {
        type Value = u32;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a u32 correlation id as number or decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<u32, E> {
            u32::try_from(v).map_err(|_| E::custom(format!("uuid {v} out of range")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<u32, E> {
            u32::try_from(v).map_err(|_| E::custom(format!("uuid {v} out of range")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<u32, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("uuid {v:?} is not a decimal number")))
        }
    }

    deserializer.deserialize_any(UuidVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new(
            Endpoint::FILESYSTEM,
            Method::Get,
            42,
            &json!({"fileName": "/sys/user/logs.txt"}),
        )
        .unwrap();

        let value: Value = serde_json::from_slice(&request.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "endpoint": 3,
                "method": 1,
                "uuid": 42,
                "body": {"fileName": "/sys/user/logs.txt"}
            })
        );
    }

    #[test]
    fn test_unit_body_becomes_empty_object() {
        let request = Request::new(Endpoint::BACKUP, Method::Post, 1, &()).unwrap();
        assert_eq!(request.body, json!({}));
    }

    #[test]
    fn test_non_object_body_rejected() {
        assert!(Request::new(Endpoint::BACKUP, Method::Post, 1, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_response_accepts_string_uuid() {
        let payload = br#"{"endpoint":3,"status":200,"uuid":"1234","body":{"rxID":1}}"#;
        let response = Response::from_payload(payload).unwrap();
        assert_eq!(response.uuid, 1234);
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.endpoint, Endpoint::FILESYSTEM);
    }

    #[test]
    fn test_response_accepts_numeric_uuid_and_missing_body() {
        let response = Response::from_payload(br#"{"endpoint":4,"status":204,"uuid":9}"#).unwrap();
        assert_eq!(response.uuid, 9);
        assert_eq!(response.body, json!({}));
    }

    #[test]
    fn test_response_null_body_is_empty_object() {
        let response =
            Response::from_payload(br#"{"endpoint":4,"status":200,"uuid":9,"body":null}"#).unwrap();
        assert_eq!(response.body, json!({}));
    }

    #[test]
    fn test_response_bad_uuid_is_malformed() {
        let result = Response::from_payload(br#"{"endpoint":4,"status":200,"uuid":"abc"}"#);
        assert!(matches!(result, Err(LinkError::MalformedResponse(_))));

        let result = Response::from_payload(b"not json");
        assert!(matches!(result, Err(LinkError::MalformedResponse(_))));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let result: std::result::Result<Request, _> =
            serde_json::from_str(r#"{"endpoint":1,"method":9,"uuid":1,"body":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_require_success_carries_reason() {
        let response = Response::new(
            Endpoint::FILESYSTEM,
            Status::BAD_REQUEST,
            5,
            json!({"reason": "Invalid request rxID: 0, chunkNo: 1"}),
        );
        let err = response.require_success("chunk fetch").unwrap_err();
        assert_eq!(err.status(), Some(Status::BAD_REQUEST));
        assert!(err.to_string().contains("Invalid request rxID"));
    }

    #[test]
    fn test_status_classes() {
        assert!(Status::OK.is_success());
        assert!(Status::NO_CONTENT.is_success());
        assert!(!Status::SEE_OTHER.is_success());
        assert!(Status::SEE_OTHER.is_redirect());
        assert!(Status::CONFLICT.is_client_error());
        assert_eq!(Status::UNPROCESSABLE_ENTITY.to_string(), "422 Unprocessable Entity");
        assert_eq!(Status(599).to_string(), "599");
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::FILESYSTEM.to_string(), "filesystem");
        assert_eq!(Endpoint(99).to_string(), "endpoint(99)");
    }
}
