use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const CALLBACK_PATH: &str = "/services/apexrest/ivr/addtoCallBack";
pub const GRANT_TYPE_CLIENT_CREDENTIALS: &str = "client_credentials";

/// Identifiers forwarded to the CRM callback endpoint. Values keep the JSON
/// type they arrived with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallPayload {
    pub aws_key: Value,
    #[serde(rename = "phoneNumber")]
    pub phone_number: Value,
    #[serde(rename = "tenantCode")]
    pub tenant_code: Value,
}

/// Payload fields in the order they are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredField {
    AwsKey,
    PhoneNumber,
    TenantCode,
}

impl RequiredField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwsKey => "aws_key",
            Self::PhoneNumber => "phoneNumber",
            Self::TenantCode => "tenantCode",
        }
    }
}

impl fmt::Display for RequiredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationFailure {
    pub status: String,
    pub error: String,
    #[serde(rename = "transferToAgent")]
    pub transfer_to_agent: bool,
}

impl ValidationFailure {
    pub fn missing(field: RequiredField) -> Self {
        Self {
            status: "ERROR".to_string(),
            error: format!("Missing {field}"),
            transfer_to_agent: false,
        }
    }
}

/// Bearer token as held by a token cache. Both strings are written together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: String,
    pub instance_url: String,
    pub expires_at: i64,
}

/// Client-credentials grant response. `issued_at` and `expires_in` arrive as
/// numbers or numeric strings depending on the issuer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenGrant {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub instance_url: Option<String>,
    #[serde(default)]
    pub issued_at: Option<Value>,
    #[serde(default)]
    pub expires_in: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrmBody {
    Parsed(Map<String, Value>),
    Raw(String),
    Empty,
}

/// Envelope returned for a dispatched call: the CRM body plus `httpStatus`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub body: CrmBody,
    pub http_status: u16,
}

impl ResponseEnvelope {
    pub fn into_value(self) -> Value {
        let mut out = match self.body {
            CrmBody::Parsed(map) => map,
            CrmBody::Raw(raw) => {
                let mut m = Map::new();
                m.insert("raw".to_string(), Value::String(raw));
                m
            }
            CrmBody::Empty => Map::new(),
        };
        out.insert("httpStatus".to_string(), Value::from(self.http_status));
        Value::Object(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutput {
    Rejected(ValidationFailure),
    Dispatched(ResponseEnvelope),
}

impl BridgeOutput {
    pub fn into_value(self) -> Value {
        match self {
            Self::Rejected(failure) => serde_json::json!({
                "status": failure.status,
                "error": failure.error,
                "transferToAgent": failure.transfer_to_agent,
            }),
            Self::Dispatched(envelope) => envelope.into_value(),
        }
    }
}
