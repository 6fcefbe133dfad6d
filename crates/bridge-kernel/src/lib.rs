use bridge_contracts::{
    CallPayload, CrmBody, RequiredField, ResponseEnvelope, TokenGrant, TokenState,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Accepted event shapes. Routed events come from the contact-flow platform
/// and carry a `Details` block; anything else is read as a flat parameter map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallEvent<'a> {
    Direct {
        params: Option<&'a Map<String, Value>>,
    },
    Routed {
        params: &'a Map<String, Value>,
        contact: Option<&'a Map<String, Value>>,
    },
}

impl<'a> CallEvent<'a> {
    pub fn classify(event: &'a Value) -> Self {
        let root = event.as_object();
        match (root, root.and_then(|r| object_field(r, "Details"))) {
            (Some(root), Some(details)) => Self::Routed {
                // Without a Parameters block the whole event is the parameter source.
                params: object_field(details, "Parameters").unwrap_or(root),
                contact: object_field(details, "ContactData"),
            },
            _ => Self::Direct { params: root },
        }
    }

    fn params(&self) -> Option<&'a Map<String, Value>> {
        match *self {
            Self::Direct { params } => params,
            Self::Routed { params, .. } => Some(params),
        }
    }

    fn fallback(&self, field: RequiredField) -> Option<&'a Value> {
        let contact = match *self {
            Self::Routed {
                contact: Some(contact),
                ..
            } => contact,
            _ => return None,
        };
        match field {
            RequiredField::AwsKey => contact.get("ContactId").filter(|v| is_truthy(v)),
            RequiredField::PhoneNumber => object_field(contact, "CustomerEndpoint")
                .and_then(|endpoint| endpoint.get("Address"))
                .filter(|v| is_truthy(v)),
            RequiredField::TenantCode => None,
        }
    }

    /// Explicit parameter when truthy, else the value derived from contact data.
    pub fn resolve(&self, field: RequiredField) -> Option<&'a Value> {
        self.params()
            .and_then(|p| p.get(field.as_str()))
            .filter(|v| is_truthy(v))
            .or_else(|| self.fallback(field))
    }
}

/// Builds the callback payload, naming the first missing field in
/// `aws_key`, `phoneNumber`, `tenantCode` order.
pub fn normalize_event(event: &Value) -> Result<CallPayload, RequiredField> {
    let shape = CallEvent::classify(event);
    let take = |field: RequiredField| shape.resolve(field).cloned().ok_or(field);
    Ok(CallPayload {
        aws_key: take(RequiredField::AwsKey)?,
        phone_number: take(RequiredField::PhoneNumber)?,
        tenant_code: take(RequiredField::TenantCode)?,
    })
}

fn object_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    map.get(key)
        .and_then(|v| v.as_object())
        .filter(|m| !m.is_empty())
}

/// JSON truthiness: `null`, `false`, zero, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

pub fn token_is_fresh(state: &TokenState, now_ms: i64, margin_ms: i64) -> bool {
    !state.access_token.is_empty() && state.expires_at.saturating_sub(now_ms) > margin_ms
}

/// Absolute expiry in epoch milliseconds: issue time (or `now_ms`) plus the
/// declared lifetime (or `default_expires_in_secs`).
pub fn grant_expiry(
    grant: &TokenGrant,
    now_ms: i64,
    default_expires_in_secs: i64,
) -> Result<i64, String> {
    let issued_ms = numeric_field(grant.issued_at.as_ref(), "issued_at")?.unwrap_or(now_ms);
    let expires_secs =
        numeric_field(grant.expires_in.as_ref(), "expires_in")?.unwrap_or(default_expires_in_secs);
    Ok(issued_ms.saturating_add(expires_secs.saturating_mul(1000)))
}

fn numeric_field(value: Option<&Value>, name: &str) -> Result<Option<i64>, String> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Bool(true)) => Ok(Some(1)),
        Some(Value::Number(n)) => {
            let v = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .ok_or_else(|| format!("{name} is out of range: {n}"))?;
            Ok(if v == 0 { None } else { Some(v) })
        }
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("{name} is not an integer: {s:?}")),
        Some(other) => Err(format!("{name} has unsupported type: {other}")),
    }
}

pub fn parse_crm_body(body: &str) -> CrmBody {
    if body.is_empty() {
        return CrmBody::Empty;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => CrmBody::Parsed(map),
        _ => CrmBody::Raw(body.to_string()),
    }
}

pub fn envelope(body: &str, http_status: u16) -> ResponseEnvelope {
    ResponseEnvelope {
        body: parse_crm_body(body),
        http_status,
    }
}

pub fn callback_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Short stable identifier for a bearer token, safe to log.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("tok_{short}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(aws_key: &str, phone: &str, tenant: &str) -> CallPayload {
        CallPayload {
            aws_key: json!(aws_key),
            phone_number: json!(phone),
            tenant_code: json!(tenant),
        }
    }

    #[test]
    fn direct_event_uses_top_level_fields() {
        let event = json!({"aws_key": "K", "phoneNumber": "+1555", "tenantCode": "T"});
        assert_eq!(normalize_event(&event), Ok(payload("K", "+1555", "T")));
    }

    #[test]
    fn routed_event_derives_from_contact_data() {
        let event = json!({"Details": {
            "ContactData": {"ContactId": "C1", "CustomerEndpoint": {"Address": "+15551234567"}},
            "Parameters": {"tenantCode": "T1"}
        }});
        assert_eq!(normalize_event(&event), Ok(payload("C1", "+15551234567", "T1")));
    }

    #[test]
    fn explicit_parameters_override_fallbacks() {
        let event = json!({"Details": {
            "ContactData": {"ContactId": "FALLBACK", "CustomerEndpoint": {"Address": "+1000"}},
            "Parameters": {"aws_key": "EXPLICIT", "tenantCode": "T1"}
        }});
        let p = normalize_event(&event).unwrap();
        assert_eq!(p.aws_key, json!("EXPLICIT"));
        assert_eq!(p.phone_number, json!("+1000"));
    }

    #[test]
    fn falsy_explicit_value_falls_back() {
        let event = json!({"Details": {
            "ContactData": {"ContactId": "C9"},
            "Parameters": {"aws_key": "", "phoneNumber": "+1", "tenantCode": "T"}
        }});
        assert_eq!(normalize_event(&event).unwrap().aws_key, json!("C9"));
    }

    #[test]
    fn missing_parameters_reads_whole_event() {
        let event = json!({
            "tenantCode": "T2",
            "Details": {"ContactData": {"ContactId": "C2", "CustomerEndpoint": {"Address": "+2"}}}
        });
        assert_eq!(normalize_event(&event), Ok(payload("C2", "+2", "T2")));
    }

    #[test]
    fn reports_first_missing_field_in_order() {
        assert_eq!(normalize_event(&json!({})), Err(RequiredField::AwsKey));
        assert_eq!(normalize_event(&Value::Null), Err(RequiredField::AwsKey));
        assert_eq!(
            normalize_event(&json!({"aws_key": "K", "tenantCode": "T"})),
            Err(RequiredField::PhoneNumber)
        );
        assert_eq!(
            normalize_event(&json!({"Details": {
                "ContactData": {"ContactId": "C", "CustomerEndpoint": {"Address": "+1"}}
            }})),
            Err(RequiredField::TenantCode)
        );
    }

    #[test]
    fn falsy_values_count_as_missing() {
        for tenant in [json!(null), json!(""), json!(0), json!(false), json!([]), json!({})] {
            let event = json!({"aws_key": "K", "phoneNumber": "+1", "tenantCode": tenant});
            assert_eq!(normalize_event(&event), Err(RequiredField::TenantCode));
        }
    }

    #[test]
    fn truthy_values_keep_their_json_type() {
        let event = json!({"aws_key": true, "phoneNumber": 15551234567u64, "tenantCode": 7});
        let p = normalize_event(&event).unwrap();
        assert_eq!(p.aws_key, json!(true));
        assert_eq!(p.phone_number, json!(15551234567u64));
        assert_eq!(p.tenant_code, json!(7));

        let event = json!({"aws_key": "K", "phoneNumber": {"e164": "+1"}, "tenantCode": ["T1"]});
        let p = normalize_event(&event).unwrap();
        assert_eq!(p.phone_number, json!({"e164": "+1"}));
        assert_eq!(p.tenant_code, json!(["T1"]));
    }

    #[test]
    fn truthy_fallback_number_is_forwarded_unchanged() {
        let event = json!({"Details": {
            "ContactData": {"ContactId": 42, "CustomerEndpoint": {"Address": "+1"}},
            "Parameters": {"aws_key": 0, "tenantCode": "T"}
        }});
        assert_eq!(normalize_event(&event).unwrap().aws_key, json!(42));
    }

    #[test]
    fn classify_treats_empty_details_as_direct() {
        let event = json!({"Details": {}, "aws_key": "K"});
        assert!(matches!(CallEvent::classify(&event), CallEvent::Direct { .. }));
    }

    fn state(expires_at: i64) -> TokenState {
        TokenState {
            access_token: "tok".to_string(),
            instance_url: "https://crm.example.com".to_string(),
            expires_at,
        }
    }

    #[test]
    fn freshness_margin_is_exclusive() {
        let now = 1_700_000_000_000;
        assert!(token_is_fresh(&state(now + 60_001), now, 60_000));
        assert!(!token_is_fresh(&state(now + 60_000), now, 60_000));
        assert!(!token_is_fresh(&state(now - 5), now, 60_000));
    }

    #[test]
    fn empty_token_is_never_fresh() {
        let mut s = state(i64::MAX);
        s.access_token.clear();
        assert!(!token_is_fresh(&s, 0, 60_000));
    }

    #[test]
    fn expiry_uses_issued_at_string_and_expires_in() {
        let grant = TokenGrant {
            issued_at: Some(json!("1700000000000")),
            expires_in: Some(json!(7200)),
            ..TokenGrant::default()
        };
        assert_eq!(grant_expiry(&grant, 5, 900), Ok(1_700_000_000_000 + 7_200_000));
    }

    #[test]
    fn expiry_defaults_to_now_and_default_lifetime() {
        let grant = TokenGrant::default();
        assert_eq!(grant_expiry(&grant, 1_000, 900), Ok(901_000));

        let zeroed = TokenGrant {
            issued_at: Some(json!(0)),
            expires_in: Some(json!(null)),
            ..TokenGrant::default()
        };
        assert_eq!(grant_expiry(&zeroed, 1_000, 900), Ok(901_000));
    }

    #[test]
    fn expiry_rejects_non_numeric_values() {
        let grant = TokenGrant {
            expires_in: Some(json!("soon")),
            ..TokenGrant::default()
        };
        assert!(grant_expiry(&grant, 0, 900).is_err());
    }

    #[test]
    fn crm_body_parse_variants() {
        assert_eq!(parse_crm_body(""), CrmBody::Empty);
        assert_eq!(parse_crm_body("plain text"), CrmBody::Raw("plain text".to_string()));
        assert_eq!(parse_crm_body("\"ok\""), CrmBody::Raw("\"ok\"".to_string()));
        match parse_crm_body("{\"success\":true}") {
            CrmBody::Parsed(m) => assert_eq!(m.get("success"), Some(&json!(true))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn envelope_values_match_expected_shapes() {
        assert_eq!(
            envelope("{\"error\": \"not found\"}", 404).into_value(),
            json!({"error": "not found", "httpStatus": 404})
        );
        assert_eq!(envelope("", 200).into_value(), json!({"httpStatus": 200}));
        assert_eq!(
            envelope("plain text", 500).into_value(),
            json!({"raw": "plain text", "httpStatus": 500})
        );
    }

    #[test]
    fn callback_url_trims_trailing_slash() {
        assert_eq!(
            callback_url("https://crm.example.com/", "/services/apexrest/ivr/addtoCallBack"),
            "https://crm.example.com/services/apexrest/ivr/addtoCallBack"
        );
    }

    #[test]
    fn fingerprint_is_stable_and_opaque() {
        let a = token_fingerprint("secret-token");
        assert_eq!(a, token_fingerprint("secret-token"));
        assert_ne!(a, token_fingerprint("other-token"));
        assert!(a.starts_with("tok_") && a.len() == 20);
        assert!(!a.contains("secret"));
    }
}
