//! Firestore over its REST API.
//!
//! Documents travel as Firestore typed values (`{"stringValue": "..."}` and
//! friends); [`encode_value`] and [`decode_value`] convert them to and from
//! plain JSON so the rest of the service never sees the wire format.

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::auth::{ServiceAccountKey, ServiceAccountTokens};
use super::{Document, DocumentStore, FieldFilter, Fields, StoreError};

/// Production endpoint; emulator runs replace it with `http://host:port`.
pub const FIRESTORE_URL: &str = "https://firestore.googleapis.com";
const EMULATOR_TOKEN: &str = "owner";

/// How requests are authorized.
#[derive(Debug, Clone, PartialEq)]
pub enum FirestoreAuth {
    /// Bearer tokens minted from the key and refreshed before they expire.
    ServiceAccount(ServiceAccountKey),
    /// The fixed token a local emulator accepts for full access.
    Emulator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirestoreConfig {
    pub project_id: String,
    /// Scheme and authority requests go to, without a trailing slash.
    pub base_url: String,
    pub auth: FirestoreAuth,
}

enum Authorizer {
    ServiceAccount(ServiceAccountTokens),
    Emulator,
}

pub struct FirestoreStore {
    client: Client,
    authorizer: Authorizer,
    project_id: String,
    base_url: String,
}

#[derive(Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Deserialize)]
struct RunQueryItem {
    document: Option<RawDocument>,
}

impl FirestoreStore {
    /// Fails on an unusable private key, so bad credentials stop startup.
    pub fn new(config: FirestoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder().build()?;
        let authorizer = match config.auth {
            FirestoreAuth::ServiceAccount(key) => {
                Authorizer::ServiceAccount(ServiceAccountTokens::new(key, client.clone())?)
            }
            FirestoreAuth::Emulator => Authorizer::Emulator,
        };
        Ok(Self {
            client,
            authorizer,
            project_id: config.project_id,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `projects/{project}/databases/(default)/documents`
    fn database_path(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.database_path(), collection, id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, StoreError> {
        let token = match &self.authorizer {
            Authorizer::ServiceAccount(tokens) => tokens.token()?,
            Authorizer::Emulator => EMULATOR_TOKEN.to_string(),
        };
        Ok(request.bearer_auth(token))
    }

    fn send(&self, request: RequestBuilder) -> Result<reqwest::blocking::Response, StoreError> {
        let response = self.authorize(request)?.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn into_document(raw: RawDocument) -> Result<Document, StoreError> {
        let id = raw
            .name
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StoreError::Decode(format!("document name '{}' has no id", raw.name)))?
            .to_string();
        Ok(Document {
            id,
            fields: decode_fields(&raw.fields)?,
        })
    }
}

impl DocumentStore for FirestoreStore {
    fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        server_timestamps: &[&str],
    ) -> Result<(), StoreError> {
        let body = commit_body(&self.document_name(collection, id), &fields, server_timestamps);
        let url = self.url(&format!("{}:commit", self.database_path()));
        self.send(self.client.post(url).json(&body))?;
        log::debug!("Wrote {}/{}", collection, id);
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let url = self.url(&self.document_name(collection, id));
        let response = self.authorize(self.client.get(url))?.send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(StoreError::Status {
                status,
                body: response.text().unwrap_or_default(),
            });
        }
        let raw: RawDocument = response.json()?;
        Self::into_document(raw).map(Some)
    }

    fn query(&self, collection: &str, filters: &[FieldFilter]) -> Result<Vec<Document>, StoreError> {
        let url = self.url(&format!("{}:runQuery", self.database_path()));
        let body = run_query_body(collection, filters);
        let items: Vec<RunQueryItem> = self.send(self.client.post(url).json(&body))?.json()?;
        items
            .into_iter()
            .filter_map(|item| item.document)
            .map(Self::into_document)
            .collect()
    }
}

/// Body of a `documents:commit` call that replaces one document and stamps
/// the given fields with the commit time.
pub fn commit_body(name: &str, fields: &Fields, server_timestamps: &[&str]) -> Value {
    let mut write = json!({
        "update": {
            "name": name,
            "fields": encode_fields(fields),
        }
    });
    if !server_timestamps.is_empty() {
        let transforms: Vec<Value> = server_timestamps
            .iter()
            .map(|field| json!({ "fieldPath": field, "setToServerValue": "REQUEST_TIME" }))
            .collect();
        write["updateTransforms"] = Value::Array(transforms);
    }
    json!({ "writes": [write] })
}

/// Body of a `documents:runQuery` call selecting by field equality.
pub fn run_query_body(collection: &str, filters: &[FieldFilter]) -> Value {
    let mut field_filters: Vec<Value> = filters
        .iter()
        .map(|f| {
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": f.field },
                    "op": "EQUAL",
                    "value": encode_value(&f.value),
                }
            })
        })
        .collect();

    let mut query = json!({ "from": [{ "collectionId": collection }] });
    match field_filters.len() {
        0 => {}
        1 => query["where"] = field_filters.remove(0),
        _ => {
            query["where"] = json!({
                "compositeFilter": { "op": "AND", "filters": field_filters }
            })
        }
    }
    json!({ "structuredQuery": query })
}

pub fn encode_fields(fields: &Fields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

/// Plain JSON to a Firestore typed value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!({ "integerValue": i.to_string() })
            } else if let Some(u) = n.as_u64() {
                json!({ "integerValue": u.to_string() })
            } else {
                json!({ "doubleValue": n })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(fields) => json!({ "mapValue": { "fields": encode_fields(fields) } }),
    }
}

pub fn decode_fields(fields: &Map<String, Value>) -> Result<Fields, StoreError> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

/// Firestore typed value to plain JSON. Timestamps, references and bytes
/// become strings.
pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let typed = value
        .as_object()
        .and_then(|o| o.iter().next())
        .map(|(kind, v)| (kind.as_str(), v))
        .ok_or_else(|| StoreError::Decode(format!("expected a typed value, got {}", value)))?;

    match typed {
        ("nullValue", _) => Ok(Value::Null),
        ("booleanValue", b @ Value::Bool(_)) => Ok(b.clone()),
        ("integerValue", Value::String(s)) => s
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| StoreError::Decode(format!("integerValue '{}': {}", s, e))),
        ("integerValue", n @ Value::Number(_)) => Ok(n.clone()),
        ("doubleValue", d) => Ok(d.clone()),
        ("stringValue" | "timestampValue" | "referenceValue" | "bytesValue", s @ Value::String(_)) => {
            Ok(s.clone())
        }
        ("geoPointValue", p) => Ok(p.clone()),
        ("arrayValue", a) => a
            .get("values")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
            .unwrap_or_else(|| Ok(Vec::new()))
            .map(Value::Array),
        ("mapValue", m) => match m.get("fields").and_then(Value::as_object) {
            Some(fields) => decode_fields(fields).map(Value::Object),
            None => Ok(Value::Object(Map::new())),
        },
        (kind, v) => Err(StoreError::Decode(format!("unsupported value {}: {}", kind, v))),
    }
}
