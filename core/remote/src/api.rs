//! Remote API trait and response envelope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use satchel_common::{CollectionName, Error, Result};

/// One resource as returned by the remote API: the server-assigned id plus
/// the entity fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Server-assigned permanent id.
    pub id: String,
    /// Entity fields.
    pub payload: Value,
}

/// The authoritative CRUD service, one REST resource path per collection.
///
/// Implementations classify failures through the common error taxonomy:
/// transport faults and 5xx/408/429 statuses are transient, remaining 4xx
/// statuses and malformed bodies are permanent.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Client name (e.g. "http", "memory").
    fn name(&self) -> &str;

    /// Cheap reachability probe. Succeeds when the service answered at all,
    /// regardless of status.
    async fn ping(&self) -> Result<()>;

    /// Fetch the canonical snapshot of a collection.
    async fn fetch_all(&self, collection: &CollectionName) -> Result<Vec<RemoteRecord>>;

    /// Fetch one resource by id.
    async fn fetch(&self, collection: &CollectionName, id: &str) -> Result<RemoteRecord>;

    /// Create a resource; the response carries the permanent id.
    async fn create(&self, collection: &CollectionName, payload: &Value) -> Result<RemoteRecord>;

    /// Replace a resource (last writer wins, full replacement).
    async fn update(
        &self,
        collection: &CollectionName,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord>;

    /// Delete a resource.
    async fn delete(&self, collection: &CollectionName, id: &str) -> Result<()>;
}

/// Canonical success envelope: `{ "data": ... }`.
///
/// Anything else is an unexpected-shape error; malformed data is never
/// silently treated as an empty collection.
#[derive(Debug, Deserialize)]
struct Envelope {
    data: Value,
}

/// Unwrap the `data` field of a response body.
pub fn unwrap_envelope(body: Value) -> Result<Value> {
    let envelope: Envelope = serde_json::from_value(body)
        .map_err(|e| Error::UnexpectedShape(format!("Missing response envelope: {}", e)))?;
    Ok(envelope.data)
}

/// Interpret one envelope payload as a resource object.
///
/// The object must carry an `"id"` that is a string or an integer; the id is
/// not duplicated into the returned payload.
pub fn record_from_value(value: Value) -> Result<RemoteRecord> {
    let Value::Object(mut fields) = value else {
        return Err(Error::UnexpectedShape(
            "Resource is not a JSON object".to_string(),
        ));
    };
    let id = match fields.remove("id") {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(Error::UnexpectedShape(format!(
                "Resource id has unsupported type: {}",
                other
            )));
        }
        None => {
            return Err(Error::UnexpectedShape(
                "Resource object has no id".to_string(),
            ));
        }
    };
    Ok(RemoteRecord {
        id,
        payload: Value::Object(fields),
    })
}

/// Interpret an envelope payload as a list of resource objects.
pub fn records_from_value(value: Value) -> Result<Vec<RemoteRecord>> {
    let Value::Array(items) = value else {
        return Err(Error::UnexpectedShape(
            "Collection snapshot is not an array".to_string(),
        ));
    };
    items.into_iter().map(record_from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_envelope() {
        let data = unwrap_envelope(json!({"data": [1, 2]})).unwrap();
        assert_eq!(data, json!([1, 2]));
    }

    #[test]
    fn test_bare_array_is_shape_error() {
        assert!(matches!(
            unwrap_envelope(json!([1, 2])),
            Err(Error::UnexpectedShape(_))
        ));
    }

    #[test]
    fn test_record_from_value() {
        let record = record_from_value(json!({"id": 7, "name": "Widget"})).unwrap();
        assert_eq!(record.id, "7");
        assert_eq!(record.payload, json!({"name": "Widget"}));
    }

    #[test]
    fn test_record_without_id_is_shape_error() {
        assert!(matches!(
            record_from_value(json!({"name": "Widget"})),
            Err(Error::UnexpectedShape(_))
        ));
        assert!(matches!(
            record_from_value(json!({"id": {"nested": true}})),
            Err(Error::UnexpectedShape(_))
        ));
    }

    #[test]
    fn test_records_from_value() {
        let records =
            records_from_value(json!([{"id": "a"}, {"id": "b", "qty": 2}])).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, json!({"qty": 2}));
    }
}
