use crate::registry::{RegistryError, RegistryHandle};
use facewhiz_core::NewPerson;
use facewhiz_store::StoreError;
use serde::Deserialize;
use serde_json::Value;
use zbus::{fdo, interface};

/// D-Bus interface for the FaceWhiz registry daemon.
///
/// Bus name: org.facewhiz.Registry1
/// Object path: /org/facewhiz/Registry1
///
/// Payloads are JSON strings; person records use camelCase field names.
pub struct RegistryService {
    registry: RegistryHandle,
    db_path: String,
}

impl RegistryService {
    pub fn new(registry: RegistryHandle, db_path: String) -> Self {
        Self { registry, db_path }
    }
}

#[interface(name = "org.facewhiz.Registry1")]
impl RegistryService {
    /// Register a person, optionally with one descriptor. Returns the person JSON.
    async fn register(&self, request: &str) -> fdo::Result<String> {
        let (attrs, descriptor) = parse_register(request)?;
        tracing::info!(has_descriptor = descriptor.is_some(), "register requested");
        let person = self
            .registry
            .create_person(attrs, descriptor)
            .await
            .map_err(to_fdo)?;
        to_json(&person)
    }

    /// Attach another descriptor to a person. Returns the new descriptor ID.
    async fn add_descriptor(&self, person_id: &str, descriptor: &str) -> fdo::Result<String> {
        tracing::info!(person_id, "add_descriptor requested");
        let values = parse_vector(serde_json::from_str(descriptor).map_err(bad_json)?)?;
        self.registry
            .add_descriptor(person_id.to_string(), values)
            .await
            .map_err(to_fdo)
    }

    /// Fetch one person including their descriptors.
    async fn get_person(&self, person_id: &str) -> fdo::Result<String> {
        let profile = self
            .registry
            .get_person(person_id.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&profile)
    }

    /// List every person, most recent first.
    async fn list_people(&self) -> fdo::Result<String> {
        let people = self.registry.list_people().await.map_err(to_fdo)?;
        tracing::debug!(count = people.len(), "list_people");
        to_json(&people)
    }

    /// Delete a person and all their descriptors.
    async fn delete_person(&self, person_id: &str) -> fdo::Result<bool> {
        tracing::info!(person_id, "delete_person requested");
        self.registry
            .delete_person(person_id.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// Identify a descriptor. Returns `{match, distance, thresholdUsed}`.
    async fn recognize(&self, request: &str) -> fdo::Result<String> {
        let (query, threshold) = parse_recognize(request)?;
        let result = self
            .registry
            .recognize(query, threshold)
            .await
            .map_err(to_fdo)?;
        to_json(&result)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let stats = self.registry.stats().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "connected": true,
            "peopleCount": stats.people_count,
            "descriptorsCount": stats.descriptors_count,
            "databasePath": self.db_path,
        })
        .to_string())
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(flatten)]
    person: NewPerson,
    #[serde(default)]
    descriptor: Option<Value>,
}

#[derive(Deserialize)]
struct RecognizeRequest {
    #[serde(default)]
    descriptor: Option<Value>,
    #[serde(default)]
    threshold: Option<Value>,
}

/// Registration never fails on the descriptor: anything that is not a
/// non-empty array of numbers is dropped here, and shape validation is
/// left to the store's best-effort attach.
fn parse_register(request: &str) -> fdo::Result<(NewPerson, Option<Vec<f32>>)> {
    let req: RegisterRequest = serde_json::from_str(request).map_err(bad_json)?;
    let descriptor = req
        .descriptor
        .and_then(|v| parse_vector(v).ok())
        .filter(|v| !v.is_empty());
    Ok((req.person, descriptor))
}

fn parse_recognize(request: &str) -> fdo::Result<(Vec<f32>, Option<f32>)> {
    let req: RecognizeRequest = serde_json::from_str(request).map_err(bad_json)?;
    let descriptor = req
        .descriptor
        .filter(|v| !v.is_null())
        .ok_or_else(|| fdo::Error::InvalidArgs("descriptor is required".into()))?;
    let query = parse_vector(descriptor)?;
    if query.is_empty() {
        return Err(fdo::Error::InvalidArgs(
            "invalid descriptor: must be a non-empty array".into(),
        ));
    }
    // Only a numeric threshold counts; anything else means "use the default".
    let threshold = req.threshold.and_then(|t| t.as_f64()).map(|t| t as f32);
    Ok((query, threshold))
}

fn parse_vector(value: Value) -> fdo::Result<Vec<f32>> {
    let Value::Array(items) = value else {
        return Err(fdo::Error::InvalidArgs(
            "invalid descriptor: expected an array of numbers".into(),
        ));
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let n = item.as_f64().ok_or_else(|| {
                fdo::Error::InvalidArgs(format!(
                    "invalid descriptor: component {index} is not a number"
                ))
            })?;
            if n.abs() > f64::from(f32::MAX) {
                return Err(fdo::Error::InvalidArgs(format!(
                    "invalid descriptor: component {index} ({n}) is out of range"
                )));
            }
            Ok(n as f32)
        })
        .collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding failed: {e}")))
}

fn bad_json(e: serde_json::Error) -> fdo::Error {
    fdo::Error::InvalidArgs(format!("malformed request: {e}"))
}

fn to_fdo(err: RegistryError) -> fdo::Error {
    match err {
        RegistryError::Store(StoreError::NotFound(id)) => {
            fdo::Error::UnknownObject(format!("person not found: {id}"))
        }
        RegistryError::Store(
            e @ (StoreError::InvalidDescriptor(_) | StoreError::DimensionMismatch { .. }),
        ) => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "registry request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewhiz_core::DescriptorError;

    #[test]
    fn test_parse_register_full() {
        let descriptor = serde_json::to_string(&vec![0.25f32; 128]).unwrap();
        let request = format!(
            r#"{{"name":"Ada","email":"ada@example.com","role":"Engineer",
                "imageUrl":"/public/uploads/a.png","descriptor":{descriptor}}}"#
        );
        let (attrs, vector) = parse_register(&request).unwrap();
        assert_eq!(attrs.name.as_deref(), Some("Ada"));
        assert_eq!(attrs.role.as_deref(), Some("Engineer"));
        assert_eq!(attrs.image_url.as_deref(), Some("/public/uploads/a.png"));
        assert_eq!(vector, Some(vec![0.25; 128]));
    }

    #[test]
    fn test_parse_register_drops_unusable_descriptor() {
        for descriptor in [r#""abc""#, "[]", r#"[1, "two", 3]"#, "null", "{}"] {
            let request = format!(r#"{{"name":"X","descriptor":{descriptor}}}"#);
            let (_, vector) = parse_register(&request).unwrap();
            assert!(vector.is_none(), "descriptor {descriptor} should be dropped");
        }
    }

    #[test]
    fn test_parse_register_keeps_wrong_length_for_store_to_drop() {
        let descriptor = serde_json::to_string(&vec![0.0f32; 50]).unwrap();
        let request = format!(r#"{{"descriptor":{descriptor}}}"#);
        let (attrs, vector) = parse_register(&request).unwrap();
        assert!(attrs.name.is_none());
        assert_eq!(vector.map(|v| v.len()), Some(50));
    }

    #[test]
    fn test_parse_register_rejects_malformed_json() {
        assert!(matches!(parse_register("{not json"), Err(fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_parse_recognize() {
        let request = format!(
            r#"{{"descriptor":{},"threshold":0.4}}"#,
            serde_json::to_string(&vec![0.0f32; 128]).unwrap()
        );
        let (query, threshold) = parse_recognize(&request).unwrap();
        assert_eq!(query.len(), 128);
        assert_eq!(threshold, Some(0.4));
    }

    #[test]
    fn test_parse_recognize_non_numeric_threshold_ignored() {
        let request = r#"{"descriptor":[1.0],"threshold":"0.4"}"#;
        let (_, threshold) = parse_recognize(request).unwrap();
        assert_eq!(threshold, None);
    }

    #[test]
    fn test_parse_recognize_requires_descriptor() {
        for request in [
            r#"{}"#,
            r#"{"descriptor":null}"#,
            r#"{"descriptor":[]}"#,
            r#"{"descriptor":"x"}"#,
        ] {
            assert!(
                matches!(parse_recognize(request), Err(fdo::Error::InvalidArgs(_))),
                "{request}"
            );
        }
    }

    #[test]
    fn test_parse_vector_out_of_f32_range_rejected() {
        let mut values = vec![Value::from(0.0); 128];
        values[3] = Value::from(1e300);
        let err = parse_vector(Value::Array(values)).unwrap_err();
        match err {
            fdo::Error::InvalidArgs(msg) => assert!(msg.contains("component 3"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        let big = parse_vector(Value::Array(vec![Value::from(1e20); 128])).unwrap();
        assert!(big.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_parse_recognize_out_of_range_component_rejected() {
        let request = r#"{"descriptor":[0.0, 1e39, 0.0]}"#;
        assert!(matches!(parse_recognize(request), Err(fdo::Error::InvalidArgs(_))));

        // Registration drops the same vector instead of failing.
        let request = r#"{"name":"Y","descriptor":[0.0, 1e39, 0.0]}"#;
        let (_, vector) = parse_register(request).unwrap();
        assert!(vector.is_none());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo(RegistryError::Store(StoreError::NotFound("p".into()))),
            fdo::Error::UnknownObject(_)
        ));
        assert!(matches!(
            to_fdo(RegistryError::Store(StoreError::InvalidDescriptor(
                DescriptorError::InvalidLength(3)
            ))),
            fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(RegistryError::Store(StoreError::DimensionMismatch { stored: 128, query: 256 })),
            fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(to_fdo(RegistryError::ChannelClosed), fdo::Error::Failed(_)));
    }
}
