use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Descriptor lengths produced by the supported embedding model family.
pub const DESCRIPTOR_DIMENSIONS: [usize; 2] = [128, 256];

/// Name stored when a registration carries no usable name.
pub const UNKNOWN_PERSON_NAME: &str = "Unknown Person";

/// Role stored when a registration carries no usable role.
pub const DEFAULT_ROLE: &str = "Employee";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is empty")]
    Empty,
    #[error("invalid descriptor length {0} (expected 128 or 256)")]
    InvalidLength(usize),
    #[error("descriptor component {index} is not a finite number")]
    NonFinite { index: usize },
}

/// Face descriptor vector that passed shape validation.
///
/// Always 128 or 256 finite components. Construction is the only place
/// validation happens, so holding a `Descriptor` is proof of validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Validate `values` and wrap them.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if !DESCRIPTOR_DIMENSIONS.contains(&values.len()) {
            return Err(DescriptorError::InvalidLength(values.len()));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to `other`, or `None` when the lengths differ.
    pub fn euclidean_distance(&self, other: &[f32]) -> Option<f64> {
        euclidean_distance(&self.values, other)
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.values
    }
}

/// Compute `sqrt(Σ (a_i - b_i)^2)`.
///
/// Accumulates in `f64`: any pair of finite `f32` vectors of a supported
/// length yields a finite distance. Returns `None` if the slices have
/// different lengths.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (f64::from(*x) - f64::from(*y)).powi(2))
            .sum::<f64>()
            .sqrt(),
    )
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
    /// Opaque reference to an externally stored profile image.
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Person together with every descriptor enrolled for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonProfile {
    #[serde(flatten)]
    pub person: Person,
    pub descriptors: Vec<Vec<f32>>,
}

/// Registration attributes as received from a caller.
///
/// Every field is optional; [`NewPerson::into_person`] applies the
/// defaults for name and role and drops blank values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewPerson {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
    pub image_url: Option<String>,
}

impl NewPerson {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Build the stored record, assigning identity and creation time.
    pub fn into_person(self, id: String, created_at: DateTime<Utc>) -> Person {
        Person {
            id,
            name: non_blank(self.name).unwrap_or_else(|| UNKNOWN_PERSON_NAME.to_string()),
            email: non_blank(self.email),
            phone: non_blank(self.phone),
            department: non_blank(self.department),
            role: Some(non_blank(self.role).unwrap_or_else(|| DEFAULT_ROLE.to_string())),
            // Stored verbatim: the image reference is opaque to the registry.
            image_url: self.image_url.filter(|url| !url.is_empty()),
            created_at,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
