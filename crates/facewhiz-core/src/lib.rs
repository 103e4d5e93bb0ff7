//! facewhiz-core — Descriptor registry model and recognition engine.
//!
//! Holds the person/descriptor data model, descriptor shape validation,
//! the Euclidean distance metric and the brute-force nearest-neighbor
//! matcher. Nothing here touches storage; the store crate feeds the
//! matcher a snapshot of enrolled descriptors.

pub mod matcher;
pub mod types;

pub use matcher::{
    recognize, resolve_threshold, resolve_threshold_or, EuclideanMatcher, GalleryEntry,
    MatchError, MatchResult, Matcher, Recognition, DEFAULT_THRESHOLD,
};
pub use types::{
    Descriptor, DescriptorError, NewPerson, Person, PersonProfile, DESCRIPTOR_DIMENSIONS,
};
