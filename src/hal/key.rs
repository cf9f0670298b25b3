//! Structured cache keys. Two requests share a compiled kernel exactly when their keys are equal.

use std::sync::Arc;

use derive_more::{Display, From};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::ops::OpKind;
use crate::loom::num::DataType;

/// Whether slice ends were known when attributes were resolved, or read from a runtime tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Bound {
    Static,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExpandKey {
    pub r#type: DataType,
    pub input: Arc<[usize]>,
    /// Requested dims as read from the shape tensor.
    pub shape: Arc<[usize]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SliceKey {
    pub r#type: DataType,
    pub dims: Arc<[usize]>,
    /// Normalized axes, each in `0..rank`.
    pub axes: Vec<usize>,
    /// Normalized starts, one per axis.
    pub starts: Vec<i64>,
    /// Normalized ends, one per axis.
    pub ends: Vec<i64>,
    pub reverse: bool,
    pub bound: Bound,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WhereKey {
    pub r#type: DataType,
    pub condition: Arc<[usize]>,
    pub x: Arc<[usize]>,
    pub y: Arc<[usize]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ArgMaxKey {
    pub r#type: DataType,
    pub dims: Arc<[usize]>,
}

fn dims(dims: &[usize]) -> String {
    format!("[{}]", dims.iter().format(", "))
}

impl std::fmt::Display for ExpandKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Expand({}{} -> {})",
            self.r#type,
            dims(&self.input),
            dims(&self.shape)
        )
    }
}

impl std::fmt::Display for SliceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Slice({}{}; axes {}; starts [{}]; ends [{}]; {}{})",
            self.r#type,
            dims(&self.dims),
            dims(&self.axes),
            self.starts.iter().format(", "),
            self.ends.iter().format(", "),
            self.bound,
            if self.reverse { "; reverse" } else { "" },
        )
    }
}

impl std::fmt::Display for WhereKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Where({}; {}, {}, {})",
            self.r#type,
            dims(&self.condition),
            dims(&self.x),
            dims(&self.y)
        )
    }
}

impl std::fmt::Display for ArgMaxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArgMax({}{})", self.r#type, dims(&self.dims))
    }
}

/// Deterministic fingerprint of everything a kernel program depends on.
/// The variant names the operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CacheKey {
    #[display("{_0}")]
    Expand(ExpandKey),
    #[display("{_0}")]
    Slice(SliceKey),
    #[display("{_0}")]
    Where(WhereKey),
    #[display("{_0}")]
    ArgMax(ArgMaxKey),
}

impl CacheKey {
    #[inline]
    pub fn kind(&self) -> OpKind {
        match self {
            CacheKey::Expand(_) => OpKind::Expand,
            CacheKey::Slice(_) => OpKind::Slice,
            CacheKey::Where(_) => OpKind::Where,
            CacheKey::ArgMax(_) => OpKind::ArgMax,
        }
    }
}
