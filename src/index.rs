//! Exact (flat) vector index.
//!
//! Rows are stored contiguously in insertion order, so row `i` always
//! corresponds to chunk `i`. There is no delete: removing chunks means building
//! a fresh index from the surviving vectors.
//!
//! On-disk layout (`vectors.index`), all integers little-endian:
//!
//! ```text
//! magic  b"RAGIDX01"   8 bytes
//! metric u8            0 = inner product, 1 = L2
//! dims   u32
//! count  u64
//! data   count * dims * f32
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

const MAGIC: &[u8; 8] = b"RAGIDX01";
const HEADER_LEN: usize = 8 + 1 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    InnerProduct,
    L2,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::InnerProduct => "inner_product",
            Metric::L2 => "l2",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Metric::InnerProduct => 0,
            Metric::L2 => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Metric::InnerProduct),
            1 => Some(Metric::L2),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector has dimension {got}, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("persisted index is incompatible: {0}")]
    Incompatible(String),
    #[error("persisted index is corrupt: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dims: usize,
    metric: Metric,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors in order. Either all are added or, on a dimension
    /// mismatch, none are.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                got: bad.len(),
            });
        }
        self.data.reserve(vectors.len() * self.dims);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    pub fn vector(&self, i: usize) -> Option<&[f32]> {
        let start = i.checked_mul(self.dims)?;
        self.data.get(start..start + self.dims)
    }

    /// Raw metric value: dot product for inner product, Euclidean distance for L2.
    fn raw_score(&self, row: &[f32], query: &[f32]) -> f32 {
        match self.metric {
            Metric::InnerProduct => row.iter().zip(query).map(|(a, b)| a * b).sum(),
            Metric::L2 => row
                .iter()
                .zip(query)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// Top-`k` rows as `(raw score, row index)`, best first. For inner product
    /// higher is better; for L2 lower is better.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(f32, usize)>, IndexError> {
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f32, usize)> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(i, row)| (self.raw_score(row, query), i))
            .collect();
        let better = |a: &(f32, usize), b: &(f32, usize)| {
            let ord = match self.metric {
                Metric::InnerProduct => b.0.total_cmp(&a.0),
                Metric::L2 => a.0.total_cmp(&b.0),
            };
            ord.then(a.1.cmp(&b.1))
        };
        scored.sort_by(better);
        scored.truncate(k);
        Ok(scored)
    }

    /// Map a raw metric value to a "higher is better" similarity.
    pub fn similarity(&self, raw: f32) -> f32 {
        match self.metric {
            Metric::InnerProduct => raw,
            Metric::L2 => 1.0 / (1.0 + raw),
        }
    }

    /// Keep only rows where `keep[i]` is true.
    pub fn retain_rows(&self, keep: &[bool]) -> FlatIndex {
        let mut out = FlatIndex::new(self.dims, self.metric);
        for (i, row) in self.data.chunks_exact(self.dims.max(1)).enumerate() {
            if keep.get(i).copied().unwrap_or(false) {
                out.data.extend_from_slice(row);
            }
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(self.metric.to_byte());
        out.extend_from_slice(&(self.dims as u32).to_le_bytes());
        out.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse a persisted index, rejecting it unless its dimension equals
    /// `expected_dims`.
    pub fn from_bytes(bytes: &[u8], expected_dims: usize) -> Result<Self, IndexError> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err(IndexError::Corrupt("bad header".to_string()));
        }
        let metric = Metric::from_byte(bytes[8])
            .ok_or_else(|| IndexError::Corrupt(format!("unknown metric {}", bytes[8])))?;
        let dims = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[13..21]);
        let count = u64::from_le_bytes(count_bytes) as usize;
        if dims != expected_dims {
            return Err(IndexError::Incompatible(format!(
                "persisted dimension {} does not match configured {}",
                dims, expected_dims
            )));
        }
        let expected_len = count
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| IndexError::Corrupt("size overflow".to_string()))?;
        if bytes.len() != expected_len {
            return Err(IndexError::Corrupt(format!(
                "expected {} bytes, found {}",
                expected_len,
                bytes.len()
            )));
        }
        let data = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { dims, metric, data })
    }

    pub fn load(path: &Path, expected_dims: usize) -> Result<Self, IndexError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, expected_dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_ip() -> FlatIndex {
        let mut idx = FlatIndex::new(2, Metric::InnerProduct);
        idx.add(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7071, 0.7071]])
            .unwrap();
        idx
    }

    #[test]
    fn inner_product_search_orders_best_first() {
        let hits = index_ip().search(&[1.0, 0.0], 3).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.1).collect();
        assert_eq!(order, vec![0, 2, 1]);
        assert!(hits[0].0 >= hits[1].0 && hits[1].0 >= hits[2].0);
    }

    #[test]
    fn l2_search_prefers_nearest() {
        let mut idx = FlatIndex::new(2, Metric::L2);
        idx.add(&[vec![10.0, 10.0], vec![1.0, 1.0]]).unwrap();
        let hits = idx.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].1, 1);
        assert!(idx.similarity(hits[0].0) > idx.similarity(20.0));
    }

    #[test]
    fn dimension_mismatch_is_hard_error_and_atomic() {
        let mut idx = FlatIndex::new(3, Metric::InnerProduct);
        let err = idx.add(&[vec![1.0, 2.0, 3.0], vec![1.0]]).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 3, got: 1 }));
        assert!(idx.is_empty());
        assert!(idx.search(&[1.0], 1).is_err());
    }

    #[test]
    fn empty_index_search_is_empty() {
        let idx = FlatIndex::new(4, Metric::L2);
        assert!(idx.search(&[0.0; 4], 5).unwrap().is_empty());
    }

    #[test]
    fn persist_roundtrip_checks_dimension() {
        let idx = index_ip();
        let bytes = idx.to_bytes();
        assert_eq!(FlatIndex::from_bytes(&bytes, 2).unwrap(), idx);
        assert!(matches!(
            FlatIndex::from_bytes(&bytes, 3),
            Err(IndexError::Incompatible(_))
        ));
        assert!(matches!(
            FlatIndex::from_bytes(&bytes[..bytes.len() - 1], 2),
            Err(IndexError::Corrupt(_))
        ));
        assert!(matches!(
            FlatIndex::from_bytes(b"garbage", 2),
            Err(IndexError::Corrupt(_))
        ));
    }

    #[test]
    fn retain_rows_applies_mask() {
        let kept = index_ip().retain_rows(&[true, false, true]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.vector(1), Some(&[0.7071f32, 0.7071][..]));
    }
}
