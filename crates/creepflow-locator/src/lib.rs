//! Grid bucketing for creep neighborhood queries.
//!
//! The locator is a multi-map from linear cell index to the snapshots of the
//! creeps standing in that cell. It is rebuilt from scratch every simulation
//! tick, so stale entries can never survive a tick boundary; steering code
//! only ever reads the snapshot taken before the parallel phase started.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by locator construction.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// Indicates configuration values that cannot be used (e.g., zero dimensions).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Multi-map from grid cell index to the payloads bucketed into that cell.
///
/// Generic over the payload so this crate stays a leaf; the simulation stores
/// its per-creep neighbor snapshots here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLocator<T> {
    width: i32,
    height: i32,
    buckets: HashMap<i32, Vec<T>>,
}

impl<T> GridLocator<T> {
    /// Create a locator for a `width * height` cell grid.
    pub fn new(width: u32, height: u32) -> Result<Self, LocatorError> {
        if width == 0 || height == 0 {
            return Err(LocatorError::InvalidConfig(
                "locator dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width: width as i32,
            height: height as i32,
            buckets: HashMap::new(),
        })
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    /// Map grid coordinates to a linear cell index, `-1` when out of bounds.
    #[must_use]
    pub const fn index(&self, x: i32, y: i32) -> i32 {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            -1
        } else {
            y * self.width + x
        }
    }

    /// Drop the previous tick's contents, keeping bucket capacity.
    pub fn clear(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
    }

    /// Insert a payload into the cell at `(x, y)`. Out-of-bounds cells are ignored.
    pub fn insert(&mut self, x: i32, y: i32, item: T) {
        let index = self.index(x, y);
        if index < 0 {
            return;
        }
        self.buckets.entry(index).or_default().push(item);
    }

    /// Rebuild the locator from an iterator of `(cell, payload)` pairs.
    pub fn rebuild(&mut self, items: impl IntoIterator<Item = ((i32, i32), T)>) {
        self.clear();
        for ((x, y), item) in items {
            self.insert(x, y, item);
        }
    }

    /// All payloads bucketed into `index`; missing keys yield an empty slice.
    #[must_use]
    pub fn query(&self, index: i32) -> &[T] {
        if index < 0 {
            return &[];
        }
        self.buckets.get(&index).map_or(&[], Vec::as_slice)
    }

    /// Total payload count across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Returns true when no payloads are bucketed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_maps_bounds_to_minus_one() {
        let locator: GridLocator<u32> = GridLocator::new(4, 3).expect("locator");
        assert_eq!(locator.index(0, 0), 0);
        assert_eq!(locator.index(3, 2), 11);
        assert_eq!(locator.index(-1, 0), -1);
        assert_eq!(locator.index(0, -1), -1);
        assert_eq!(locator.index(4, 0), -1);
        assert_eq!(locator.index(0, 3), -1);
    }

    #[test]
    fn missing_keys_yield_empty_slices() {
        let mut locator: GridLocator<u32> = GridLocator::new(4, 4).expect("locator");
        assert!(locator.query(5).is_empty());
        assert!(locator.query(-1).is_empty());
        locator.insert(1, 1, 7);
        assert_eq!(locator.query(locator.index(1, 1)), &[7]);
        assert!(locator.query(locator.index(2, 2)).is_empty());
    }

    #[test]
    fn rebuild_discards_previous_contents() {
        let mut locator: GridLocator<u32> = GridLocator::new(4, 4).expect("locator");
        locator.rebuild([((0, 0), 1), ((0, 0), 2), ((3, 3), 3)]);
        assert_eq!(locator.query(locator.index(0, 0)), &[1, 2]);
        assert_eq!(locator.len(), 3);

        locator.rebuild([((1, 0), 9)]);
        assert!(locator.query(locator.index(0, 0)).is_empty());
        assert!(locator.query(locator.index(3, 3)).is_empty());
        assert_eq!(locator.query(locator.index(1, 0)), &[9]);
        assert_eq!(locator.len(), 1);
    }

    #[test]
    fn out_of_bounds_inserts_are_ignored() {
        let mut locator: GridLocator<u32> = GridLocator::new(2, 2).expect("locator");
        locator.insert(-1, 0, 1);
        locator.insert(2, 0, 2);
        assert!(locator.is_empty());
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(GridLocator::<u32>::new(0, 4).is_err());
        assert!(GridLocator::<u32>::new(4, 0).is_err());
    }
}
