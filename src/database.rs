//! Point database
//!
//! The database is written only by the session actor that owns it (responses,
//! unsolicited data, commanded outputs). Applications get a [`PointReader`],
//! which shares the storage but exposes no mutation.
//!
//! Storage sits behind a read-write lock: readers proceed concurrently, writes
//! are serialized, and a batch of updates from one fragment lands atomically.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Dnp3Error, Dnp3Result};
use crate::point::{Point, PointType};

type Table = BTreeMap<(PointType, u16), Point>;

/// Writable database owned by one session
#[derive(Debug, Default)]
pub struct PointDatabase {
    points: Arc<RwLock<Table>>,
}

impl PointDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the database with initial points
    pub fn with_points(points: impl IntoIterator<Item = Point>) -> Self {
        let db = Self::new();
        db.apply(points);
        db
    }

    /// Read-only handle sharing this database's storage
    pub fn reader(&self) -> PointReader {
        PointReader {
            points: Arc::clone(&self.points),
        }
    }

    /// Overwrite value, flags and timestamp of one point.
    ///
    /// Returns the previous state, if any.
    pub fn update(&self, point: Point) -> Option<Point> {
        self.write().insert(point.key(), point)
    }

    /// Apply a batch of updates under one write lock
    pub fn apply(&self, points: impl IntoIterator<Item = Point>) -> usize {
        let mut table = self.write();
        let mut count = 0;
        for point in points {
            table.insert(point.key(), point);
            count += 1;
        }
        count
    }

    pub fn read(&self, point_type: PointType, index: u16) -> Dnp3Result<Point> {
        self.reader().read(point_type, index)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        // A panicked writer leaves whole entries behind, never torn ones
        self.points.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared, read-only view of a [`PointDatabase`]
#[derive(Debug, Clone)]
pub struct PointReader {
    points: Arc<RwLock<Table>>,
}

impl PointReader {
    pub fn read(&self, point_type: PointType, index: u16) -> Dnp3Result<Point> {
        self.guard()
            .get(&(point_type, index))
            .copied()
            .ok_or(Dnp3Error::NotFound { point_type, index })
    }

    pub fn contains(&self, point_type: PointType, index: u16) -> bool {
        self.guard().contains_key(&(point_type, index))
    }

    /// All points of one type in index order
    pub fn points_of(&self, point_type: PointType) -> Vec<Point> {
        self.guard()
            .range((point_type, 0)..=(point_type, u16::MAX))
            .map(|(_, p)| *p)
            .collect()
    }

    /// Points of one type with `start <= index <= stop`
    pub fn range(&self, point_type: PointType, start: u16, stop: u16) -> Vec<Point> {
        if start > stop {
            return Vec::new();
        }
        self.guard()
            .range((point_type, start)..=(point_type, stop))
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Point> {
        self.guard().values().copied().collect()
    }

    fn guard(&self) -> RwLockReadGuard<'_, Table> {
        self.points.read().unwrap_or_else(|e| e.into_inner())
    }
}
