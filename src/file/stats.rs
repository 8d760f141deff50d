//! Per-field statistics carried by data files and manifest files.
//!
//! Statistics are collected while writing and used by the scan planner to
//! prune files without opening them. Pruning is conservative: a field whose
//! stats are absent never excludes a file.

use serde::{Deserialize, Serialize};

use crate::data::{Datum, Row};
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: Option<Datum>,
    pub max: Option<Datum>,
    pub null_count: u64,
}

impl FieldStats {
    fn update(&mut self, value: Option<&Datum>) -> Result<()> {
        let Some(value) = value else {
            self.null_count += 1;
            return Ok(());
        };
        match &self.min {
            None => self.min = Some(value.clone()),
            Some(min) => {
                if value.try_cmp(min)?.is_lt() {
                    self.min = Some(value.clone());
                }
            }
        }
        match &self.max {
            None => self.max = Some(value.clone()),
            Some(max) => {
                if value.try_cmp(max)?.is_gt() {
                    self.max = Some(value.clone());
                }
            }
        }
        Ok(())
    }
}

/// Collects min/max/null-count per field over a stream of rows.
#[derive(Debug)]
pub struct StatsCollector {
    stats: Vec<FieldStats>,
}

impl StatsCollector {
    pub fn new(arity: usize) -> Self {
        Self {
            stats: vec![FieldStats::default(); arity],
        }
    }

    pub fn update(&mut self, row: &Row) -> Result<()> {
        for (stats, value) in self.stats.iter_mut().zip(row) {
            stats.update(value.as_ref())?;
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<FieldStats> {
        self.stats
    }
}
