//! Unified sorting result: units, their spike trains and properties.

use crate::error::Result;
use crate::recording::Properties;
use crate::types::{PropertyValue, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File name used when a result is persisted as JSON.
pub const SORTING_FILE: &str = "sorting.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Spike times in frames, ascending.
    pub spike_train: Vec<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortingResult {
    #[serde(default)]
    pub sampling_frequency: Option<f64>,
    #[serde(default)]
    pub units: BTreeMap<UnitId, Unit>,
}

impl SortingResult {
    pub fn new(sampling_frequency: Option<f64>) -> Self {
        Self {
            sampling_frequency,
            units: BTreeMap::new(),
        }
    }

    /// Insert a unit, sorting its spike train. Replaces any unit with the same id.
    pub fn add_unit(&mut self, id: UnitId, mut spike_train: Vec<u64>) {
        spike_train.sort_unstable();
        self.units.insert(
            id,
            Unit {
                spike_train,
                properties: Properties::new(),
            },
        );
    }

    /// Append one spike to a unit, creating it if needed. Call `finish` afterwards.
    pub fn push_spike(&mut self, id: UnitId, frame: u64) {
        self.units.entry(id).or_default().spike_train.push(frame);
    }

    /// Sort every spike train.
    pub fn finish(&mut self) {
        for unit in self.units.values_mut() {
            unit.spike_train.sort_unstable();
        }
    }

    pub fn set_unit_property(&mut self, id: UnitId, name: &str, value: impl Into<PropertyValue>) {
        if let Some(unit) = self.units.get_mut(&id) {
            unit.properties.insert(name.to_string(), value.into());
        }
    }

    /// Tag every unit with the same property value.
    pub fn set_property_for_all(&mut self, name: &str, value: &PropertyValue) {
        for unit in self.units.values_mut() {
            unit.properties.insert(name.to_string(), value.clone());
        }
    }

    pub fn unit_property(&self, id: UnitId, name: &str) -> Option<&PropertyValue> {
        self.units.get(&id).and_then(|u| u.properties.get(name))
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.keys().copied().collect()
    }

    pub fn spike_train(&self, id: UnitId) -> Option<&[u64]> {
        self.units.get(&id).map(|u| u.spike_train.as_slice())
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn total_spikes(&self) -> usize {
        self.units.values().map(|u| u.spike_train.len()).sum()
    }

    /// Largest spike frame across all units.
    pub fn max_frame(&self) -> Option<u64> {
        self.units
            .values()
            .filter_map(|u| u.spike_train.last().copied())
            .max()
    }

    /// Keep only the units for which `keep` returns true.
    pub fn retain_units(&mut self, mut keep: impl FnMut(UnitId) -> bool) {
        self.units.retain(|id, _| keep(*id));
    }

    /// Union of partition results, ordered by partition index.
    ///
    /// Unit ids are kept as-is when they are disjoint. When any id appears in
    /// more than one part, every id is rewritten to
    /// `partition_index * stride + id`, with `stride` the smallest power of ten
    /// strictly greater than the largest source id.
    pub fn merge(parts: Vec<(usize, SortingResult)>) -> SortingResult {
        let mut seen = std::collections::BTreeSet::new();
        let mut collision = false;
        let mut max_id: UnitId = 0;
        for (_, part) in &parts {
            for id in part.units.keys() {
                collision |= !seen.insert(*id);
                max_id = max_id.max(*id);
            }
        }

        let stride = if collision {
            let mut stride: u64 = 10;
            while stride <= u64::from(max_id) {
                stride *= 10;
            }
            stride
        } else {
            0
        };

        let mut merged = SortingResult::new(parts.first().and_then(|(_, p)| p.sampling_frequency));
        for (index, part) in parts {
            for (id, unit) in part.units {
                let new_id = if collision {
                    (index as u64 * stride + u64::from(id)) as UnitId
                } else {
                    id
                };
                merged.units.insert(new_id, unit);
            }
        }
        merged
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
