//! Logical axes and tensor axis layouts.
//!
//! A layout such as `"BYXC"` says which tensor dimension carries which logical
//! axis. Volumes always use the fixed slot order `[X, Y, C, Z, B]`, so lookups
//! go through [`AxisLayout::index_of`] instead of hard-coded positions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    Width,
    Height,
    Channel,
    Depth,
    Batch,
}

/// The axes the tiling engine reasons about; batch carries frames and is never tiled.
pub const LOGICAL_AXES: [Axis; 4] = [Axis::Width, Axis::Height, Axis::Channel, Axis::Depth];

/// Spatial axes that are mirrored and tiled.
pub const SPATIAL_AXES: [Axis; 3] = [Axis::Width, Axis::Height, Axis::Depth];

pub const VOLUME_RANK: usize = 5;

impl Axis {
    pub fn symbol(self) -> char {
        match self {
            Self::Width => 'X',
            Self::Height => 'Y',
            Self::Channel => 'C',
            Self::Depth => 'Z',
            Self::Batch => 'B',
        }
    }

    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol.to_ascii_uppercase() {
            'X' => Some(Self::Width),
            'Y' => Some(Self::Height),
            'C' => Some(Self::Channel),
            'Z' => Some(Self::Depth),
            'B' => Some(Self::Batch),
            _ => None,
        }
    }

    /// Position of this axis in an [`crate::volume::ImageVolume`].
    pub fn volume_slot(self) -> usize {
        match self {
            Self::Width => 0,
            Self::Height => 1,
            Self::Channel => 2,
            Self::Depth => 3,
            Self::Batch => 4,
        }
    }

    pub fn from_volume_slot(slot: usize) -> Option<Self> {
        [
            Self::Width,
            Self::Height,
            Self::Channel,
            Self::Depth,
            Self::Batch,
        ]
        .get(slot)
        .copied()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Width => "width",
            Self::Height => "height",
            Self::Channel => "channel",
            Self::Depth => "depth",
            Self::Batch => "batch",
        };
        write!(f, "{name} ({})", self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AxisLayout {
    axes: Vec<Axis>,
}

impl AxisLayout {
    pub fn parse(layout: &str) -> Result<Self, ConfigError> {
        let mut axes = Vec::with_capacity(layout.len());
        for symbol in layout.trim().chars() {
            let axis = Axis::from_symbol(symbol).ok_or_else(|| ConfigError::InvalidLayout {
                layout: layout.to_string(),
                reason: format!("unknown axis symbol '{symbol}'"),
            })?;
            if axes.contains(&axis) {
                return Err(ConfigError::InvalidLayout {
                    layout: layout.to_string(),
                    reason: format!("axis '{}' appears more than once", axis.symbol()),
                });
            }
            axes.push(axis);
        }
        Ok(Self { axes })
    }

    /// Position of `axis` within the tensor, or `None` when the tensor omits it.
    pub fn index_of(&self, axis: Axis) -> Option<usize> {
        self.axes.iter().position(|candidate| *candidate == axis)
    }

    pub fn contains(&self, axis: Axis) -> bool {
        self.index_of(axis).is_some()
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }
}

impl Serialize for Axis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_char(self.symbol())
    }
}

impl fmt::Display for AxisLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for axis in &self.axes {
            write!(f, "{}", axis.symbol())?;
        }
        Ok(())
    }
}

impl FromStr for AxisLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AxisLayout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AxisLayout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
