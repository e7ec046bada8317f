//! The set of maps a veto draws from

use crate::config::default_map_pool;
use crate::error::{MatchmakingError, Result};

/// Ordered, duplicate-free list of at least two maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapPool {
    maps: Vec<String>,
}

impl MapPool {
    pub fn new(maps: Vec<String>) -> Result<Self> {
        if maps.len() < 2 {
            return Err(MatchmakingError::ConfigurationError {
                message: format!("Map pool needs at least 2 maps, got {}", maps.len()),
            }
            .into());
        }
        for (i, map) in maps.iter().enumerate() {
            if map.trim().is_empty() {
                return Err(MatchmakingError::ConfigurationError {
                    message: "Map pool contains an empty map name".to_string(),
                }
                .into());
            }
            if maps[..i].contains(map) {
                return Err(MatchmakingError::ConfigurationError {
                    message: format!("Map {} appears twice in the pool", map),
                }
                .into());
            }
        }
        Ok(Self { maps })
    }

    pub fn maps(&self) -> &[String] {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn contains(&self, map: &str) -> bool {
        self.maps.iter().any(|m| m == map)
    }

    /// Bans needed to get down to one map
    pub fn bans_to_complete(&self) -> usize {
        self.maps.len() - 1
    }

    /// Maps not yet banned, in pool order
    pub fn remaining<'a, I>(&self, banned: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let banned: Vec<&str> = banned.into_iter().collect();
        self.maps
            .iter()
            .filter(|map| !banned.contains(&map.as_str()))
            .cloned()
            .collect()
    }
}

impl Default for MapPool {
    fn default() -> Self {
        Self {
            maps: default_map_pool(),
        }
    }
}
