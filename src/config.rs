use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    anchors::{GroupingKeywords, GroupingPolicy, SegmenterConfig},
    constitutive::ConstitutiveConfig,
    constraints::SearchParams,
    driver::DriverConfig,
    error::{Result, StagingError},
    solver::SolverConfig,
};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnchorsConfig {
    pub head_tolerance: f64,
    pub free_band: f64,
    pub grouping_policy: GroupingPolicy,
    pub free_keywords: Vec<String>,
    pub bonded_keywords: Vec<String>,
    pub bonded_set_ids: Vec<u32>,
}

impl Default for AnchorsConfig {
    fn default() -> Self {
        let segmenter = SegmenterConfig::default();
        let keywords = GroupingKeywords::default();
        AnchorsConfig {
            head_tolerance: segmenter.head_tolerance,
            free_band: segmenter.free_band,
            grouping_policy: segmenter.policy,
            free_keywords: keywords.free,
            bonded_keywords: keywords.bonded,
            bonded_set_ids: keywords.bonded_set_ids,
        }
    }
}

impl AnchorsConfig {
    pub fn segmenter(&self) -> SegmenterConfig {
        SegmenterConfig {
            head_tolerance: self.head_tolerance,
            free_band: self.free_band,
            policy: self.grouping_policy,
        }
    }

    pub fn keywords(&self) -> GroupingKeywords {
        GroupingKeywords {
            free: self.free_keywords.iter().map(|k| k.to_lowercase()).collect(),
            bonded: self.bonded_keywords.iter().map(|k| k.to_lowercase()).collect(),
            bonded_set_ids: self.bonded_set_ids.clone(),
        }
    }
}

/// Pipeline settings, read from TOML. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub anchors: AnchorsConfig,
    pub coupling: SearchParams,
    pub constitutive: ConstitutiveConfig,
    pub driver: DriverConfig,
    pub solver: SolverConfig,
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> StagingError {
    StagingError::Config(format!("{field} = {value} is invalid: {reason}"))
}

fn positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, value, "must be a positive number"))
    }
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| StagingError::Config(format!("TOML parsing error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the algorithms cannot work with
    pub fn validate(&self) -> Result<()> {
        positive("anchors.head_tolerance", self.anchors.head_tolerance)?;
        positive("anchors.free_band", self.anchors.free_band)?;

        let coupling = &self.coupling;
        if coupling.k == 0 {
            return Err(invalid("coupling.k", coupling.k, "at least one master is needed"));
        }
        positive("coupling.search_radius", coupling.search_radius)?;
        positive("coupling.projection_tolerance", coupling.projection_tolerance)?;
        positive("coupling.max_search_radius", coupling.max_search_radius)?;
        positive("coupling.min_distance", coupling.min_distance)?;
        if coupling.max_search_radius < coupling.search_radius {
            return Err(invalid(
                "coupling.max_search_radius",
                coupling.max_search_radius,
                "must not be smaller than coupling.search_radius",
            ));
        }
        if !(coupling.growth_factor > 1.0) {
            return Err(invalid("coupling.growth_factor", coupling.growth_factor, "must exceed 1"));
        }

        let constitutive = &self.constitutive;
        if !(0.0..90.0).contains(&constitutive.friction_floor_deg) {
            return Err(invalid(
                "constitutive.friction_floor_deg",
                constitutive.friction_floor_deg,
                "expected [0, 90)",
            ));
        }
        for (field, value) in [
            ("constitutive.tension_floor_pa", constitutive.tension_floor_pa),
            ("constitutive.compression_floor_pa", constitutive.compression_floor_pa),
            ("constitutive.dilatancy_offset_deg", constitutive.dilatancy_offset_deg),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, value, "must be a non-negative number"));
            }
        }
        if constitutive.tension_floor_pa > constitutive.compression_floor_pa {
            return Err(invalid(
                "constitutive.tension_floor_pa",
                constitutive.tension_floor_pa,
                "must not exceed constitutive.compression_floor_pa",
            ));
        }

        if matches!(&self.solver.command, Some(c) if c.trim().is_empty()) {
            return Err(StagingError::Config("solver.command is empty".to_owned()));
        }

        Ok(())
    }
}
