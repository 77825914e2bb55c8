use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors from loading or validating a [`StreamConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must not be negative, got {value}")]
    NegativeRadius { field: &'static str, value: i32 },
    #[error("generate_radius ({generate}) exceeds send_radius ({send})")]
    GenerateBeyondSend { generate: i32, send: i32 },
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("{field} must be a finite non-negative number, got {value}")]
    InvalidFloat { field: &'static str, value: f32 },
}

/// Server-side streaming settings shared by every observer.
///
/// Radii are in chunks. Missing JSON fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Upper bound for any observer's send radius.
    pub send_radius: i32,
    /// Chunks are only generated within this radius; must be `<= send_radius`.
    pub generate_radius: i32,
    /// Upper bound for any observer's far radius, in far cells.
    pub far_send_radius: i32,
    /// In-flight transfers allowed per observer.
    pub max_simultaneous_transfers: usize,
    /// In-flight cap during the post-edit cooldown.
    pub limited_simultaneous_transfers: usize,
    /// Rings at or below this distance ignore the post-edit cooldown.
    pub cooldown_exempt_distance: i32,
    /// Field of view assumed for new observers. 0 disables FOV culling.
    pub fov_radians: f32,
    pub post_edit_cooldown_seconds: f32,
    pub occlusion_culling_enabled: bool,
    /// From this ring on, sky-only chunks are skipped and occlusion runs.
    pub optimize_distance: i32,
    /// Cap on how many sent chunks an observer may hold.
    pub max_total_sent: usize,
    /// Priority handicap applied to coarse suggestions.
    pub far_weight: f32,
    /// Capacity of the emerge job queue.
    pub emerge_queue_limit: usize,
    pub emerge_workers: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            send_radius: 10,
            generate_radius: 6,
            far_send_radius: 8,
            max_simultaneous_transfers: 40,
            limited_simultaneous_transfers: 1,
            cooldown_exempt_distance: 1,
            fov_radians: 1.72,
            post_edit_cooldown_seconds: 2.0,
            occlusion_culling_enabled: true,
            optimize_distance: 4,
            max_total_sent: 35000,
            far_weight: 3.0,
            emerge_queue_limit: 256,
            emerge_workers: 2,
        }
    }
}

impl StreamConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&data)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("send_radius", self.send_radius),
            ("generate_radius", self.generate_radius),
            ("far_send_radius", self.far_send_radius),
            ("cooldown_exempt_distance", self.cooldown_exempt_distance),
            ("optimize_distance", self.optimize_distance),
        ] {
            if value < 0 {
                return Err(ConfigError::NegativeRadius { field, value });
            }
        }
        if self.generate_radius > self.send_radius {
            return Err(ConfigError::GenerateBeyondSend {
                generate: self.generate_radius,
                send: self.send_radius,
            });
        }
        if self.max_simultaneous_transfers == 0 {
            return Err(ConfigError::ZeroLimit("max_simultaneous_transfers"));
        }
        if self.limited_simultaneous_transfers == 0 {
            return Err(ConfigError::ZeroLimit("limited_simultaneous_transfers"));
        }
        if self.emerge_queue_limit == 0 {
            return Err(ConfigError::ZeroLimit("emerge_queue_limit"));
        }
        if self.emerge_workers == 0 {
            return Err(ConfigError::ZeroLimit("emerge_workers"));
        }
        for (field, value) in [
            ("fov_radians", self.fov_radians),
            ("post_edit_cooldown_seconds", self.post_edit_cooldown_seconds),
            ("far_weight", self.far_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidFloat { field, value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.send_radius, 10);
        assert_eq!(config.generate_radius, 6);
        assert_eq!(config.max_simultaneous_transfers, 40);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = StreamConfig::from_json_str(r#"{ "send_radius": 4, "generate_radius": 2 }"#)
            .unwrap();
        assert_eq!(config.send_radius, 4);
        assert_eq!(config.generate_radius, 2);
        assert_eq!(config.far_weight, 3.0);
        assert!(config.occlusion_culling_enabled);
    }

    #[test]
    fn generate_beyond_send_is_rejected() {
        let err = StreamConfig::from_json_str(r#"{ "send_radius": 3, "generate_radius": 5 }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::GenerateBeyondSend { generate: 5, send: 3 }));
    }

    #[test]
    fn bad_values_are_rejected() {
        let negative = StreamConfig {
            send_radius: -1,
            generate_radius: -2,
            ..StreamConfig::default()
        };
        assert!(matches!(negative.validate(), Err(ConfigError::NegativeRadius { .. })));

        let negative_far = StreamConfig {
            far_send_radius: -3,
            ..StreamConfig::default()
        };
        assert!(matches!(
            negative_far.validate(),
            Err(ConfigError::NegativeRadius { field: "far_send_radius", value: -3 })
        ));

        let zero_cap = StreamConfig {
            max_simultaneous_transfers: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(zero_cap.validate(), Err(ConfigError::ZeroLimit(_))));

        let nan_fov = StreamConfig {
            fov_radians: f32::NAN,
            ..StreamConfig::default()
        };
        assert!(matches!(nan_fov.validate(), Err(ConfigError::InvalidFloat { .. })));
    }

    #[test]
    fn json_round_trip_keeps_settings() {
        let config = StreamConfig {
            send_radius: 7,
            fov_radians: 0.0,
            ..StreamConfig::default()
        };
        let json = config.to_json_pretty().unwrap();
        assert_eq!(StreamConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            StreamConfig::from_json_str("{ send_radius: "),
            Err(ConfigError::Json(_))
        ));
    }
}
