use std::path::Path;
use std::str::FromStr;

use configparser::ini::Ini;
use thiserror::Error;

use crate::coord::{CoordError, GeoBoundingBox, MAX_ZOOM};

const SECTION: &str = "config";
const PROVIDERS_SECTION: &str = "providers";
const TILE_CODE_MODE: &str = "TILE_CODE";

/// Number of positional arguments that replace the config file.
pub const POSITIONAL_ARGS: usize = 8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Load(String),

    #[error("Missing required config value '{0}'")]
    Missing(String),

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error(transparent)]
    Coordinate(#[from] CoordError),
}

/// Inclusive tile-number rectangle given directly by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRange {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// How the request area is expressed.
#[derive(Clone, Debug, PartialEq)]
pub enum Mode {
    /// Explicit tile numbers, reused for every zoom.
    TileCode(TileRange),
    /// A geographic box, partitioned per zoom.
    LatLng(GeoBoundingBox),
}

/// Settings for one run. Not modified once the run starts.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectConfig {
    pub project: String,
    pub provider: String,
    /// Base name of the mosaic files.
    pub output: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub slice_level: u8,
    pub slice_step: f64,
    pub workers: usize,
    pub mode: Mode,
    /// `[providers]` entries layered over the built-in table.
    pub extra_providers: Vec<(String, String)>,
}

impl ProjectConfig {
    /// Reads `[config]` (and optionally `[providers]`) from an INI file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_ini(&ini)
    }

    /// Parses INI text, as found in a config file.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.read(text.to_string()).map_err(ConfigError::Load)?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mode_name = required(ini, "mode")?;
        let mode = if mode_name.eq_ignore_ascii_case(TILE_CODE_MODE) {
            let range = TileRange {
                left: parse_key(ini, "nw_lng")?,
                right: parse_key(ini, "se_lng")?,
                top: parse_key(ini, "nw_lat")?,
                bottom: parse_key(ini, "se_lat")?,
            };
            if range.right < range.left || range.bottom < range.top {
                return Err(CoordError::InvalidCoordinate(format!(
                    "tile range left={} right={} top={} bottom={} is inverted",
                    range.left, range.right, range.top, range.bottom
                ))
                .into());
            }
            Mode::TileCode(range)
        } else {
            Mode::LatLng(GeoBoundingBox::new(
                parse_key(ini, "nw_lat")?,
                parse_key(ini, "se_lat")?,
                parse_key(ini, "se_lng")?,
                parse_key(ini, "nw_lng")?,
            )?)
        };

        let extra_providers = ini
            .get_map_ref()
            .get(PROVIDERS_SECTION)
            .map(|entries| {
                let mut entries: Vec<(String, String)> = entries
                    .iter()
                    .filter_map(|(id, template)| Some((id.clone(), template.clone()?)))
                    .collect();
                entries.sort();
                entries
            })
            .unwrap_or_default();

        let config = Self {
            project: required(ini, "project")?,
            provider: required(ini, "map_type")?,
            output: required(ini, "mixture")?,
            min_zoom: parse_key(ini, "min_zoom")?,
            max_zoom: parse_key(ini, "max_zoom")?,
            slice_level: parse_key(ini, "slice_level")?,
            slice_step: parse_key(ini, "slice_step")?,
            workers: parse_key(ini, "process_num")?,
            mode,
            extra_providers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a lat/lng config from
    /// `nw_lat nw_lng se_lat se_lng min_zoom max_zoom project map_type`.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        if args.len() != POSITIONAL_ARGS {
            return Err(ConfigError::Invalid {
                key: "arguments".to_string(),
                reason: format!("expected {} values, got {}", POSITIONAL_ARGS, args.len()),
            });
        }
        let bbox = GeoBoundingBox::new(
            parse_value("nw_lat", &args[0])?,
            parse_value("se_lat", &args[2])?,
            parse_value("se_lng", &args[3])?,
            parse_value("nw_lng", &args[1])?,
        )?;
        let config = Self {
            project: args[6].clone(),
            provider: args[7].clone(),
            output: "mosaic".to_string(),
            min_zoom: parse_value("min_zoom", &args[4])?,
            max_zoom: parse_value("max_zoom", &args[5])?,
            slice_level: 11,
            slice_step: 1.0,
            workers: 4,
            mode: Mode::LatLng(bbox),
            extra_providers: Vec::new(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_name("project", &self.project)?;
        check_name("mixture", &self.output)?;
        if self.provider.trim().is_empty() {
            return Err(invalid("map_type", "must not be empty"));
        }
        if self.max_zoom > MAX_ZOOM {
            return Err(invalid("max_zoom", format!("must be at most {}", MAX_ZOOM)));
        }
        if self.min_zoom > self.max_zoom {
            return Err(invalid(
                "min_zoom",
                format!("{} is above max_zoom {}", self.min_zoom, self.max_zoom),
            ));
        }
        if !self.slice_step.is_finite() || self.slice_step <= 0.0 {
            return Err(invalid("slice_step", "must be a positive number of degrees"));
        }
        if self.workers == 0 {
            return Err(invalid("process_num", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Names end up as path components, so they must stay a single component.
fn check_name(key: &str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(invalid(key, "must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(invalid(key, format!("'{}' is not a plain file name", name)));
    }
    Ok(())
}

fn required(ini: &Ini, key: &str) -> Result<String, ConfigError> {
    ini.get(SECTION, key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Missing(key.to_uppercase()))
}

fn parse_key<T: FromStr>(ini: &Ini, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    parse_value(&key.to_uppercase(), &required(ini, key)?)
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, format!("'{}': {}", value, e)))
}
