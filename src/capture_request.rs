use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("value is empty")]
    Empty,

    #[error("'{0}' is not a whole number")]
    NotNumeric(String),

    #[error("'{0}' is too large")]
    OutOfRange(String),
}

fn parse_whole_number(text: &str) -> Result<u32, FieldError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(FieldError::Empty);
    }
    if !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(FieldError::NotNumeric(text.to_string()));
    }
    text.parse()
        .map_err(|_| FieldError::OutOfRange(text.to_string()))
}

/// Colour temperature of the illuminant, in kelvin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Temperature(u32);

impl Temperature {
    pub fn kelvin(&self) -> u32 {
        self.0
    }
}

impl FromStr for Temperature {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_whole_number(s).map(Temperature)
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Illuminance at the chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lux(u32);

impl FromStr for Lux {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_whole_number(s).map(Lux)
    }
}

impl fmt::Display for Lux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureCategory {
    Macbeth,
    LensShading,
    ChromaticAberration,
}

impl CaptureCategory {
    pub fn all() -> &'static [CaptureCategory] {
        &[
            CaptureCategory::Macbeth,
            CaptureCategory::LensShading,
            CaptureCategory::ChromaticAberration,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            CaptureCategory::Macbeth => "Macbeth",
            CaptureCategory::LensShading => "Lens shading",
            CaptureCategory::ChromaticAberration => "Cac",
        }
    }
}

/// A capture the user is allowed to make: every field has already been
/// checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    Macbeth { temperature: Temperature, lux: Lux },
    LensShading { temperature: Temperature },
    ChromaticAberration,
}

impl CaptureRequest {
    pub fn macbeth(temperature: &str, lux: &str) -> Result<Self, FieldError> {
        Ok(CaptureRequest::Macbeth {
            temperature: temperature.parse()?,
            lux: lux.parse()?,
        })
    }

    pub fn lens_shading(temperature: &str) -> Result<Self, FieldError> {
        Ok(CaptureRequest::LensShading {
            temperature: temperature.parse()?,
        })
    }

    pub fn category(&self) -> CaptureCategory {
        match self {
            CaptureRequest::Macbeth { .. } => CaptureCategory::Macbeth,
            CaptureRequest::LensShading { .. } => CaptureCategory::LensShading,
            CaptureRequest::ChromaticAberration => CaptureCategory::ChromaticAberration,
        }
    }
}

pub fn macbeth_file_name(temperature: Temperature, lux: Lux) -> String {
    format!("{}K_{}L.dng", temperature, lux)
}

pub fn lens_shading_file_name(temperature: Temperature, index: u32) -> String {
    format!("alsc_{}K_{}.dng", temperature, index)
}

pub fn cac_file_name(index: u32) -> String {
    format!("cac_chart{}.dng", index)
}
