//! Background color parsing and canonical keys
//!
//! Accepted notations: `#rgb`, `#rgba`, `#rrggbb`, `#rrggbbaa`,
//! `rgb(r, g, b)`, `rgba(r, g, b, a)` and a small set of CSS color names.
//! Parse failures never surface: they normalize to white.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use log::warn;

/// Straight (non-premultiplied) RGBA color
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ColorParseError {
    #[error("empty color value")]
    Empty,

    #[error("invalid hex color '{0}'")]
    Hex(String),

    #[error("invalid functional color '{0}'")]
    Functional(String),

    #[error("unknown color name '{0}'")]
    UnknownName(String),
}

const NAMED: &[(&str, Rgba)] = &[
    ("white", Rgba::opaque(0xff, 0xff, 0xff)),
    ("black", Rgba::opaque(0x00, 0x00, 0x00)),
    ("red", Rgba::opaque(0xff, 0x00, 0x00)),
    ("green", Rgba::opaque(0x00, 0x80, 0x00)),
    ("lime", Rgba::opaque(0x00, 0xff, 0x00)),
    ("blue", Rgba::opaque(0x00, 0x00, 0xff)),
    ("yellow", Rgba::opaque(0xff, 0xff, 0x00)),
    ("cyan", Rgba::opaque(0x00, 0xff, 0xff)),
    ("magenta", Rgba::opaque(0xff, 0x00, 0xff)),
    ("gray", Rgba::opaque(0x80, 0x80, 0x80)),
    ("grey", Rgba::opaque(0x80, 0x80, 0x80)),
    ("silver", Rgba::opaque(0xc0, 0xc0, 0xc0)),
    ("orange", Rgba::opaque(0xff, 0xa5, 0x00)),
    ("purple", Rgba::opaque(0x80, 0x00, 0x80)),
    ("navy", Rgba::opaque(0x00, 0x00, 0x80)),
    ("teal", Rgba::opaque(0x00, 0x80, 0x80)),
    ("maroon", Rgba::opaque(0x80, 0x00, 0x00)),
    ("olive", Rgba::opaque(0x80, 0x80, 0x00)),
    ("transparent", Rgba::new(0x00, 0x00, 0x00, 0x00)),
];

impl Rgba {
    pub const WHITE: Rgba = Rgba::opaque(0xff, 0xff, 0xff);

    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    #[must_use]
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 0xff)
    }

    pub fn parse(input: &str) -> Result<Self, ColorParseError> {
        let value = input.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(ColorParseError::Empty);
        }

        if let Some(hex) = value.strip_prefix('#') {
            return parse_hex(hex).ok_or(ColorParseError::Hex(value.clone()));
        }

        if let Some(args) = value
            .strip_prefix("rgba(")
            .or_else(|| value.strip_prefix("rgb("))
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return parse_functional(args).ok_or(ColorParseError::Functional(value.clone()));
        }

        NAMED
            .iter()
            .find(|(name, _)| *name == value)
            .map(|(_, color)| *color)
            .ok_or(ColorParseError::UnknownName(value))
    }

    /// Canonical lowercase hex; alpha is appended only when not opaque
    #[must_use]
    pub fn hex(self) -> String {
        if self.a == 0xff {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!(
                "#{:02x}{:02x}{:02x}{:02x}",
                self.r, self.g, self.b, self.a
            )
        }
    }

    #[must_use]
    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn parse_hex(hex: &str) -> Option<Rgba> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let nibble = |i: usize| u8::from_str_radix(&hex[i..=i], 16).ok().map(|v| v * 17);
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();

    match hex.len() {
        3 => Some(Rgba::opaque(nibble(0)?, nibble(1)?, nibble(2)?)),
        4 => Some(Rgba::new(nibble(0)?, nibble(1)?, nibble(2)?, nibble(3)?)),
        6 => Some(Rgba::opaque(byte(0)?, byte(2)?, byte(4)?)),
        8 => Some(Rgba::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
        _ => None,
    }
}

fn parse_functional(args: &str) -> Option<Rgba> {
    let parts: Vec<&str> = args
        .split(|c: char| c == ',' || c == '/' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect();

    if parts.len() != 3 && parts.len() != 4 {
        return None;
    }

    let channel = |s: &str| -> Option<u8> {
        let v: f64 = s.parse().ok()?;
        (0.0..=255.0).contains(&v).then(|| v.round() as u8)
    };

    let alpha = match parts.get(3) {
        Some(s) => {
            let v: f64 = s.parse().ok()?;
            if !(0.0..=1.0).contains(&v) {
                return None;
            }
            (v * 255.0).round() as u8
        }
        None => 0xff,
    };

    Some(Rgba::new(
        channel(parts[0])?,
        channel(parts[1])?,
        channel(parts[2])?,
        alpha,
    ))
}

/// Background inputs already reported as unparseable
static REPORTED: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// True the first time `input` is seen
fn first_report(input: &str) -> bool {
    let mut reported = REPORTED.lock().unwrap_or_else(PoisonError::into_inner);
    !reported.contains(input) && reported.insert(input.to_string())
}

/// Canonical color identity used to key rendered-image variants
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackgroundKey {
    hex: Arc<str>,
    color: Rgba,
}

impl BackgroundKey {
    /// Normalize any color notation; unparseable input maps to white
    #[must_use]
    pub fn normalize(input: &str) -> Self {
        match Rgba::parse(input) {
            Ok(color) => Self::from_color(color),
            Err(e) => {
                if first_report(input) {
                    warn!("Background {input:?} not understood ({e}), using white");
                }
                Self::white()
            }
        }
    }

    #[must_use]
    pub fn from_color(color: Rgba) -> Self {
        Self {
            hex: color.hex().into(),
            color,
        }
    }

    #[must_use]
    pub fn white() -> Self {
        Self::from_color(Rgba::WHITE)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    #[must_use]
    pub fn color(&self) -> Rgba {
        self.color
    }
}

impl fmt::Display for BackgroundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}
