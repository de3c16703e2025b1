//! Physical unit parsing.
//!
//! Resolves unit descriptors such as `"degC"`, `"kilometer"` or `"kPa"` into a
//! normalized `(prefix, symbol)` pair. The formatter renders the pair as a
//! single string (`"km"`, `"degC"`) and falls back to `"null"` when a unit is
//! not supported.

use thiserror::Error;

/// The requested unit has no known SI (or accepted non-SI) representation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported unit: '{0}'")]
pub struct UnsupportedUnitError(pub String);

/// A unit split into its decimal prefix and base symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedUnit {
    /// Prefix symbol (e.g. `"k"`, `"m"`), absent for unprefixed units.
    pub prefix: Option<&'static str>,
    /// Unit symbol (e.g. `"m"`, `"degC"`).
    pub symbol: &'static str,
}

impl ParsedUnit {
    /// Prefix and symbol concatenated (`"km"`).
    pub fn normalized(&self) -> String {
        match self.prefix {
            Some(prefix) => format!("{prefix}{}", self.symbol),
            None => self.symbol.to_string(),
        }
    }
}

/// Collaborator that resolves unit descriptors.
pub trait UnitParser: Send + Sync + 'static {
    /// Parse a unit descriptor.
    ///
    /// # Errors
    /// Returns `UnsupportedUnitError` if the descriptor is not recognized.
    fn parse(&self, unit: &str) -> Result<ParsedUnit, UnsupportedUnitError>;
}

/// (name, symbol) of every decimal SI prefix.
const PREFIXES: &[(&str, &str)] = &[
    ("yotta", "Y"),
    ("zetta", "Z"),
    ("exa", "E"),
    ("peta", "P"),
    ("tera", "T"),
    ("giga", "G"),
    ("mega", "M"),
    ("kilo", "k"),
    ("hecto", "h"),
    ("deca", "da"),
    ("deci", "d"),
    ("centi", "c"),
    ("milli", "m"),
    ("micro", "u"),
    ("nano", "n"),
    ("pico", "p"),
    ("femto", "f"),
    ("atto", "a"),
    ("zepto", "z"),
    ("yocto", "y"),
];

/// Supported units: (symbol, accepted names, accepts prefixes).
const UNITS: &[(&str, &[&str], bool)] = &[
    // Base units
    ("m", &["meter", "metre"], true),
    ("g", &["gram"], true),
    ("s", &["second", "sec"], true),
    ("A", &["ampere", "amp"], true),
    ("K", &["kelvin"], true),
    ("mol", &["mole"], true),
    ("cd", &["candela"], true),
    // Derived units
    ("Hz", &["hertz"], true),
    ("N", &["newton"], true),
    ("Pa", &["pascal"], true),
    ("J", &["joule"], true),
    ("W", &["watt"], true),
    ("C", &["coulomb"], true),
    ("V", &["volt"], true),
    ("F", &["farad"], true),
    ("ohm", &["ohm"], true),
    ("S", &["siemens"], true),
    ("Wb", &["weber"], true),
    ("T", &["tesla"], true),
    ("H", &["henry"], true),
    ("lm", &["lumen"], true),
    ("lx", &["lux"], true),
    ("rad", &["radian"], false),
    ("sr", &["steradian"], false),
    ("degC", &["degree_Celsius", "celsius", "degree_celsius"], false),
    // Accepted non-SI units
    ("L", &["liter", "litre"], true),
    ("B", &["byte"], true),
    ("bit", &["bit"], true),
    ("min", &["minute"], false),
    ("h", &["hour"], false),
    ("d", &["day"], false),
    ("percent", &["percent", "%"], false),
    ("degF", &["degree_Fahrenheit", "fahrenheit"], false),
];

/// Parser for SI base/derived units with decimal prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiUnitParser;

impl SiUnitParser {
    fn exact(unit: &str) -> Option<&'static str> {
        UNITS
            .iter()
            .find(|(symbol, names, _)| *symbol == unit || names.contains(&unit))
            .map(|(symbol, _, _)| *symbol)
    }

    fn prefixable(unit: &str, by_name: bool) -> Option<&'static str> {
        UNITS
            .iter()
            .filter(|(_, _, prefixable)| *prefixable)
            .find(|(symbol, names, _)| {
                if by_name {
                    names.contains(&unit)
                } else {
                    *symbol == unit
                }
            })
            .map(|(symbol, _, _)| *symbol)
    }
}

impl UnitParser for SiUnitParser {
    fn parse(&self, unit: &str) -> Result<ParsedUnit, UnsupportedUnitError> {
        let unit = unit.trim();
        if unit.is_empty() {
            return Err(UnsupportedUnitError(unit.to_string()));
        }

        // Exact symbols and names win over prefix splitting ("m" is meter, not milli-).
        if let Some(symbol) = Self::exact(unit) {
            return Ok(ParsedUnit {
                prefix: None,
                symbol,
            });
        }

        for (name, prefix) in PREFIXES {
            if let Some(rest) = unit.strip_prefix(name)
                && let Some(symbol) = Self::prefixable(rest, true)
            {
                return Ok(ParsedUnit {
                    prefix: Some(*prefix),
                    symbol,
                });
            }
        }

        for (_, prefix) in PREFIXES {
            if let Some(rest) = unit.strip_prefix(prefix)
                && let Some(symbol) = Self::prefixable(rest, false)
            {
                return Ok(ParsedUnit {
                    prefix: Some(*prefix),
                    symbol,
                });
            }
        }

        Err(UnsupportedUnitError(unit.to_string()))
    }
}
