use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Currencies accepted for donations. Stored and transmitted as ISO 4217 codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Currency {
    Rub,
    Kzt,
    Usd,
    Eur,
}

impl Currency {
    /// Number of decimal places in one major unit.
    pub fn minor_exponent(&self) -> u32 {
        match self {
            Currency::Rub | Currency::Kzt | Currency::Usd | Currency::Eur => 2,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
