use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
    de,
};
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// Number of reservation slots the store contract keeps.
pub const RESERVATION_SLOTS: usize = 16;

/// Seconds after which the contract stops honouring a reservation.
pub const RESERVATION_WINDOW_SECS: u64 = 120;

pub const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;
const ETHER_DECIMALS: usize = 18;

/// Native-token amount in wei.
pub type Wei = u128;

#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    /// The "no owner" / "no reserver" sentinel.
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// `0x1234…abcd`, for narrow columns.
    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}…{}", &full[..6], &full[full.len() - 4..])
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseAddressError {
    #[error("address must be 40 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("address contains non-hex characters")]
    InvalidHex,
}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 40 {
            return Err(ParseAddressError::InvalidLength(digits.len()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| ParseAddressError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Reservation record for one slot. A zero reserver or a zero timestamp
/// means the slot holds no reservation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Reservation {
    pub ticket: usize,
    pub reserver: Address,
    pub timestamp: u64,
}

impl Reservation {
    pub fn is_empty(&self) -> bool {
        self.reserver.is_zero()
    }

    /// `true` once the contract no longer honours the hold.
    pub fn has_expired(&self, now: u64) -> bool {
        self.timestamp != 0 && now.saturating_sub(self.timestamp) > RESERVATION_WINDOW_SECS
    }

    pub fn is_live(&self, now: u64) -> bool {
        !self.reserver.is_zero() && self.timestamp != 0 && !self.has_expired(now)
    }

    /// `None` without a hold, or when the expiry does not fit a `u64`.
    pub fn expires_at(&self) -> Option<u64> {
        if self.timestamp == 0 {
            return None;
        }
        self.timestamp.checked_add(RESERVATION_WINDOW_SECS)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ContractBalances {
    pub real_balance: Wei,
    pub balance_wei: Wei,
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseAmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount `{0}` is not a decimal number")]
    Invalid(String),
    #[error("amount has more than 18 decimal places")]
    TooPrecise,
    #[error("amount is too large")]
    Overflow,
}

/// Parses an ether-denominated decimal string (`"0.01"`) into wei.
pub fn parse_ether(input: &str) -> Result<Wei, ParseAmountError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseAmountError::Empty);
    }
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction)
    {
        return Err(ParseAmountError::Invalid(trimmed.to_string()));
    }
    if fraction.len() > ETHER_DECIMALS {
        return Err(ParseAmountError::TooPrecise);
    }

    let whole_wei = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| ParseAmountError::Overflow)?
            .checked_mul(WEI_PER_ETHER)
            .ok_or(ParseAmountError::Overflow)?
    };
    let fraction_wei = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{fraction:0<width$}", width = ETHER_DECIMALS);
        padded
            .parse::<u128>()
            .map_err(|_| ParseAmountError::Invalid(trimmed.to_string()))?
    };
    whole_wei
        .checked_add(fraction_wei)
        .ok_or(ParseAmountError::Overflow)
}

/// Formats wei as an ether decimal without trailing zeros.
pub fn format_ether(wei: Wei) -> String {
    let whole = wei / WEI_PER_ETHER;
    let fraction = wei % WEI_PER_ETHER;
    if fraction == 0 {
        whole.to_string()
    } else {
        let digits = format!("{fraction:018}");
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }
}
