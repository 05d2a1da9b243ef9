//! Primitive types shared across the registries and engines
use super::error::MarketError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;

/// Whole carbon credits (1 credit = 1 tonne CO2e, 1 token on the ledger).
pub type Credits = u64;

/// Price in minor currency units, integers only.
pub type Price = u64;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// Panics on a date that does not exist
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    /// Offset from the current time, negative values point into the past
    pub fn days_from_now(days: i64) -> Self {
        Self(Utc::now() + Duration::days(days))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn is_future(&self) -> bool {
        self.0 > Utc::now()
    }
    /// False for stamps in the future
    pub fn older_than(&self, age: std::time::Duration) -> bool {
        (Utc::now() - self.0)
            .to_std()
            .map(|elapsed| elapsed > age)
            .unwrap_or(false)
    }
}

// `Utc` carries no ordering of its own, so derive(PartialOrd) would not apply
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    #[n(0)]
    Developer,
    #[n(1)]
    Regulator,
    #[n(2)]
    Buyer,
}

/// The authenticated caller of an operation. Authentication happens upstream,
/// the engines only evaluate authorization predicates against this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// EVM style account address, stored lowercase with the `0x` prefix
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletAddress(#[n(0)] String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, MarketError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| {
                MarketError::InvalidArgument(format!("wallet '{raw}' is missing the 0x prefix"))
            })?;

        if digits.len() != 40 {
            return Err(MarketError::InvalidArgument(format!(
                "wallet '{raw}' must hold 20 bytes of hex"
            )));
        }
        hex::decode(digits)
            .map_err(|e| MarketError::InvalidArgument(format!("wallet '{raw}': {e}")))?;

        Ok(Self(format!("0x{}", digits.to_lowercase())))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// For addresses already in canonical form, such as compiled-in defaults
    pub(crate) fn from_canonical(canonical: &'static str) -> Self {
        Self(canonical.to_string())
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a signing credential held by the token ledger backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignerId(pub String);

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
