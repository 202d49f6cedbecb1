//! Environment variable overrides
//!
//! Runtime settings carry compile-time defaults that can be overridden
//! with `STRAND_*` environment variables. All lookups go through one
//! generic parser: [`env_get`] falls back to the default on an unset or
//! unparsable value, [`env_get_opt`] surfaces the miss. Booleans accept
//! the usual switch words (`1/true/yes/on`, `0/false/no/off`) rather
//! than bare `FromStr`.

use std::str::FromStr;

/// Types that can be read from an override variable.
pub trait EnvParse: Sized {
    fn parse_env(raw: &str) -> Option<Self>;
}

impl EnvParse for bool {
    fn parse_env(raw: &str) -> Option<bool> {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl EnvParse for String {
    fn parse_env(raw: &str) -> Option<String> {
        Some(raw.to_string())
    }
}

macro_rules! env_parse_numeric {
    ($($t:ty)*) => {$(
        impl EnvParse for $t {
            fn parse_env(raw: &str) -> Option<Self> {
                <$t as FromStr>::from_str(raw).ok()
            }
        }
    )*};
}

env_parse_numeric!(u16 u32 u64 usize i16 i32 i64);

/// Read `key`, or return the default when it is unset or does not
/// parse as `T`.
#[inline]
pub fn env_get<T: EnvParse>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Read `key` if it is set and parses as `T`. Surrounding whitespace
/// is ignored.
pub fn env_get_opt<T: EnvParse>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    T::parse_env(raw.trim())
}
