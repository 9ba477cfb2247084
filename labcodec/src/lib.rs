//! Self-describing value encoding for RPC arguments and replies.
//!
//! This plays the role the original ecosystem's `gob`-style encoder plays:
//! a wire record only round-trips correctly if every field the caller cares
//! about would actually survive a reflection-based encoder. We can't do
//! runtime reflection over arbitrary Rust structs, so each wire type
//! declares its field names once via [`Codable::FIELDS`], and `encode`
//! checks them the same way the original encoder checked capitalization.

#[macro_use]
extern crate log;

mod error;

use std::collections::HashSet;
use std::sync::Mutex;

pub use error::{Error, Result};

use serde::de::DeserializeOwned;
use serde::Serialize;

lazy_static::lazy_static! {
    static ref WARNED_FIELDS: Mutex<HashSet<(&'static str, &'static str)>> = Mutex::new(HashSet::new());
    static ref WARNED_DEFAULTS: Mutex<HashSet<&'static str>> = Mutex::new(HashSet::new());
}

/// A value that can cross the wire.
///
/// `FIELDS` lists the names the value's fields would carry in a
/// reflection-based encoder. A field name is "invisible to the encoder" if
/// it isn't capitalized, mirroring the original ecosystem's convention that
/// only exported (capitalized) struct fields survive RPC/persistence
/// encoding; passing a lower-case name here is always a copy/paste bug in
/// the struct definition, never a real ecosystem constraint in Rust, but we
/// keep the check because it's what the teaching material tests for.
pub trait Codable {
    const NAME: &'static str;
    const FIELDS: &'static [&'static str];
}

fn check_fields<T: Codable>() {
    for &field in T::FIELDS {
        let key = (T::NAME, field);
        let starts_upper = field.chars().next().map_or(true, |c| c.is_ascii_uppercase());
        if starts_upper {
            continue;
        }
        let mut warned = WARNED_FIELDS.lock().unwrap();
        if warned.insert(key) {
            warn!(
                "labcodec: lower-case field `{}` on `{}` is invisible to the encoder and will not round-trip",
                field, T::NAME
            );
        }
    }
}

/// Encodes `value` into `buf`, appending to whatever was already there.
///
/// Performs the field-name visibility check described on [`Codable`] before
/// serializing.
pub fn encode<T>(value: &T, buf: &mut Vec<u8>) -> Result<()>
where
    T: Codable + Serialize,
{
    check_fields::<T>();
    let mut encoded = bincode::serialize(value).map_err(Error::Encode)?;
    buf.append(&mut encoded);
    Ok(())
}

/// Decodes a fresh `T` from `buf`.
///
/// Since the target is always `T::default()` before decoding, this never
/// trips the "decoding into a non-default value" diagnostic; use
/// [`decode_into`] when reusing a target across calls is desired and you
/// want that diagnostic enforced.
pub fn decode<T>(buf: &[u8]) -> Result<T>
where
    T: Codable + DeserializeOwned + Default + PartialEq,
{
    let mut target = T::default();
    decode_into(buf, &mut target)?;
    Ok(target)
}

/// Decodes `buf` into `target`, warning once (per type) if `target` already
/// held a non-default value. This is the diagnostic the original ecosystem
/// raises when a caller decodes into a struct that already carries state
/// from a previous round, since the encoder never transmits default-valued
/// fields and the stale data would silently leak through.
pub fn decode_into<T>(buf: &[u8], target: &mut T) -> Result<()>
where
    T: Codable + DeserializeOwned + Default + PartialEq,
{
    if *target != T::default() {
        let mut warned = WARNED_DEFAULTS.lock().unwrap();
        if warned.insert(T::NAME) {
            warn!(
                "labcodec: decoding into a non-default value of `{}` may not work",
                T::NAME
            );
        }
    }
    *target = bincode::deserialize(buf).map_err(Error::Decode)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Default, PartialEq, Debug, Serialize, Deserialize)]
    struct Point {
        x: i64,
        y: i64,
    }

    impl Codable for Point {
        const NAME: &'static str = "Point";
        const FIELDS: &'static [&'static str] = &["X", "Y"];
    }

    #[derive(Default, PartialEq, Debug, Serialize, Deserialize)]
    struct BadField {
        value: i64,
    }

    impl Codable for BadField {
        const NAME: &'static str = "BadField";
        const FIELDS: &'static [&'static str] = &["value"];
    }

    #[test]
    fn round_trips() {
        let p = Point { x: 3, y: 4 };
        let mut buf = Vec::new();
        encode(&p, &mut buf).unwrap();
        let decoded: Point = decode(&buf).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn decode_into_overwrites_stale_target() {
        let p = Point { x: 1, y: 2 };
        let mut buf = Vec::new();
        encode(&p, &mut buf).unwrap();
        let mut target = Point { x: 9, y: 9 };
        decode_into(&buf, &mut target).unwrap();
        assert_eq!(target, p);
    }

    #[test]
    fn lower_case_field_does_not_prevent_round_trip() {
        let b = BadField { value: 42 };
        let mut buf = Vec::new();
        encode(&b, &mut buf).unwrap();
        let decoded: BadField = decode(&buf).unwrap();
        assert_eq!(b, decoded);
    }
}
