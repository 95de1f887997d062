//! Driver values and the authoritative/shadow diff table.
//!
//! Every node carries two copies of its driver list: the authoritative values
//! the integration has set, and the shadow values that were last confirmed as
//! published. A status update goes out only when the two disagree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of measure code, as understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uom(pub u16);

impl Uom {
    pub const BOOLEAN: Uom = Uom(2);
    pub const CELSIUS: Uom = Uom(4);
    pub const FAHRENHEIT: Uom = Uom(17);
    pub const INDEX: Uom = Uom(25);
    pub const PERCENT: Uom = Uom(51);
    pub const RAW: Uom = Uom(56);
    pub const ON_OFF: Uom = Uom(78);
}

impl fmt::Display for Uom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Driver value: numeric or textual on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DriverValue {
    Number(serde_json::Number),
    Bool(bool),
    Text(String),
}

impl DriverValue {
    /// Text form used both for diffing and for the outbound `status` value.
    ///
    /// Integral floats collapse to their integer form so that `1`, `1.0`
    /// and `"1"` compare equal.
    pub fn normalized(&self) -> String {
        match self {
            Self::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.to_string()
                } else if let Some(u) = n.as_u64() {
                    u.to_string()
                } else {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                        (f as i64).to_string()
                    } else {
                        f.to_string()
                    }
                }
            }
            Self::Bool(b) => b.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for DriverValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

macro_rules! driver_value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for DriverValue {
            fn from(v: $t) -> Self {
                Self::Number(serde_json::Number::from(v))
            }
        })*
    };
}

driver_value_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<f64> for DriverValue {
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v)
            .map(Self::Number)
            .unwrap_or_else(|| Self::Text(v.to_string()))
    }
}

impl From<f32> for DriverValue {
    fn from(v: f32) -> Self {
        Self::from(v as f64)
    }
}

impl From<bool> for DriverValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for DriverValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for DriverValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A single named state value on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    /// Driver id, e.g. `ST` or `GV1`
    #[serde(rename = "driver")]
    pub id: String,
    pub value: DriverValue,
    pub uom: Uom,
}

impl Driver {
    pub fn new(id: impl Into<String>, value: impl Into<DriverValue>, uom: Uom) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            uom,
        }
    }

    /// True if value or unit differ from `other`.
    pub fn differs_from(&self, other: &Driver) -> bool {
        self.uom != other.uom || self.value.normalized() != other.value.normalized()
    }
}

/// Authoritative driver list plus the shadow used as the publish baseline.
///
/// Both lists always carry the same set of driver ids.
#[derive(Debug, Clone, Default)]
pub struct DriverTable {
    current: Vec<Driver>,
    shadow: Vec<Driver>,
}

impl DriverTable {
    pub fn new(drivers: Vec<Driver>) -> Self {
        Self {
            shadow: drivers.clone(),
            current: drivers,
        }
    }

    pub fn current(&self) -> &[Driver] {
        &self.current
    }

    pub fn shadow(&self) -> &[Driver] {
        &self.shadow
    }

    pub fn get(&self, id: &str) -> Option<&Driver> {
        self.current.iter().find(|d| d.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Update the authoritative entry. Returns false for an unknown id.
    pub fn set(&mut self, id: &str, value: DriverValue, uom: Option<Uom>) -> bool {
        match self.current.iter_mut().find(|d| d.id == id) {
            Some(driver) => {
                driver.value = value;
                if let Some(uom) = uom {
                    driver.uom = uom;
                }
                true
            }
            None => false,
        }
    }

    /// Decide whether `id` needs publishing; does not touch the shadow.
    pub fn pending_report(&self, id: &str, force: bool) -> Option<Driver> {
        let current = self.get(id)?;
        let shadow = self.shadow.iter().find(|d| d.id == id)?;
        if force || current.differs_from(shadow) {
            Some(current.clone())
        } else {
            None
        }
    }

    /// Record `driver` as published.
    pub fn confirm(&mut self, driver: &Driver) {
        if let Some(shadow) = self.shadow.iter_mut().find(|d| d.id == driver.id) {
            shadow.value = driver.value.clone();
            shadow.uom = driver.uom;
        }
    }

    /// Copy the full authoritative list into the shadow and return it.
    pub fn resync(&mut self) -> Vec<Driver> {
        self.shadow = self.current.clone();
        self.current.clone()
    }

    /// Overwrite authoritative values with remotely recorded ones.
    ///
    /// Only ids this table already knows are taken; the shadow is left alone.
    pub fn seed(&mut self, recorded: &[Driver]) -> usize {
        let mut seeded = 0;
        for remote in recorded {
            if let Some(local) = self.current.iter_mut().find(|d| d.id == remote.id) {
                local.value = remote.value.clone();
                local.uom = remote.uom;
                seeded += 1;
            }
        }
        seeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> DriverTable {
        DriverTable::new(vec![
            Driver::new("ST", 0, Uom::BOOLEAN),
            Driver::new("GV1", 21.5, Uom::CELSIUS),
        ])
    }

    #[test]
    fn test_normalized_collapses_integral_values() {
        assert_eq!(DriverValue::from(1).normalized(), "1");
        assert_eq!(DriverValue::from(1.0).normalized(), "1");
        assert_eq!(DriverValue::from(" 1 ").normalized(), "1");
        assert_eq!(DriverValue::from(21.5).normalized(), "21.5");
    }

    #[test]
    fn test_wire_shape() {
        let driver: Driver =
            serde_json::from_value(json!({"driver": "ST", "value": "42", "uom": 51})).unwrap();
        assert_eq!(driver.id, "ST");
        assert_eq!(driver.uom, Uom::PERCENT);
        assert_eq!(driver.value, DriverValue::Text("42".into()));

        let back = serde_json::to_value(Driver::new("ST", 1, Uom::BOOLEAN)).unwrap();
        assert_eq!(back, json!({"driver": "ST", "value": 1, "uom": 2}));
    }

    #[test]
    fn test_pending_report_only_on_change() {
        let mut t = table();
        assert!(t.pending_report("ST", false).is_none());

        assert!(t.set("ST", 1.into(), None));
        let report = t.pending_report("ST", false).unwrap();
        t.confirm(&report);
        assert!(t.pending_report("ST", false).is_none());
        assert!(t.pending_report("ST", true).is_some());
    }

    #[test]
    fn test_unit_change_is_a_change() {
        let mut t = table();
        t.set("GV1", 21.5.into(), Some(Uom::FAHRENHEIT));
        assert!(t.pending_report("GV1", false).is_some());
    }

    #[test]
    fn test_unknown_id() {
        let mut t = table();
        assert!(!t.set("XX", 1.into(), None));
        assert!(t.pending_report("XX", true).is_none());
        assert_eq!(t.current().len(), 2);
    }

    #[test]
    fn test_seed_leaves_shadow() {
        let mut t = table();
        let seeded = t.seed(&[
            Driver::new("ST", 1, Uom::BOOLEAN),
            Driver::new("ZZ", 9, Uom::RAW),
        ]);
        assert_eq!(seeded, 1);
        assert_eq!(t.get("ST").unwrap().value.normalized(), "1");
        assert_eq!(t.shadow()[0].value.normalized(), "0");
        assert_eq!(t.resync().len(), 2);
        assert_eq!(t.shadow()[0].value.normalized(), "1");
    }
}
