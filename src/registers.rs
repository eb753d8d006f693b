//! The local mirror of the device register table.
use std::cell::Cell;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use tracing::{debug, trace};

use crate::lexer::Cursor;
use crate::number::{format_float, parse_float, parse_int};

/// Exclusive upper bound of the register ids the device may allocate.
pub const REGISTER_MAX: usize = 900;
/// Number of buckets in the symbol lookup cache. Must be a power of two.
pub const CACHE_SIZE: usize = 256;
/// Units at least this long are labels of an enumerated value rather than units.
const LABEL_MIN_LENGTH: usize = 7;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Mode(u8);

impl Mode {
    pub const CONFIG: Self = Self(1 << 0);
    pub const READ_ONLY: Self = Self(1 << 1);
    pub const LINKED: Self = Self(1 << 2);
    pub const TYPE_INT: Self = Self(1 << 3);
    pub const TYPE_FLOAT: Self = Self(1 << 4);
    const WIRE: Self = Self(Self::CONFIG.0 | Self::READ_ONLY.0 | Self::LINKED.0);
    const TYPE: Self = Self(Self::TYPE_INT.0 | Self::TYPE_FLOAT.0);

    /// Decode the mode digit which prefixes every register echo.
    pub const fn from_wire(digit: i32) -> Option<Self> {
        if digit < 0 || digit > Self::WIRE.0 as i32 {
            return None;
        }
        Some(Self(digit as u8))
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_writable(self) -> bool {
        !self.contains(Self::READ_ONLY)
    }
}

impl std::ops::BitOr for Mode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mode({self})")
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.contains(Self::CONFIG) { "C" } else { "-" })?;
        f.write_str(if self.contains(Self::READ_ONLY) { "R" } else { "-" })?;
        f.write_str(if self.contains(Self::LINKED) { "L" } else { "-" })?;
        f.write_str(if self.contains(Self::TYPE_INT) {
            "i"
        } else if self.contains(Self::TYPE_FLOAT) {
            "f"
        } else {
            "s"
        })
    }
}

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// The decoded value of a register, as far as it could be decoded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value<'a> {
    Int(i32),
    Float(f32),
    Text(&'a str),
}

impl std::fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => f.write_str(&format_float(n)),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl serde::Serialize for Value<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Int(n) => serializer.serialize_i32(n),
            Value::Float(n) => serializer.serialize_f32(n),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Register {
    pub symbol: String,
    pub mode: Mode,
    pub raw_value: String,
    pub unit: String,
    pub int_value: i32,
    pub float_value: f32,

    pub range_started: bool,
    pub float_min: f32,
    pub float_max: f32,
    pub float_min_text: String,
    pub float_max_text: String,

    /// Last time the embedding application displayed this register.
    pub shown: u64,
    /// Time of a local edit of `raw_value` not yet acknowledged by the device.
    pub modified: u64,
    /// Last time the device reported the value.
    pub fetched: u64,
    /// Time the outstanding request for this register was sent, or zero.
    pub queued: u64,

    pub update_interval_ms: u64,
    pub one_shot: bool,

    pub combo_values: BTreeMap<i32, String>,
    pub combo_max_index: i32,
    pub unit_variant: usize,
}

impl Register {
    pub fn is_allocated(&self) -> bool {
        !self.symbol.is_empty()
    }

    pub fn value(&self) -> Value<'_> {
        if self.mode.contains(Mode::TYPE_INT) {
            Value::Int(self.int_value)
        } else if self.mode.contains(Mode::TYPE_FLOAT) {
            Value::Float(self.float_value)
        } else {
            Value::Text(&self.raw_value)
        }
    }

    /// A local edit is waiting to be written to the device.
    pub fn is_pending_write(&self) -> bool {
        self.modified > self.fetched
    }

    /// Whether the displayed value is stale enough to ask the device for it again.
    pub fn is_due(&self, read_only_refresh_ms: u64) -> bool {
        if self.one_shot && self.fetched < self.shown {
            return true;
        }
        if self.update_interval_ms > 0 && self.fetched.saturating_add(self.update_interval_ms) < self.shown {
            return true;
        }
        self.mode.contains(Mode::READ_ONLY) && self.fetched.saturating_add(read_only_refresh_ms) < self.shown
    }

    /// Stage a new value to be committed by the scheduler.
    ///
    /// The edit always counts as newer than the last fetch, even within the same tick.
    pub fn edit(&mut self, value: &str, now: u64) {
        self.raw_value = value.to_string();
        self.modified = now.max(self.fetched.saturating_add(1));
    }

    pub fn combo_label(&self, index: i32) -> Option<&str> {
        self.combo_values.get(&index).map(String::as_str)
    }

    pub fn combo_index(&self, label: &str) -> Option<i32> {
        self.combo_values.iter().find(|(_, l)| *l == label).map(|(i, _)| *i)
    }

    pub fn reset_range(&mut self) {
        self.range_started = false;
        self.float_min = 0.0;
        self.float_max = 0.0;
        self.float_min_text.clear();
        self.float_max_text.clear();
    }

    fn track_range(&mut self) {
        let value = self.float_value;
        if !self.range_started || value < self.float_min {
            self.float_min = value;
            self.float_min_text.clone_from(&self.raw_value);
        }
        if !self.range_started || value > self.float_max {
            self.float_max = value;
            self.float_max_text.clone_from(&self.raw_value);
        }
        self.range_started = true;
    }

    fn decode(&mut self) {
        self.mode = self.mode.without(Mode::TYPE);
        if let Some(n) = parse_int(&self.raw_value) {
            self.mode = self.mode | Mode::TYPE_INT;
            self.int_value = n;
        } else if let Some(n) = parse_float(&self.raw_value) {
            self.mode = self.mode | Mode::TYPE_FLOAT;
            self.float_value = n;
            self.track_range();
        }
    }
}

/// A register echo as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment<'a> {
    pub id: usize,
    pub mode: Mode,
    pub symbol: &'a str,
    pub value: &'a str,
    pub unit: &'a str,
}

impl<'a> Assignment<'a> {
    /// Parse `<modeDigit> [<id>] <symbol> = <value> <unit>`.
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut cursor = Cursor::new(line);
        let mode = Mode::from_wire(parse_int(cursor.next_token()?)?)?;
        if !cursor.rest().starts_with('[') {
            return None;
        }
        let id = usize::try_from(parse_int(cursor.next_token()?)?).ok()?;
        if id >= REGISTER_MAX {
            return None;
        }
        let symbol = cursor.next_token()?;
        if symbol.is_empty() || cursor.next_token()? != "=" {
            return None;
        }
        let remainder = cursor.rest().trim_end_matches(['\r', '\n', ' ', '\t']);
        let value = cursor.next_token().unwrap_or("");
        let unit = cursor.next_token().unwrap_or("");
        if cursor.is_exhausted() {
            Some(Self { id, mode, symbol, value, unit })
        } else {
            Some(Self { id, mode, symbol, value: remainder, unit: "" })
        }
    }
}

pub struct RegisterTable {
    registers: Vec<Register>,
    max_n: usize,
    cache: [Cell<Option<usize>>; CACHE_SIZE],
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucket of `symbol` in the lookup cache.
pub fn hash(symbol: &str) -> usize {
    let mut h = 0u32;
    for &byte in symbol.as_bytes() {
        h = h.wrapping_add(u32::from(byte)).wrapping_mul(1149773);
        h ^= (h << 1).wrapping_add(h >> 4);
    }
    h ^= h << 15;
    ((h >> 16) as usize) & (CACHE_SIZE - 1)
}

impl RegisterTable {
    pub fn new() -> Self {
        Self {
            registers: vec![Register::default(); REGISTER_MAX],
            max_n: 0,
            cache: std::array::from_fn(|_| Cell::new(None)),
        }
    }

    /// Forget everything known about the device.
    pub fn clear(&mut self) {
        self.registers.iter_mut().for_each(|r| *r = Register::default());
        self.max_n = 0;
        self.cache.iter().for_each(|c| c.set(None));
    }

    /// Exclusive upper bound of the ids seen so far.
    pub fn max_n(&self) -> usize {
        self.max_n
    }

    pub fn get(&self, id: usize) -> Option<&Register> {
        self.registers.get(id).filter(|r| r.is_allocated())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Register> {
        self.registers.get_mut(id).filter(|r| r.is_allocated())
    }

    /// All allocated registers in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Register)> {
        self.registers[..self.max_n].iter().enumerate().filter(|(_, r)| r.is_allocated())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Register)> {
        self.registers[..self.max_n].iter_mut().enumerate().filter(|(_, r)| r.is_allocated())
    }

    pub fn lookup_id(&self, symbol: &str) -> Option<usize> {
        if symbol.is_empty() {
            return None;
        }
        let slot = &self.cache[hash(symbol)];
        if let Some(id) = slot.get() {
            if self.registers[id].symbol == symbol {
                return Some(id);
            }
        }
        let id = self.registers[..self.max_n].iter().position(|r| r.symbol == symbol)?;
        slot.set(Some(id));
        Some(id)
    }

    pub fn lookup(&self, symbol: &str) -> Option<&Register> {
        self.lookup_id(symbol).map(|id| &self.registers[id])
    }

    pub fn lookup_mut(&mut self, symbol: &str) -> Option<&mut Register> {
        let id = self.lookup_id(symbol)?;
        Some(&mut self.registers[id])
    }

    /// Find the id range of the register family whose symbols start with `prefix`.
    ///
    /// The device allocates a family contiguously, so the scan stops at the first allocated
    /// register that does not match.
    pub fn lookup_range(&self, prefix: &str) -> Option<(usize, usize)> {
        if prefix.is_empty() {
            return None;
        }
        let matches = |id: usize| self.registers[id].symbol.starts_with(prefix);
        let slot = &self.cache[hash(prefix)];
        let first = match slot.get().filter(|&id| matches(id)) {
            Some(mut id) => {
                // the slot may have been filled by a member lookup; walk back to the head
                while let Some(prev) = (0..id).rev().find(|&p| self.registers[p].is_allocated()) {
                    if !matches(prev) {
                        break;
                    }
                    id = prev;
                }
                id
            }
            None => {
                let id = (0..self.max_n).find(|&id| matches(id))?;
                slot.set(Some(id));
                id
            }
        };
        let mut last = first;
        for id in first + 1..self.max_n {
            let register = &self.registers[id];
            if !register.is_allocated() {
                continue;
            }
            if !register.symbol.starts_with(prefix) {
                break;
            }
            last = id;
        }
        Some((first, last))
    }

    /// Record a register echo.
    ///
    /// Returns `false` if the echo contradicts the symbol already known for the id.
    pub fn apply_assignment(&mut self, assignment: &Assignment<'_>, now: u64) -> bool {
        let Assignment { id, mode, symbol, value, unit } = *assignment;
        let Some(register) = self.registers.get_mut(id) else {
            return false;
        };
        if !register.is_allocated() {
            trace!(message = "new register", id, symbol);
            register.symbol = symbol.to_string();
            self.max_n = self.max_n.max(id + 1);
        } else if register.symbol != symbol {
            debug!(message = "register echo disagrees with known symbol", id, symbol, known = register.symbol.as_str());
            return false;
        }
        register.raw_value = value.to_string();
        register.unit = unit.to_string();
        register.mode = mode;
        register.decode();
        if register.mode.contains(Mode::CONFIG | Mode::TYPE_INT)
            && unit.len() >= LABEL_MIN_LENGTH
            && !register.combo_values.contains_key(&register.int_value)
        {
            register.combo_values.insert(register.int_value, unit.to_string());
            register.combo_max_index = register.combo_max_index.max(register.int_value);
        }
        register.fetched = now;
        register.queued = 0;
        register.one_shot = false;
        true
    }

    /// Request a refresh of every register, e.g. when the displayed page changes.
    pub fn mark_all_shown(&mut self, now: u64) {
        for (_, register) in self.iter_mut() {
            register.shown = now;
            register.one_shot = true;
        }
    }

    pub fn reset_ranges(&mut self) {
        self.iter_mut().for_each(|(_, r)| r.reset_range());
    }

    /// Ids of the unit family headed by `base`: `base` itself followed by the contiguous
    /// registers named `<base>_<unit>`.
    pub fn family(&self, base: usize) -> Option<RangeInclusive<usize>> {
        let prefix = format!("{}_", self.get(base)?.symbol);
        let mut last = base;
        for id in base + 1..self.max_n {
            let register = &self.registers[id];
            if !register.is_allocated() {
                continue;
            }
            if !register.symbol.starts_with(&prefix) {
                break;
            }
            last = id;
        }
        Some(base..=last)
    }

    /// Choose which member of the family headed by `base` is displayed and edited.
    pub fn select_variant(&mut self, base: usize, variant: usize) -> Option<usize> {
        let members = self.family(base)?.filter(|&id| self.registers[id].is_allocated()).count();
        let variant = variant.min(members - 1);
        self.registers[base].unit_variant = variant;
        self.active_variant(base)
    }

    /// Id of the currently selected member of the family headed by `base`.
    pub fn active_variant(&self, base: usize) -> Option<usize> {
        let selector = self.get(base)?.unit_variant;
        let family = self.family(base)?;
        family.filter(|&id| self.registers[id].is_allocated()).nth(selector).or(Some(base))
    }
}
