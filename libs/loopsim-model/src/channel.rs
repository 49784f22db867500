//! Channel catalog
//!
//! Each logical channel maps an operator-facing name to a carrier-board
//! slot, a resolved GPIO pin, a signal direction, and an engineering-unit
//! range. The catalog owns the conversions between engineering units and
//! on-the-wire milliamp values, including the optional per-channel linear
//! calibration applied to readings.

use thiserror::Error;

use crate::config::SignalRecord;
use crate::entry::{EntryValue, SignalKind};

/// Lower bound of a healthy current loop.
pub const LOOP_MA_MIN: f64 = 4.0;
/// Upper bound of a healthy current loop.
pub const LOOP_MA_MAX: f64 = 20.0;
/// Span of the loop range, used by every linear map.
const LOOP_MA_SPAN: f64 = LOOP_MA_MAX - LOOP_MA_MIN;

// The ribbon cables between the node and the carrier board are fixed
// wiring; slots outside this table leave the channel unresolved.
const SLOT_TO_PIN: &[(u32, &str)] = &[
    (11, "GPIO5"),
    (12, "GPIO6"),
    (13, "GPIO12"),
    (14, "GPIO13"),
    (15, "GPIO19"),
    (16, "GPIO16"),
];

/// Resolve a carrier-board slot to its GPIO pin name.
pub fn pin_for_slot(slot: u32) -> Option<&'static str> {
    SLOT_TO_PIN
        .iter()
        .find(|(s, _)| *s == slot)
        .map(|(_, pin)| *pin)
}

/// Catalog error type
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    /// Degenerate engineering range (low == high)
    #[error("Channel {0} has a zero-span engineering range")]
    ZeroSpan(String),

    /// Conversion requested for a direction that has no analog mapping
    #[error("Channel {0} ({1}) carries no engineering-unit mapping")]
    NotAnalog(String, SignalKind),

    /// Slot with no pin in the wiring table
    #[error("No GPIO pin is mapped to board slot {slot} for channel {name}; check the carrier board wiring table")]
    UnresolvedPin { name: String, slot: u32 },
}

/// Direction alias kept for readability at catalog call sites.
pub type ChannelKind = SignalKind;

/// Per-channel linear calibration, applied to raw readings before the
/// engineering-unit map: `corrected = slope * raw + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub slope: f64,
    pub offset: f64,
}

/// One catalog entry. Immutable after configuration load.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub slot: u32,
    /// Resolved GPIO pin; `None` when the slot is outside the wiring
    /// table. Enqueues against an unresolved channel fail with a
    /// readable message instead of crashing.
    pub pin: Option<String>,
    pub kind: ChannelKind,
    pub units: Option<String>,
    pub eng_low: f64,
    pub eng_high: f64,
    pub show_on_gui: bool,
    pub calibration: Option<Calibration>,
}

impl Channel {
    /// Build a channel from one configuration record, resolving the slot
    /// through the fixed wiring table.
    pub fn from_record(record: &SignalRecord) -> Self {
        let calibration = match (record.slope_calib_constant, record.offset_calib_constant) {
            (Some(slope), Some(offset)) => Some(Calibration { slope, offset }),
            _ => None,
        };
        Self {
            name: record.name.clone(),
            slot: record.board_slot_position,
            pin: pin_for_slot(record.board_slot_position).map(str::to_string),
            kind: record.sig_type,
            units: record.engineering_units.clone(),
            eng_low: record.engineering_units_low_amount,
            eng_high: record.engineering_units_high_amount,
            show_on_gui: record.show_on_gui,
            calibration,
        }
    }

    /// Resolved pin, or the explanatory unresolved-slot error.
    pub fn require_pin(&self) -> Result<&str, ChannelError> {
        self.pin.as_deref().ok_or(ChannelError::UnresolvedPin {
            name: self.name.clone(),
            slot: self.slot,
        })
    }

    fn span(&self) -> Result<f64, ChannelError> {
        let span = self.eng_high - self.eng_low;
        if span == 0.0 {
            return Err(ChannelError::ZeroSpan(self.name.clone()));
        }
        Ok(span)
    }

    /// Engineering units -> loop milliamps for analog channels.
    ///
    /// Inverted ranges (`eng_low > eng_high`, falling sensors) are legal;
    /// only a zero span is rejected.
    pub fn eng_to_ma(&self, eng: f64) -> Result<f64, ChannelError> {
        if !self.kind.is_analog() {
            return Err(ChannelError::NotAnalog(self.name.clone(), self.kind));
        }
        Ok(LOOP_MA_MIN + (eng - self.eng_low) / self.span()? * LOOP_MA_SPAN)
    }

    /// Loop milliamps -> engineering units, applying calibration first
    /// when the channel carries one.
    pub fn ma_to_eng(&self, ma: f64) -> Result<f64, ChannelError> {
        if !self.kind.is_analog() {
            return Err(ChannelError::NotAnalog(self.name.clone(), self.kind));
        }
        let ma = match self.calibration {
            Some(c) => c.slope * ma + c.offset,
            None => ma,
        };
        Ok((ma - LOOP_MA_MIN) / LOOP_MA_SPAN * self.span()? + self.eng_low)
    }

    /// Engineering-unit rate (e.g. PSI/s) -> milliamp rate.
    pub fn rate_eng_to_ma(&self, eng_rate: f64) -> Result<f64, ChannelError> {
        Ok(LOOP_MA_SPAN * eng_rate / self.span()?)
    }

    /// Wire value for an operator input: analog channels convert through
    /// the linear map, digital channels truncate to an integer.
    pub fn to_wire_value(&self, eng: f64) -> Result<EntryValue, ChannelError> {
        if self.kind.is_analog() {
            Ok(EntryValue::Number(self.eng_to_ma(eng)?))
        } else {
            Ok(EntryValue::Number(eng.trunc()))
        }
    }

    /// A milliamp value inside the healthy 4-20 loop window.
    pub fn valid_ma(ma: f64) -> bool {
        (LOOP_MA_MIN..=LOOP_MA_MAX).contains(&ma)
    }

    /// An engineering value whose converted current lands in the loop
    /// window.
    pub fn valid_eng(&self, eng: f64) -> bool {
        self.eng_to_ma(eng).map(Self::valid_ma).unwrap_or(false)
    }

    /// Reading rendered for display, e.g. `50.0 %`.
    pub fn display_eng(&self, ma: f64) -> String {
        match (self.ma_to_eng(ma), &self.units) {
            (Ok(v), Some(u)) => format!("{v:.1} {u}"),
            (Ok(v), None) => format!("{v:.1}"),
            (Err(_), _) => format!("{ma:.1} mA"),
        }
    }
}

/// The read-only channel catalog, keyed by operator-facing name.
#[derive(Debug, Default)]
pub struct ChannelCatalog {
    channels: Vec<Channel>,
}

impl ChannelCatalog {
    /// Build the catalog from configuration records. Never fails: a
    /// record with an unknown slot produces a channel with an
    /// unresolved pin.
    pub fn from_records(records: &[SignalRecord]) -> Self {
        let channels = records.iter().map(Channel::from_record).collect();
        Self { channels }
    }

    pub fn by_name(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn by_pin(&self, pin: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.pin.as_deref() == Some(pin))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Channels of one direction, e.g. every AI channel for the poll
    /// planner.
    pub fn of_kind(&self, kind: ChannelKind) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(move |c| c.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
