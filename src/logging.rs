//! Leveled diagnostics with a runtime-adjustable filter
//!
//! Every layer holds a clone of [`Diagnostics`]. An event passes the filter when
//! its level is at least as severe as the configured threshold; passing events
//! go to `tracing` and to the optional [`LogCallback`] sink. Suppressed events
//! are dropped, never buffered.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::Dnp3Error;

/// Diagnostic severity, most severe first.
///
/// Ordering follows severity: `Emerg < Alarm < ... < Debug`, so an event at
/// level `L` is emitted under threshold `T` iff `L <= T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FilterLevel {
    Emerg = 0,
    Alarm = 1,
    Crit = 2,
    Error = 3,
    Warn = 4,
    Event = 5,
    Info = 6,
    Debug = 7,
}

impl FilterLevel {
    /// All levels, most severe first
    pub const ALL: [FilterLevel; 8] = [
        FilterLevel::Emerg,
        FilterLevel::Alarm,
        FilterLevel::Crit,
        FilterLevel::Error,
        FilterLevel::Warn,
        FilterLevel::Event,
        FilterLevel::Info,
        FilterLevel::Debug,
    ];

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// True if an event at `self` passes a filter set to `threshold`.
    #[inline]
    pub fn passes(self, threshold: FilterLevel) -> bool {
        self <= threshold
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterLevel::Emerg => "EMERG",
            FilterLevel::Alarm => "ALARM",
            FilterLevel::Crit => "CRIT",
            FilterLevel::Error => "ERROR",
            FilterLevel::Warn => "WARN",
            FilterLevel::Event => "EVENT",
            FilterLevel::Info => "INFO",
            FilterLevel::Debug => "DEBUG",
        }
    }
}

impl Default for FilterLevel {
    fn default() -> Self {
        FilterLevel::Info
    }
}

impl fmt::Display for FilterLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterLevel {
    type Err = Dnp3Error;

    /// Accepts the level names with or without the `LEV_` prefix, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("LEV_").unwrap_or(&upper);
        match name {
            "EMERG" => Ok(FilterLevel::Emerg),
            "ALARM" => Ok(FilterLevel::Alarm),
            "CRIT" => Ok(FilterLevel::Crit),
            "ERROR" => Ok(FilterLevel::Error),
            "WARN" | "WARNING" => Ok(FilterLevel::Warn),
            "EVENT" => Ok(FilterLevel::Event),
            "INFO" => Ok(FilterLevel::Info),
            "DEBUG" => Ok(FilterLevel::Debug),
            _ => Err(Dnp3Error::configuration(format!("Unknown filter level: {}", s))),
        }
    }
}

/// External sink for diagnostic events that pass the filter
pub type LogCallback = Arc<dyn Fn(FilterLevel, &str) + Send + Sync>;

/// Filter-gated diagnostic emitter shared across the stack.
///
/// Clones share the threshold: changing it through any clone affects all
/// subsequent events from every layer.
#[derive(Clone)]
pub struct Diagnostics {
    threshold: Arc<AtomicU8>,
    callback: Option<LogCallback>,
    component: &'static str,
}

impl Diagnostics {
    pub fn new(level: FilterLevel) -> Self {
        Self {
            threshold: Arc::new(AtomicU8::new(level.to_u8())),
            callback: None,
            component: "dnp3",
        }
    }

    /// Create diagnostics that also forward to `callback`
    pub fn with_callback(level: FilterLevel, callback: LogCallback) -> Self {
        Self {
            callback: Some(callback),
            ..Self::new(level)
        }
    }

    /// Clone sharing threshold and sink, tagged with a component name
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            threshold: Arc::clone(&self.threshold),
            callback: self.callback.clone(),
            component,
        }
    }

    pub fn level(&self) -> FilterLevel {
        FilterLevel::from_u8(self.threshold.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_level(&self, level: FilterLevel) {
        self.threshold.store(level.to_u8(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_enabled(&self, level: FilterLevel) -> bool {
        level.passes(self.level())
    }

    /// Emit `message` at `level`; no-op when filtered.
    pub fn emit(&self, level: FilterLevel, message: &str) {
        if !self.is_enabled(level) {
            return;
        }
        self.dispatch(level, message);
    }

    /// Emit a lazily formatted message; the closure only runs when enabled.
    pub fn emit_with<F>(&self, level: FilterLevel, message: F)
    where
        F: FnOnce() -> String,
    {
        if !self.is_enabled(level) {
            return;
        }
        self.dispatch(level, &message());
    }

    /// Hex-dump a frame at DEBUG
    pub fn log_packet(&self, direction: &str, bytes: &[u8]) {
        self.emit_with(FilterLevel::Debug, || {
            format!("{} {} bytes: {}", direction, bytes.len(), format_hex(bytes))
        });
    }

    fn dispatch(&self, level: FilterLevel, message: &str) {
        let component = self.component;
        match level {
            FilterLevel::Emerg | FilterLevel::Alarm | FilterLevel::Crit | FilterLevel::Error => {
                tracing::error!(component, level = level.as_str(), "{}", message)
            }
            FilterLevel::Warn => tracing::warn!(component, "{}", message),
            FilterLevel::Event | FilterLevel::Info => {
                tracing::info!(component, level = level.as_str(), "{}", message)
            }
            FilterLevel::Debug => tracing::debug!(component, "{}", message),
        }

        if let Some(ref callback) = self.callback {
            callback(level, message);
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(FilterLevel::default())
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("level", &self.level())
            .field("component", &self.component)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Format bytes as space-separated uppercase hex ("05 64 05 C0")
pub fn format_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn capturing(level: FilterLevel) -> (Diagnostics, Arc<Mutex<Vec<(FilterLevel, String)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: LogCallback = Arc::new(move |level, msg: &str| {
            sink.lock().unwrap().push((level, msg.to_string()));
        });
        (Diagnostics::with_callback(level, callback), events)
    }

    #[test]
    fn test_level_ordering() {
        assert!(FilterLevel::Emerg < FilterLevel::Error);
        assert!(FilterLevel::Warn < FilterLevel::Debug);
        assert!(FilterLevel::Error.passes(FilterLevel::Warn));
        assert!(!FilterLevel::Debug.passes(FilterLevel::Info));
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("LEV_DEBUG".parse::<FilterLevel>().unwrap(), FilterLevel::Debug);
        assert_eq!("warning".parse::<FilterLevel>().unwrap(), FilterLevel::Warn);
        assert_eq!("Event".parse::<FilterLevel>().unwrap(), FilterLevel::Event);
        assert!("verbose".parse::<FilterLevel>().is_err());
        assert_eq!(FilterLevel::Crit.to_string(), "CRIT");
    }

    #[test]
    fn test_threshold_change_applies_immediately() {
        let (diag, events) = capturing(FilterLevel::Warn);
        diag.emit(FilterLevel::Info, "dropped");
        diag.set_level(FilterLevel::Debug);
        diag.emit(FilterLevel::Info, "kept");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], (FilterLevel::Info, "kept".to_string()));
    }

    #[test]
    fn test_component_clone_shares_threshold() {
        let (diag, events) = capturing(FilterLevel::Error);
        let link = diag.for_component("link");
        diag.set_level(FilterLevel::Warn);
        link.emit(FilterLevel::Warn, "crc failure");
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_lazy_message_not_built_when_filtered() {
        let diag = Diagnostics::new(FilterLevel::Error);
        let mut built = false;
        diag.emit_with(FilterLevel::Debug, || {
            built = true;
            String::new()
        });
        assert!(!built);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x05, 0x64, 0x0A]), "05 64 0A");
        assert_eq!(format_hex(&[]), "");
    }

    proptest! {
        #[test]
        fn prop_emit_iff_at_least_as_severe(threshold in 0u8..8, level in 0u8..8) {
            let threshold = FilterLevel::from_u8(threshold).unwrap();
            let level = FilterLevel::from_u8(level).unwrap();
            let (diag, events) = capturing(threshold);
            diag.emit(level, "probe");
            let emitted = !events.lock().unwrap().is_empty();
            prop_assert_eq!(emitted, level <= threshold);
        }
    }
}
