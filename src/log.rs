//! Runtime Event Log
//!
//! Leveled event reporting for the runtime's subsystems. This is not a
//! general-purpose logging facade: an event is allocation-free until it is
//! actually rendered. Messages and field names are static strings, values
//! are the quantities the runtime deals in (object counts, byte sizes,
//! addresses, flags), and every event is tagged with the subsystem that
//! produced it — the collector, the shared-pointer engine, or the
//! allocator shim.
//!
//! Events render as a single plain-text line or as one flat JSON object,
//! stamped with microseconds since the first event.
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow::log::{self, LogLevel, Subsystem};
//!
//! log::event(LogLevel::Debug, Subsystem::Collector, "cycle complete")
//!     .count("swept", 3)
//!     .count("live", 12)
//!     .emit();
//! // [4.002913] debug collector: cycle complete swept=3 live=12
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

// ============================================================================
// Levels and Output Encoding
// ============================================================================

/// Verbosity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Finest-grained events.
    Trace = 0,
    /// Subsystem activity: allocations, cycles, releases.
    Debug = 1,
    /// Notable state changes.
    Info = 2,
    /// Suspicious but recoverable conditions.
    Warn = 3,
    /// Faults, including detected safety violations.
    Error = 4,
    /// Suppress all events.
    Off = 5,
}

/// Level names, indexed by discriminant.
const LEVEL_NAMES: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl LogLevel {
    /// Every level, indexed by discriminant.
    const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Off,
    ];

    /// The level's lowercase name.
    pub fn as_str(self) -> &'static str {
        LEVEL_NAMES[self as usize]
    }

    /// Parse a level name, case-insensitively. Accepts the aliases
    /// `warning` and `none`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(i) = LEVEL_NAMES.iter().position(|name| s.eq_ignore_ascii_case(name)) {
            return Some(Self::ALL[i]);
        }
        if s.eq_ignore_ascii_case("warning") {
            Some(LogLevel::Warn)
        } else if s.eq_ignore_ascii_case("none") {
            Some(LogLevel::Off)
        } else {
            None
        }
    }

    fn from_index(i: u8) -> Self {
        Self::ALL[(i as usize).min(Self::ALL.len() - 1)]
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Output encoding for emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogFormat {
    /// One human-readable line per event.
    Plain = 0,
    /// One flat JSON object per event.
    Json = 1,
}

impl LogFormat {
    /// The encoding's name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Plain => "plain",
            LogFormat::Json => "json",
        }
    }

    /// Parse an encoding name. `text` is an alias for `plain`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("plain") || s.eq_ignore_ascii_case("text") {
            Some(LogFormat::Plain)
        } else if s.eq_ignore_ascii_case("json") {
            Some(LogFormat::Json)
        } else {
            None
        }
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

// ============================================================================
// Global State
// ============================================================================

/// Minimum level that reaches the output.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Active output encoding.
static FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Plain as u8);

/// Instant of the first rendered event; timestamps count from here.
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Set the minimum level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// The current minimum level.
pub fn level() -> LogLevel {
    LogLevel::from_index(MIN_LEVEL.load(Ordering::SeqCst))
}

/// Set the output encoding.
pub fn set_format(format: LogFormat) {
    FORMAT.store(format as u8, Ordering::SeqCst);
}

/// The current output encoding.
pub fn format() -> LogFormat {
    if FORMAT.load(Ordering::SeqCst) == LogFormat::Json as u8 {
        LogFormat::Json
    } else {
        LogFormat::Plain
    }
}

/// Whether events at `level` currently reach the output.
pub fn enabled(level: LogLevel) -> bool {
    level < LogLevel::Off && level >= self::level()
}

fn elapsed_micros() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

// ============================================================================
// Subsystems and Fields
// ============================================================================

/// The runtime component an event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// The tracing collector.
    Collector,
    /// The shared-pointer engine.
    Shared,
    /// The allocator shim.
    Shim,
}

impl Subsystem {
    /// The subsystem's name.
    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Collector => "collector",
            Subsystem::Shared => "shared",
            Subsystem::Shim => "shim",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event attribute.
#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    value: FieldValue,
}

/// Attribute values: the quantities the runtime reports.
#[derive(Debug, Clone, Copy)]
enum FieldValue {
    /// An object or unit count.
    Count(u64),
    /// A byte quantity.
    Bytes(usize),
    /// A memory address, rendered in hex.
    Addr(usize),
    /// A boolean state.
    Flag(bool),
    /// A static name: an operation kind, a fault description.
    Name(&'static str),
}

impl FieldValue {
    fn render_plain(&self, out: &mut String) {
        let _ = match self {
            FieldValue::Count(n) => write!(out, "{}", n),
            FieldValue::Bytes(n) => write!(out, "{}B", n),
            FieldValue::Addr(a) => write!(out, "{:#x}", a),
            FieldValue::Flag(b) => write!(out, "{}", b),
            FieldValue::Name(s) => {
                out.push_str(s);
                Ok(())
            }
        };
    }

    fn render_json(&self, out: &mut String) {
        match self {
            FieldValue::Count(n) => {
                let _ = write!(out, "{}", n);
            }
            FieldValue::Bytes(n) => {
                let _ = write!(out, "{}", n);
            }
            FieldValue::Addr(a) => {
                let _ = write!(out, "\"{:#x}\"", a);
            }
            FieldValue::Flag(b) => {
                let _ = write!(out, "{}", b);
            }
            FieldValue::Name(s) => push_json_str(out, s),
        }
    }
}

/// Append `s` to `out` as a quoted, escaped JSON string.
fn push_json_str(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ============================================================================
// Events
// ============================================================================

/// Maximum attributes per event; further attributes are discarded.
const MAX_FIELDS: usize = 6;

/// A single event, built up attribute by attribute and emitted once.
#[derive(Debug)]
pub struct Event {
    level: LogLevel,
    subsystem: Subsystem,
    message: &'static str,
    fields: [Option<Field>; MAX_FIELDS],
}

/// Start an event.
pub fn event(level: LogLevel, subsystem: Subsystem, message: &'static str) -> Event {
    Event {
        level,
        subsystem,
        message,
        fields: [None; MAX_FIELDS],
    }
}

impl Event {
    fn push(mut self, name: &'static str, value: FieldValue) -> Self {
        if let Some(slot) = self.fields.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(Field { name, value });
        }
        self
    }

    /// Attach an object or unit count.
    pub fn count(self, name: &'static str, value: u64) -> Self {
        self.push(name, FieldValue::Count(value))
    }

    /// Attach a byte quantity.
    pub fn bytes(self, name: &'static str, value: usize) -> Self {
        self.push(name, FieldValue::Bytes(value))
    }

    /// Attach a memory address.
    pub fn addr(self, name: &'static str, value: usize) -> Self {
        self.push(name, FieldValue::Addr(value))
    }

    /// Attach a boolean state.
    pub fn flag(self, name: &'static str, value: bool) -> Self {
        self.push(name, FieldValue::Flag(value))
    }

    /// Attach a static name.
    pub fn name(self, name: &'static str, value: &'static str) -> Self {
        self.push(name, FieldValue::Name(value))
    }

    /// Render the event in the given encoding.
    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.render_plain(),
            LogFormat::Json => self.render_json(),
        }
    }

    fn render_plain(&self) -> String {
        let t = elapsed_micros();
        let mut out = String::with_capacity(64);
        let _ = write!(
            out,
            "[{}.{:06}] {} {}: {}",
            t / 1_000_000,
            t % 1_000_000,
            self.level,
            self.subsystem,
            self.message
        );
        for field in self.fields.iter().flatten() {
            let _ = write!(out, " {}=", field.name);
            field.value.render_plain(&mut out);
        }
        out
    }

    fn render_json(&self) -> String {
        let mut out = String::with_capacity(96);
        let _ = write!(
            out,
            "{{\"t_us\":{},\"level\":\"{}\",\"subsystem\":\"{}\",\"message\":",
            elapsed_micros(),
            self.level,
            self.subsystem
        );
        push_json_str(&mut out, self.message);
        for field in self.fields.iter().flatten() {
            out.push(',');
            push_json_str(&mut out, field.name);
            out.push(':');
            field.value.render_json(&mut out);
        }
        out.push('}');
        out
    }

    /// Write the event to stderr if its level is enabled.
    pub fn emit(self) {
        if !enabled(self.level) {
            return;
        }
        let line = self.render(format());
        let _ = writeln!(std::io::stderr(), "{}", line);
    }
}
