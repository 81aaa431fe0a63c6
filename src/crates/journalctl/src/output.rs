use chrono::{DateTime, Local, TimeZone, Utc};
use clap::ValueEnum;
use journal_common::id128;
use std::io::{self, Write};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    Short,
    Verbose,
    Export,
    Json,
    JsonPretty,
    Cat,
}

/// Fields and position of a single journal entry.
pub struct Entry {
    pub cursor: String,
    pub realtime_usec: u64,
    pub monotonic_usec: u64,
    pub boot_id: Uuid,
    /// `FIELD=value` payloads split at the first `=`, in stored order
    pub fields: Vec<(String, Vec<u8>)>,
}

impl Entry {
    pub fn new(
        cursor: String,
        realtime_usec: u64,
        (monotonic_usec, boot_id): (u64, Uuid),
        payloads: Vec<Vec<u8>>,
    ) -> Self {
        let fields = payloads
            .into_iter()
            .filter_map(|payload| {
                let eq = payload.iter().position(|&b| b == b'=')?;
                let key = String::from_utf8_lossy(&payload[..eq]).into_owned();
                Some((key, payload[eq + 1..].to_vec()))
            })
            .collect();

        Self {
            cursor,
            realtime_usec,
            monotonic_usec,
            boot_id,
            fields,
        }
    }

    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    fn field_str(&self, key: &str) -> &str {
        self.field(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("")
    }
}

/// Values journalctl prints as text. Anything else is binary.
fn is_printable(value: &[u8]) -> bool {
    match std::str::from_utf8(value) {
        Ok(s) => s.chars().all(|c| !c.is_control() || c == '\t'),
        Err(_) => false,
    }
}

fn format_timestamp(usec: u64, utc: bool, precise: bool) -> String {
    let secs = (usec / 1_000_000) as i64;
    let nanos = (usec % 1_000_000) as u32 * 1000;

    let format = match (precise, utc) {
        (true, true) => "%a %Y-%m-%d %H:%M:%S%.6f UTC",
        (true, false) => "%a %Y-%m-%d %H:%M:%S%.6f %Z",
        (false, _) => "%b %d %H:%M:%S",
    };

    if utc {
        if let Some(dt) = DateTime::<Utc>::from_timestamp(secs, nanos) {
            return dt.format(format).to_string();
        }
    } else if let Some(dt) = Local.timestamp_opt(secs, nanos).single() {
        return dt.format(format).to_string();
    }

    format!("{usec}")
}

/// `Mon DD HH:MM:SS hostname identifier[pid]: message`
pub fn format_short(entry: &Entry, utc: bool, w: &mut impl Write) -> io::Result<()> {
    let ts = format_timestamp(entry.realtime_usec, utc, false);
    let hostname = entry.field_str("_HOSTNAME");

    let ident = match entry.field_str("SYSLOG_IDENTIFIER") {
        "" => entry.field_str("_COMM"),
        s => s,
    };

    let pid = match entry.field_str("SYSLOG_PID") {
        "" => entry.field_str("_PID"),
        s => s,
    };

    let message = match entry.field("MESSAGE") {
        Some(m) if is_printable(m) => String::from_utf8_lossy(m).into_owned(),
        Some(m) => format!("[{} blob data]", bytesize::ByteSize::b(m.len() as u64)),
        None => String::new(),
    };

    write!(w, "{ts}")?;
    if !hostname.is_empty() {
        write!(w, " {hostname}")?;
    }
    if !ident.is_empty() {
        write!(w, " {ident}")?;
    }
    if !pid.is_empty() {
        write!(w, "[{pid}]")?;
    }
    writeln!(w, ": {message}")
}

/// All fields, one per line, under a line with the time and cursor.
pub fn format_verbose(entry: &Entry, utc: bool, w: &mut impl Write) -> io::Result<()> {
    let ts = format_timestamp(entry.realtime_usec, utc, true);
    writeln!(w, "{ts} [{}]", entry.cursor)?;

    for (key, value) in &entry.fields {
        if is_printable(value) {
            writeln!(w, "    {key}={}", String::from_utf8_lossy(value))?;
        } else {
            writeln!(w, "    {key}=[{} blob data]", bytesize::ByteSize::b(value.len() as u64))?;
        }
    }

    Ok(())
}

/// The serialization format: text fields as `KEY=value` lines, binary
/// fields as the key, a little-endian 64 bit length and the raw value.
/// Entries are separated by an empty line.
pub fn format_export(entry: &Entry, w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "__CURSOR={}", entry.cursor)?;
    writeln!(w, "__REALTIME_TIMESTAMP={}", entry.realtime_usec)?;
    writeln!(w, "__MONOTONIC_TIMESTAMP={}", entry.monotonic_usec)?;
    if entry.field("_BOOT_ID").is_none() {
        writeln!(w, "_BOOT_ID={}", id128::to_hex(&entry.boot_id))?;
    }

    for (key, value) in &entry.fields {
        if value.contains(&b'\n') || !is_printable(value) {
            writeln!(w, "{key}")?;
            w.write_all(&(value.len() as u64).to_le_bytes())?;
            w.write_all(value)?;
            writeln!(w)?;
        } else {
            write!(w, "{key}=")?;
            w.write_all(value)?;
            writeln!(w)?;
        }
    }

    writeln!(w)
}

fn json_value(value: &[u8]) -> serde_json::Value {
    match std::str::from_utf8(value) {
        Ok(s) if is_printable(value) => serde_json::Value::String(s.to_string()),
        // Binary values become arrays of byte values
        _ => serde_json::Value::Array(value.iter().map(|&b| b.into()).collect()),
    }
}

fn json_object(entry: &Entry) -> serde_json::Map<String, serde_json::Value> {
    use serde_json::Value;

    let mut map = serde_json::Map::new();
    map.insert("__CURSOR".into(), Value::String(entry.cursor.clone()));
    map.insert(
        "__REALTIME_TIMESTAMP".into(),
        Value::String(entry.realtime_usec.to_string()),
    );
    map.insert(
        "__MONOTONIC_TIMESTAMP".into(),
        Value::String(entry.monotonic_usec.to_string()),
    );
    map.insert("_BOOT_ID".into(), Value::String(id128::to_hex(&entry.boot_id)));

    for (key, value) in &entry.fields {
        let value = json_value(value);

        // A field repeated within the entry becomes an array of its values
        if key != "_BOOT_ID" {
            match map.get_mut(key) {
                Some(Value::Array(values)) if values.first().is_some_and(|v| !v.is_number()) => {
                    values.push(value);
                    continue;
                }
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                    continue;
                }
                None => {}
            }
        }
        map.insert(key.clone(), value);
    }

    map
}

/// One JSON object per line, or indented when `pretty` is set.
pub fn format_json(entry: &Entry, pretty: bool, w: &mut impl Write) -> io::Result<()> {
    let object = serde_json::Value::Object(json_object(entry));
    if pretty {
        serde_json::to_writer_pretty(&mut *w, &object)?;
    } else {
        serde_json::to_writer(&mut *w, &object)?;
    }
    writeln!(w)
}

/// Only the MESSAGE value.
pub fn format_cat(entry: &Entry, w: &mut impl Write) -> io::Result<()> {
    if let Some(message) = entry.field("MESSAGE") {
        w.write_all(message)?;
    }
    writeln!(w)
}

pub fn format(entry: &Entry, mode: OutputMode, utc: bool, w: &mut impl Write) -> io::Result<()> {
    match mode {
        OutputMode::Short => format_short(entry, utc, w),
        OutputMode::Verbose => format_verbose(entry, utc, w),
        OutputMode::Export => format_export(entry, w),
        OutputMode::Json => format_json(entry, false, w),
        OutputMode::JsonPretty => format_json(entry, true, w),
        OutputMode::Cat => format_cat(entry, w),
    }
}
