mod output;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use clap::Parser;
use journal_common::id128;
use journal_session::{Boot, JournalSession};
use output::{Entry, OutputMode};
use regex::Regex;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);
const FOLLOW_DEFAULT_LINES: usize = 10;

#[derive(Parser)]
#[command(name = "journalctl", about = "Query journal files")]
struct Cli {
    /// Field matches (FIELD=VALUE), use + for OR between groups
    matches: Vec<String>,

    /// Use journal files from directory
    #[arg(short = 'D', long)]
    directory: Option<PathBuf>,

    /// Use a specific journal file (may be repeated)
    #[arg(long)]
    file: Vec<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "short")]
    output: OutputMode,

    /// Show at most N entries (the newest ones, unless reversed)
    #[arg(short = 'n', long)]
    lines: Option<usize>,

    /// Newest entries first
    #[arg(short, long)]
    reverse: bool,

    /// Show entries on or after TIME
    #[arg(short = 'S', long)]
    since: Option<String>,

    /// Show entries on or before TIME
    #[arg(short = 'U', long)]
    until: Option<String>,

    /// Show entries of one boot: an ID, or an offset (0 is the last boot,
    /// -1 the one before, 1 the first one)
    #[arg(short, long, num_args = 0..=1, default_missing_value = "0", allow_hyphen_values = true)]
    boot: Option<String>,

    /// List the boots recorded in the journal
    #[arg(long)]
    list_boots: bool,

    /// Start at the entry named by the cursor
    #[arg(short, long)]
    cursor: Option<String>,

    /// Start after the entry named by the cursor
    #[arg(long)]
    after_cursor: Option<String>,

    /// Print the cursor of the last entry shown
    #[arg(long)]
    show_cursor: bool,

    /// Keep waiting for and showing new entries
    #[arg(short, long)]
    follow: bool,

    /// Show priorities in RANGE, as a level or FROM..TO (names or numbers)
    #[arg(short, long)]
    priority: Option<String>,

    /// Show only entries whose MESSAGE matches the regular expression
    #[arg(short, long)]
    grep: Option<String>,

    /// List unique values of FIELD
    #[arg(short = 'F', long)]
    field: Option<String>,

    /// List all field names
    #[arg(long)]
    fields: bool,

    /// Show journal file header info
    #[arg(long)]
    header: bool,

    /// Check the journal files for consistency
    #[arg(long)]
    verify: bool,

    /// Show the disk space used by the journal files
    #[arg(long)]
    disk_usage: bool,

    /// Timestamps in UTC
    #[arg(long)]
    utc: bool,
}

const PRIORITIES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

fn parse_priority(s: &str) -> Result<u8> {
    if let Ok(n) = s.parse::<u8>() {
        if n < 8 {
            return Ok(n);
        }
    }
    PRIORITIES
        .iter()
        .position(|&name| name == s)
        .map(|p| p as u8)
        .with_context(|| format!("unknown priority: {s:?}"))
}

/// Levels selected by `LEVEL` (that level and more important ones) or
/// `FROM..TO`.
fn parse_priority_range(s: &str) -> Result<std::ops::RangeInclusive<u8>> {
    match s.split_once("..") {
        Some((from, to)) => {
            let from = if from.is_empty() { 0 } else { parse_priority(from)? };
            let to = if to.is_empty() { 7 } else { parse_priority(to)? };
            Ok(from.min(to)..=from.max(to))
        }
        None => Ok(0..=parse_priority(s)?),
    }
}

fn local_micros(ndt: &NaiveDateTime) -> Result<u64> {
    let dt = Local
        .from_local_datetime(ndt)
        .single()
        .context("ambiguous local time")?;
    Ok(dt.timestamp_micros() as u64)
}

fn parse_timestamp(s: &str) -> Result<u64> {
    // Raw integer or @seconds
    if let Ok(usec) = s.parse::<u64>() {
        return Ok(usec);
    }
    if let Some(secs) = s.strip_prefix('@') {
        let secs: u64 = secs.parse().with_context(|| format!("invalid timestamp: {s:?}"))?;
        return Ok(secs * 1_000_000);
    }

    let s_lower = s.to_lowercase();
    let now = chrono::Utc::now().timestamp_micros() as u64;
    let today = Local::now().date_naive();

    match s_lower.as_str() {
        "now" => return Ok(now),
        "today" => return local_micros(&today.and_time(NaiveTime::MIN)),
        "yesterday" => {
            let day = today.pred_opt().context("date underflow")?;
            return local_micros(&day.and_time(NaiveTime::MIN));
        }
        "tomorrow" => {
            let day = today.succ_opt().context("date overflow")?;
            return local_micros(&day.and_time(NaiveTime::MIN));
        }
        _ => {}
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return local_micros(&ndt);
        }
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return local_micros(&nd.and_time(NaiveTime::MIN));
    }

    // "-1h", "+30min", "2 days ago"
    let relative = |text: &str| -> Result<u64> {
        let compact: String = text.split_whitespace().collect();
        let duration = humantime::parse_duration(&compact)
            .with_context(|| format!("cannot parse timestamp: {s:?}"))?;
        Ok(duration.as_micros() as u64)
    };
    if let Some(rest) = s_lower.strip_suffix(" ago") {
        return Ok(now.saturating_sub(relative(rest)?));
    }
    if let Some(rest) = s_lower.strip_prefix('-') {
        return Ok(now.saturating_sub(relative(rest)?));
    }
    if let Some(rest) = s_lower.strip_prefix('+') {
        return Ok(now.saturating_add(relative(rest)?));
    }

    bail!("cannot parse timestamp: {s:?}")
}

fn open_session(cli: &Cli) -> Result<JournalSession> {
    if !cli.file.is_empty() {
        return JournalSession::from_files(&cli.file).context("failed to open journal files");
    }

    if let Some(ref dir) = cli.directory {
        return JournalSession::open(dir)
            .with_context(|| format!("failed to open journal directory: {}", dir.display()));
    }

    for dir in ["/var/log/journal", "/run/log/journal"] {
        if Path::new(dir).is_dir() {
            return JournalSession::open(dir).with_context(|| format!("failed to open {dir}"));
        }
    }

    bail!("no journal directory found; specify --directory or --file")
}

fn resolve_boot(session: &mut JournalSession, boot: &str) -> Result<uuid::Uuid> {
    if let Ok(boot_id) = id128::parse(boot) {
        return Ok(boot_id);
    }

    let offset: i64 = boot
        .parse()
        .with_context(|| format!("invalid boot: {boot:?}"))?;
    let boots = session.boots()?;

    let index = if offset > 0 {
        offset - 1
    } else {
        boots.len() as i64 - 1 + offset
    };
    usize::try_from(index)
        .ok()
        .and_then(|i| boots.get(i))
        .map(|b| b.boot_id)
        .with_context(|| format!("no boot with offset {offset}"))
}

fn apply_matches(session: &mut JournalSession, cli: &Cli) -> Result<()> {
    for m in &cli.matches {
        if m == "+" {
            session.add_disjunction();
        } else {
            session
                .add_match(m.as_bytes())
                .with_context(|| format!("invalid match (expected FIELD=VALUE or +): {m:?}"))?;
        }
    }

    if let Some(ref range) = cli.priority {
        session.add_conjunction();
        for level in parse_priority_range(range)? {
            session.add_match(format!("PRIORITY={level}").as_bytes())?;
        }
    }

    if let Some(ref boot) = cli.boot {
        let boot_id = resolve_boot(session, boot)?;
        session.add_conjunction();
        session.add_match(format!("_BOOT_ID={}", id128::to_hex(&boot_id)).as_bytes())?;
    }

    Ok(())
}

fn cmd_header(session: &JournalSession) -> Result<()> {
    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());

    for (index, journal) in session.files().enumerate() {
        if index > 0 {
            writeln!(w)?;
        }
        journal.print_header(&mut w)?;
    }

    w.flush()?;
    Ok(())
}

/// Checks every file, reporting each one. Fails if any file fails.
fn cmd_verify(session: &JournalSession) -> Result<()> {
    let mut failed = 0;

    for (path, e) in session.skipped() {
        println!("FAIL: {path} ({e})");
        failed += 1;
    }

    for journal in session.files() {
        let path = journal.file().path();
        match journal_core::verify(journal) {
            Ok(report) => println!(
                "PASS: {path} ({} entries, {} objects)",
                report.n_entries, report.n_objects
            ),
            Err(e) => {
                println!("FAIL: {path} ({e})");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} file(s) failed verification");
    }
    Ok(())
}

fn cmd_disk_usage(session: &JournalSession) -> Result<()> {
    let usage = session.usage()?;
    println!(
        "Archived and active journals take up {} in the file system.",
        bytesize::ByteSize::b(usage)
    );
    Ok(())
}

fn cmd_fields(session: &JournalSession) -> Result<()> {
    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());
    for name in session.field_names()? {
        writeln!(w, "{name}")?;
    }
    w.flush()?;
    Ok(())
}

fn cmd_field_values(session: &JournalSession, field: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());
    for value in session.query_unique(field)? {
        w.write_all(&value)?;
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

fn format_local(usec: u64, utc: bool) -> String {
    let secs = (usec / 1_000_000) as i64;
    let format = "%a %Y-%m-%d %H:%M:%S";
    if utc {
        if let Some(dt) = chrono::DateTime::from_timestamp(secs, 0) {
            return format!("{} UTC", dt.format(format));
        }
    } else if let Some(dt) = Local.timestamp_opt(secs, 0).single() {
        return dt.format(format).to_string();
    }
    usec.to_string()
}

fn cmd_list_boots(boots: &[Boot], utc: bool) -> Result<()> {
    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());
    let last = boots.len() as i64 - 1;

    for (index, boot) in boots.iter().enumerate() {
        writeln!(
            w,
            "{:>3} {} {} - {}",
            index as i64 - last,
            id128::to_hex(&boot.boot_id),
            format_local(boot.first_realtime, utc),
            format_local(boot.last_realtime, utc),
        )?;
    }

    w.flush()?;
    Ok(())
}

/// Prints entries and tracks what was printed.
struct Printer<W: Write> {
    w: W,
    mode: OutputMode,
    utc: bool,
    grep: Option<Regex>,
    until: Option<u64>,
    since: Option<u64>,
    printed: usize,
    last_cursor: Option<String>,
}

impl<W: Write> Printer<W> {
    /// Whether the current entry lies within `--since`/`--until`.
    fn in_range(&self, session: &JournalSession) -> Result<bool> {
        let realtime = session.realtime()?;
        Ok(self.since.is_none_or(|s| realtime >= s) && self.until.is_none_or(|u| realtime <= u))
    }

    fn print_current(&mut self, session: &JournalSession) -> Result<()> {
        let entry = Entry::new(
            session.cursor()?,
            session.realtime()?,
            session.monotonic()?,
            session.entry_data()?,
        );

        if let Some(re) = &self.grep {
            let message = entry.field("MESSAGE").unwrap_or_default();
            if !re.is_match(&String::from_utf8_lossy(message)) {
                return Ok(());
            }
        }

        output::format(&entry, self.mode, self.utc, &mut self.w)?;
        self.printed += 1;
        self.last_cursor = Some(entry.cursor);
        Ok(())
    }
}

/// Steps back from the end over at most `lines` entries within range,
/// leaving the session on the first one to print. Returns `false` when
/// there is none.
fn rewind(session: &mut JournalSession, printer: &Printer<impl Write>, lines: usize) -> Result<bool> {
    match printer.until {
        Some(until) => session.seek_realtime(until),
        None => session.seek_tail(),
    }

    let mut taken = 0;
    while taken < lines && session.previous()? {
        if !printer.in_range(session)? {
            if taken > 0 {
                session.next()?;
            }
            break;
        }
        taken += 1;
    }
    Ok(taken > 0)
}

/// Positions the session where forward output starts. Returns whether it
/// already sits on an entry to print.
fn position_forward(
    session: &mut JournalSession,
    cli: &Cli,
    printer: &Printer<impl Write>,
) -> Result<bool> {
    if let Some(cursor) = cli.cursor.as_deref() {
        session.seek_cursor(cursor)?;
        return Ok(false);
    }

    if let Some(cursor) = cli.after_cursor.as_deref() {
        session.seek_cursor(cursor)?;
        if session.next()? && !session.test_cursor(cursor)? {
            // The entry itself is gone, this is the one after it
            return Ok(true);
        }
        return Ok(false);
    }

    let lines = cli.lines.or(cli.follow.then_some(FOLLOW_DEFAULT_LINES));
    if let Some(lines) = lines {
        if rewind(session, printer, lines)? {
            return Ok(true);
        }
        // Nothing to show yet; continue after the current end
        session.seek_tail();
        if !session.previous()? {
            session.seek_head();
        }
        return Ok(false);
    }

    match printer.since {
        Some(since) => session.seek_realtime(since),
        None => session.seek_head(),
    }
    Ok(false)
}

fn run_forward(session: &mut JournalSession, cli: &Cli, printer: &mut Printer<impl Write>) -> Result<()> {
    // Without a cursor, --lines was applied when positioning
    let from_cursor = cli.cursor.is_some() || cli.after_cursor.is_some();
    let mut limit = match cli.lines {
        Some(lines) if from_cursor => lines,
        _ => usize::MAX,
    };

    if position_forward(session, cli, printer)? {
        printer.print_current(session)?;
    }

    loop {
        while printer.printed < limit && session.next()? {
            if printer.until.is_some_and(|u| session.realtime().is_ok_and(|r| r > u)) {
                break;
            }
            printer.print_current(session)?;
        }
        printer.w.flush()?;

        if !cli.follow {
            return Ok(());
        }
        limit = usize::MAX;
        std::thread::sleep(FOLLOW_POLL_INTERVAL);
        session.refresh()?;
    }
}

fn run_reverse(session: &mut JournalSession, cli: &Cli, printer: &mut Printer<impl Write>) -> Result<()> {
    let limit = cli.lines.unwrap_or(usize::MAX);

    if let Some(cursor) = cli.cursor.as_deref().or(cli.after_cursor.as_deref()) {
        session.seek_cursor(cursor)?;
        if cli.after_cursor.is_some() && session.previous()? && !session.test_cursor(cursor)? {
            printer.print_current(session)?;
        }
    } else {
        match printer.until {
            Some(until) => session.seek_realtime(until),
            None => session.seek_tail(),
        }
    }

    while printer.printed < limit && session.previous()? {
        if printer.since.is_some_and(|s| session.realtime().is_ok_and(|r| r < s)) {
            break;
        }
        printer.print_current(session)?;
    }

    printer.w.flush()?;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if cli.follow && cli.reverse {
        bail!("--follow and --reverse cannot be combined");
    }

    let mut session = open_session(&cli)?;

    if cli.header {
        return cmd_header(&session);
    }
    if cli.verify {
        return cmd_verify(&session);
    }
    if cli.disk_usage {
        return cmd_disk_usage(&session);
    }
    if cli.fields {
        return cmd_fields(&session);
    }
    if let Some(ref field) = cli.field {
        return cmd_field_values(&session, field);
    }
    if cli.list_boots {
        let boots = session.boots()?;
        return cmd_list_boots(&boots, cli.utc);
    }

    let grep = cli
        .grep
        .as_deref()
        .map(|pat| Regex::new(pat).with_context(|| format!("invalid regex: {pat:?}")))
        .transpose()?;

    apply_matches(&mut session, &cli)?;

    let stdout = io::stdout();
    let mut printer = Printer {
        w: BufWriter::new(stdout.lock()),
        mode: cli.output,
        utc: cli.utc,
        grep,
        since: cli.since.as_deref().map(parse_timestamp).transpose()?,
        until: cli.until.as_deref().map(parse_timestamp).transpose()?,
        printed: 0,
        last_cursor: None,
    };

    if cli.reverse {
        run_reverse(&mut session, &cli, &mut printer)?;
    } else {
        run_forward(&mut session, &cli, &mut printer)?;
    }

    if cli.show_cursor {
        if let Some(cursor) = &printer.last_cursor {
            writeln!(printer.w, "-- cursor: {cursor}")?;
        }
    }
    printer.w.flush()?;
    Ok(())
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::BrokenPipe)
    })
}

fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if is_broken_pipe(&err) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("journalctl: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranges() {
        assert_eq!(parse_priority_range("err").unwrap(), 0..=3);
        assert_eq!(parse_priority_range("5").unwrap(), 0..=5);
        assert_eq!(parse_priority_range("warning..crit").unwrap(), 2..=4);
        assert_eq!(parse_priority_range("info..").unwrap(), 6..=7);
        assert!(parse_priority_range("loud").is_err());
        assert!(parse_priority_range("9").is_err());
    }

    #[test]
    fn absolute_timestamps() {
        assert_eq!(parse_timestamp("1700000000000000").unwrap(), 1_700_000_000_000_000);
        assert_eq!(parse_timestamp("@1700000000").unwrap(), 1_700_000_000_000_000);
        assert!(parse_timestamp("2024-02-30").is_err());
        assert!(parse_timestamp("soon").is_err());
    }

    #[test]
    fn relative_timestamps() {
        let now = chrono::Utc::now().timestamp_micros() as u64;
        let hour_ago = parse_timestamp("-1h").unwrap();
        assert!(now - hour_ago >= 3_600_000_000);
        assert!(now - hour_ago < 3_700_000_000);

        let days_ago = parse_timestamp("2 days ago").unwrap();
        assert!(now - days_ago >= 2 * 86_400_000_000);
    }

    #[test]
    fn command_line() {
        let cli = Cli::try_parse_from([
            "journalctl", "-o", "json-pretty", "-b", "-1", "_UID=0", "+", "_UID=1000",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputMode::JsonPretty);
        assert_eq!(cli.boot.as_deref(), Some("-1"));
        assert_eq!(cli.matches, ["_UID=0", "+", "_UID=1000"]);

        let cli = Cli::try_parse_from(["journalctl", "--boot"]).unwrap();
        assert_eq!(cli.boot.as_deref(), Some("0"));
    }
}
