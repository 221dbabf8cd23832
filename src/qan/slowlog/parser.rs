use std::io::BufRead;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::DateTime;
use regex::Regex;

use crate::qan::event::{parse_time, Event};

static HEADER_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+):\s+([^\s:]*)(?:\s|$)").expect("static regex"));
static USE_DB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^use\s+`?([^`;\s]+)`?\s*;?\s*$").expect("static regex"));
static SET_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^SET\s+timestamp\s*=\s*(\d+)\s*;?\s*$").expect("static regex"));

const ADMIN_PREFIX: &str = "administrator command:";

/// Streaming slow log parser.
///
/// Reads line by line from `offset` and yields one [`Event`] per entry. An
/// entry ends where a `#` header line follows query text. When started in
/// the middle of the file, lines up to the next entry boundary are skipped.
pub struct SlowLogParser<R> {
    reader: R,
    pos: u64,
    pending: Option<(u64, String)>,
    synced: bool,
    buf: Vec<u8>,
}

impl<R: BufRead> SlowLogParser<R> {
    /// `reader` must already be positioned at `offset`.
    pub fn new(reader: R, offset: u64) -> Self {
        Self {
            reader,
            pos: offset,
            pending: None,
            synced: offset == 0,
            buf: Vec::with_capacity(1024),
        }
    }

    /// Offset of the first byte not yet consumed by a returned event.
    pub fn offset(&self) -> u64 {
        match &self.pending {
            Some((start, _)) => *start,
            None => self.pos,
        }
    }

    fn read_line(&mut self) -> Result<Option<(u64, String)>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }

        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .context("reading slow log")?;
        if n == 0 {
            return Ok(None);
        }

        let start = self.pos;
        self.pos += n as u64;

        let text = String::from_utf8_lossy(&self.buf);
        Ok(Some((start, text.trim_end_matches(['\n', '\r']).to_string())))
    }

    /// Next complete event, or `None` at end of input.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        let mut event: Option<Event> = None;
        let mut in_query = false;
        let mut saw_text = false;
        let mut use_line: Option<String> = None;
        let mut query = String::new();

        while let Some((start, line)) = self.read_line()? {
            if is_server_banner(&line) {
                continue;
            }

            if let Some(header) = line.strip_prefix('#') {
                if !self.synced {
                    if saw_text || is_event_start(header) {
                        self.synced = true;
                    } else {
                        continue;
                    }
                }

                if in_query {
                    self.pending = Some((start, line));
                    break;
                }

                let e = event.get_or_insert_with(|| Event {
                    offset: start,
                    ..Default::default()
                });
                if parse_header(e, header.trim()) {
                    in_query = true;
                }
                continue;
            }

            if !self.synced {
                saw_text = true;
                continue;
            }

            let e = event.get_or_insert_with(|| Event {
                offset: start,
                ..Default::default()
            });

            if !in_query {
                if let Some(caps) = USE_DB.captures(line.trim()) {
                    e.db = caps[1].to_string();
                    use_line = Some(line.trim().trim_end_matches(';').to_string());
                    continue;
                }
                if let Some(caps) = SET_TIMESTAMP.captures(line.trim()) {
                    if let Ok(secs) = caps[1].parse::<i64>() {
                        e.ts = DateTime::from_timestamp(secs, 0).or(e.ts);
                    }
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
            }

            if !query.is_empty() {
                query.push('\n');
            }
            query.push_str(&line);
            in_query = true;
        }

        let Some(mut e) = event else {
            return Ok(None);
        };

        if !e.admin {
            let q = query.trim().trim_end_matches(';').trim_end();
            e.query = if q.is_empty() {
                use_line.unwrap_or_default()
            } else {
                q.to_string()
            };
        }

        Ok(Some(e))
    }
}

impl<R: BufRead> Iterator for SlowLogParser<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

/// Server start banner lines written when the log is (re)opened.
fn is_server_banner(line: &str) -> bool {
    line.starts_with("Tcp port:")
        || (line.starts_with("Time ") && line.contains("Id Command"))
        || (line.contains(", Version: ") && line.contains("started with"))
}

fn is_event_start(header: &str) -> bool {
    let h = header.trim_start();
    h.starts_with("Time:") || h.starts_with("User@Host:")
}

/// Apply one header line to the event. Returns true if the line is the
/// event's statement (administrator commands).
fn parse_header(e: &mut Event, header: &str) -> bool {
    if let Some(ts) = header.strip_prefix("Time:") {
        e.ts = parse_time(ts).or(e.ts);
        return false;
    }

    if let Some(rest) = header.strip_prefix("User@Host:") {
        parse_user_host(e, rest);
        return false;
    }

    if let Some(cmd) = header.strip_prefix(ADMIN_PREFIX) {
        e.admin = true;
        e.query = format!("{ADMIN_PREFIX} {}", cmd.trim().trim_end_matches(';'));
        return true;
    }

    for caps in HEADER_PAIR.captures_iter(header) {
        e.add_header(&caps[1], &caps[2]);
    }
    false
}

/// `user[user] @ host [1.2.3.4]  Id: 5`
fn parse_user_host(e: &mut Event, rest: &str) {
    let rest = rest.split("Id:").next().unwrap_or(rest).trim();
    let (user_part, host_part) = rest.split_once('@').unwrap_or((rest, ""));

    e.user = user_part
        .split('[')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    let host_part = host_part.trim();
    let (name, ip) = match host_part.split_once('[') {
        Some((name, ip)) => (name.trim(), ip.trim_end_matches(']').trim()),
        None => (host_part, ""),
    };
    e.host = if name.is_empty() { ip } else { name }.to_string();
}
