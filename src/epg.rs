//! XMLTV guide parsing.
//!
//! Real-world XMLTV feeds are frequently not well-formed, so the raw text is
//! cleaned (illegal control characters dropped, bare `&` escaped) before it
//! reaches the XML reader, and individual broken `<programme>` elements are
//! skipped instead of failing the whole import.

use crate::channel::Channel;
use crate::errors::{MatrixError, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

const MAX_STORED_ERRORS: usize = 50;

/// Used when a programme has no usable stop time and nothing follows it
const DEFAULT_PROGRAMME_MINUTES: i64 = 30;

static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{0,15});").unwrap());

/// A single scheduled programme
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Programme {
    pub channel_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub icon: Option<String>,
}

impl Programme {
    pub fn is_airing(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.stop
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.stop - self.start).num_minutes()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpgChannel {
    pub id: String,
    pub display_name: String,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EpgData {
    pub channels: BTreeMap<String, EpgChannel>,
    /// Programmes per channel id, sorted by start time
    pub programmes: HashMap<String, Vec<Programme>>,
    /// First few parse problems, for reporting
    pub errors: Vec<String>,
    pub error_count: usize,
}

impl EpgData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_programme(&self, channel_id: &str, at: DateTime<Utc>) -> Option<&Programme> {
        self.programmes
            .get(channel_id)?
            .iter()
            .find(|p| p.is_airing(at))
    }

    pub fn next_programme(&self, channel_id: &str, at: DateTime<Utc>) -> Option<&Programme> {
        self.programmes
            .get(channel_id)?
            .iter()
            .find(|p| p.start > at)
    }

    pub fn programmes_in_range(
        &self,
        channel_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<&Programme> {
        self.programmes
            .get(channel_id)
            .map(|list| list.iter().filter(|p| p.stop > from && p.start < to).collect())
            .unwrap_or_default()
    }

    pub fn programme_count(&self) -> usize {
        self.programmes.values().map(Vec::len).sum()
    }

    /// Every channel id that has either a `<channel>` entry or programmes
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .keys()
            .chain(self.programmes.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn display_name<'a>(&'a self, channel_id: &'a str) -> &'a str {
        self.channels
            .get(channel_id)
            .map(|c| c.display_name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(channel_id)
    }

    /// Fill in missing `tvg_id`s by matching channel names against EPG
    /// display names or ids, case-insensitively. Returns how many were filled.
    pub fn match_channels(&self, channels: &mut [Channel]) -> usize {
        let mut lookup: HashMap<String, &str> = HashMap::new();
        for (id, ch) in &self.channels {
            lookup.insert(id.to_lowercase(), id);
            if !ch.display_name.is_empty() {
                lookup.entry(ch.display_name.to_lowercase()).or_insert(id);
            }
        }

        let mut matched = 0;
        for ch in channels.iter_mut().filter(|c| c.tvg_id.is_none()) {
            if let Some(id) = lookup.get(&ch.name.trim().to_lowercase()) {
                ch.tvg_id = Some(id.to_string());
                matched += 1;
            }
        }
        matched
    }

    fn record_error(&mut self, message: String) {
        self.error_count += 1;
        if self.errors.len() < MAX_STORED_ERRORS {
            self.errors.push(message);
        }
    }
}

/// Parse an XMLTV timestamp: `YYYYMMDDHHMMSS [+-]HHMM`. Seconds and offset are optional.
pub fn parse_xmltv_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let digits_len = value.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits_len < 12 {
        return None;
    }

    let field = |range: std::ops::Range<usize>| value.get(range)?.parse::<u32>().ok();
    let year = value.get(0..4)?.parse::<i32>().ok()?;
    let month = field(4..6)?;
    let day = field(6..8)?;
    let hour = field(8..10)?;
    let minute = field(10..12)?;
    let second = if digits_len >= 14 { field(12..14)? } else { 0 };

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;

    let rest = value[digits_len..].trim();
    let offset_secs = parse_offset(rest)?;
    let offset = FixedOffset::east_opt(offset_secs)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `+0100` / `-0530` / `Z` / empty -> seconds east of UTC
fn parse_offset(s: &str) -> Option<i32> {
    if s.is_empty() || s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Some(0);
    }
    let (sign, digits) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits = digits.replace(':', "");
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[0..2].parse().ok()?;
    let minutes: i32 = digits[2..4].parse().ok()?;
    Some(sign * (hours * 3600 + minutes * 60))
}

fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// Drop characters XML 1.0 forbids and escape `&` that doesn't start an entity
pub fn clean_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + raw.len() / 64);
    for (i, c) in raw.char_indices() {
        if c == '&' {
            if ENTITY_RE.is_match(&raw[i..]) {
                out.push('&');
            } else {
                out.push_str("&amp;");
            }
        } else if is_xml_char(c) {
            out.push(c);
        }
    }
    out
}

fn resolve_entity(name: &str) -> Option<String> {
    let resolved = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some(resolved.to_string())
}

/// Decode entity references left inside raw text or attribute values
fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match tail.find(';').and_then(|end| resolve_entity(&tail[1..end]).map(|r| (end, r))) {
            Some((end, resolved)) => {
                out.push_str(&resolved);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn get_attribute(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| decode_entities(&String::from_utf8_lossy(&attr.value)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Channel,
    Programme,
    Title,
    Desc,
    Category,
    DisplayName,
}

struct PendingProgramme {
    channel_id: String,
    title: String,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    description: Option<String>,
    category: Option<String>,
    icon: Option<String>,
}

/// Parse XMLTV text
pub fn parse_xmltv(xml: &str) -> EpgData {
    let cleaned = clean_xml(xml);
    let mut reader = Reader::from_reader(cleaned.as_bytes());

    let mut epg = EpgData::new();
    let mut pending_stops: HashMap<String, Vec<(Programme, bool)>> = HashMap::new();
    let mut buf = Vec::with_capacity(8192);
    let mut state = ParserState::Root;
    let mut current_channel: Option<EpgChannel> = None;
    let mut current_programme: Option<PendingProgramme> = None;
    let mut text_buf = String::new();

    loop {
        let position = reader.buffer_position();
        match reader.read_event_into(&mut buf) {
            // Self-closing <channel/> and <programme/> have no children
            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"channel" => {
                if let Some(id) = get_attribute(e, b"id").filter(|id| !id.is_empty()) {
                    epg.channels.entry(id.clone()).or_insert(EpgChannel {
                        id,
                        display_name: String::new(),
                        icon: None,
                    });
                }
            }
            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"programme" => {
                epg.record_error(format!(
                    "skipped empty programme on '{}'",
                    get_attribute(e, b"channel").unwrap_or_default()
                ));
            }
            // Self-closing text elements carry nothing and never see an End
            Ok(Event::Empty(ref e))
                if matches!(e.name().as_ref(), b"title" | b"desc" | b"category" | b"display-name") => {}
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    state = ParserState::Channel;
                    current_channel = Some(EpgChannel {
                        id: get_attribute(e, b"id").unwrap_or_default(),
                        display_name: String::new(),
                        icon: None,
                    });
                }
                b"programme" => {
                    state = ParserState::Programme;
                    current_programme = Some(PendingProgramme {
                        channel_id: get_attribute(e, b"channel").unwrap_or_default(),
                        title: String::new(),
                        start: get_attribute(e, b"start").and_then(|s| parse_xmltv_time(&s)),
                        stop: get_attribute(e, b"stop").and_then(|s| parse_xmltv_time(&s)),
                        description: None,
                        category: None,
                        icon: None,
                    });
                }
                b"title" if state == ParserState::Programme => {
                    state = ParserState::Title;
                    text_buf.clear();
                }
                b"desc" if state == ParserState::Programme => {
                    state = ParserState::Desc;
                    text_buf.clear();
                }
                b"category" if state == ParserState::Programme => {
                    state = ParserState::Category;
                    text_buf.clear();
                }
                b"display-name" if state == ParserState::Channel => {
                    state = ParserState::DisplayName;
                    text_buf.clear();
                }
                b"icon" => {
                    if let Some(src) = get_attribute(e, b"src") {
                        match state {
                            ParserState::Channel => {
                                if let Some(ch) = current_channel.as_mut() {
                                    ch.icon = Some(src);
                                }
                            }
                            ParserState::Programme => {
                                if let Some(p) = current_programme.as_mut() {
                                    p.icon = Some(src);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text_state(state) {
                    text_buf.push_str(&decode_entities(&String::from_utf8_lossy(&e)));
                }
            }
            Ok(Event::CData(e)) => {
                if in_text_state(state) {
                    text_buf.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_text_state(state) {
                    let name = String::from_utf8_lossy(&e);
                    match resolve_entity(&name) {
                        Some(resolved) => text_buf.push_str(&resolved),
                        None => {
                            text_buf.push('&');
                            text_buf.push_str(&name);
                            text_buf.push(';');
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    if let Some(ch) = current_channel.take() {
                        if !ch.id.is_empty() {
                            epg.channels.insert(ch.id.clone(), ch);
                        }
                    }
                    state = ParserState::Root;
                }
                b"programme" => {
                    if let Some(p) = current_programme.take() {
                        finish_programme(&mut epg, &mut pending_stops, p);
                    }
                    state = ParserState::Root;
                }
                b"title" | b"desc" | b"category" if state != ParserState::Root => {
                    let text = text_buf.trim().to_string();
                    if let Some(p) = current_programme.as_mut() {
                        match state {
                            ParserState::Title if p.title.is_empty() => p.title = text,
                            ParserState::Desc if !text.is_empty() => p.description = Some(text),
                            ParserState::Category if !text.is_empty() && p.category.is_none() => {
                                p.category = Some(text)
                            }
                            _ => {}
                        }
                    }
                    text_buf.clear();
                    state = ParserState::Programme;
                }
                b"display-name" => {
                    if let Some(ch) = current_channel.as_mut() {
                        if ch.display_name.is_empty() {
                            ch.display_name = text_buf.trim().to_string();
                        }
                    }
                    text_buf.clear();
                    state = ParserState::Channel;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                epg.record_error(format!("XML error at byte {}: {}", position, e));
                current_programme = None;
                current_channel = None;
                state = ParserState::Root;
                text_buf.clear();
                // The reader cannot always resync after a hard error
                if reader.buffer_position() <= position {
                    break;
                }
            }
            _ => {}
        }
        buf.clear();
    }

    for (channel_id, mut list) in pending_stops {
        list.sort_by_key(|(p, _)| p.start);
        let starts: Vec<DateTime<Utc>> = list.iter().map(|(p, _)| p.start).collect();
        let programmes = list
            .into_iter()
            .enumerate()
            .map(|(i, (mut p, has_stop))| {
                if !has_stop {
                    p.stop = starts
                        .get(i + 1)
                        .copied()
                        .filter(|next| *next > p.start)
                        .unwrap_or(p.start + Duration::minutes(DEFAULT_PROGRAMME_MINUTES));
                }
                p
            })
            .collect();
        epg.programmes.insert(channel_id, programmes);
    }

    tracing::info!(
        channels = epg.channels.len(),
        programmes = epg.programme_count(),
        errors = epg.error_count,
        "parsed XMLTV guide"
    );
    epg
}

fn in_text_state(state: ParserState) -> bool {
    matches!(
        state,
        ParserState::Title | ParserState::Desc | ParserState::Category | ParserState::DisplayName
    )
}

fn finish_programme(
    epg: &mut EpgData,
    pending: &mut HashMap<String, Vec<(Programme, bool)>>,
    p: PendingProgramme,
) {
    let start = match (p.channel_id.is_empty(), p.title.is_empty(), p.start) {
        (false, false, Some(start)) => start,
        _ => {
            epg.record_error(format!(
                "skipped programme on '{}' titled '{}': missing channel, title or start",
                p.channel_id, p.title
            ));
            return;
        }
    };

    let stop = p.stop.filter(|stop| *stop > start);
    let programme = Programme {
        channel_id: p.channel_id.clone(),
        title: p.title,
        start,
        stop: stop.unwrap_or(start),
        description: p.description,
        category: p.category,
        icon: p.icon,
    };
    pending
        .entry(p.channel_id)
        .or_default()
        .push((programme, stop.is_some()));
}

/// Decompress if the bytes carry the gzip magic number
fn maybe_gunzip(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::with_capacity(bytes.len() * 4);
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| MatrixError::Xml(format!("gzip decode failed: {}", e)))?;
        Ok(out)
    } else {
        Ok(bytes)
    }
}

/// Parse an XMLTV file from disk, plain or gzip-compressed
pub fn parse_file(path: &Path) -> Result<EpgData> {
    let bytes = maybe_gunzip(std::fs::read(path)?)?;
    Ok(parse_xmltv(&crate::parser::decode_bytes(&bytes)))
}

/// Download and parse a remote XMLTV guide
pub async fn fetch_epg(client: &reqwest::Client, url: &str) -> Result<EpgData> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let bytes = maybe_gunzip(resp.bytes().await?.to_vec())?;
    Ok(parse_xmltv(&crate::parser::decode_bytes(&bytes)))
}
