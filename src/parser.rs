//! M3U / M3U8 / plain-text playlist parsing and serialization.
//!
//! Parsing is deliberately forgiving: anything we can't make sense of is
//! skipped or replaced by a placeholder rather than failing the whole file.

use crate::channel::{Channel, DEFAULT_CHANNEL_NAME};
use crate::errors::{MatrixError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// `key="value"` pairs on `#EXTINF` and `#EXTM3U` lines
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z0-9_.-]+)\s*=\s*"([^"]*)""#).unwrap());

/// `#KEY:VALUE` comment tags
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#([A-Za-z0-9_-]+):(.*)$").unwrap());

/// Attributes mapped onto dedicated `Channel` fields
const KNOWN_ATTRS: [&str; 4] = ["tvg-id", "tvg-logo", "tvg-chno", "group-title"];

/// Parsed playlist file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Playlist {
    pub title: Option<String>,
    /// From `x-tvg-url` or `url-tvg` in the header
    pub epg_url: Option<String>,
    pub header_attrs: BTreeMap<String, String>,
    pub channels: Vec<Channel>,
    /// Lines that were neither tags nor URLs
    pub skipped_lines: usize,
}

impl Playlist {
    pub fn to_m3u(&self) -> String {
        to_m3u(&self.channels, self.epg_url.as_deref())
    }
}

#[derive(Debug, Default)]
struct PendingEntry {
    /// Set once an `#EXTINF` line has been seen for this entry
    has_extinf: bool,
    name: Option<String>,
    attrs: BTreeMap<String, String>,
    group_override: Option<String>,
    backups: Vec<String>,
    tags: BTreeMap<String, String>,
}

impl PendingEntry {
    fn into_channel(self, url: &str, position: usize) -> Channel {
        let PendingEntry {
            has_extinf,
            name,
            mut attrs,
            group_override,
            backups,
            tags,
        } = self;

        let name = name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| attrs.get("tvg-name").filter(|n| !n.trim().is_empty()).cloned())
            .map(|n| decode_name(n.trim()))
            .unwrap_or_else(|| {
                if has_extinf {
                    DEFAULT_CHANNEL_NAME.to_string()
                } else {
                    name_from_url(url)
                }
            });

        let group = group_override
            .or_else(|| attrs.remove("group-title"))
            .unwrap_or_default();

        let mut channel = Channel::new(name, url).with_group(group);
        channel.tvg_id = attrs.remove("tvg-id").filter(|s| !s.is_empty());
        channel.logo = attrs.remove("tvg-logo").filter(|s| !s.is_empty());
        channel.num = attrs
            .remove("tvg-chno")
            .and_then(|n| n.trim().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(position as u32);
        for b in backups {
            channel.add_backup(b);
        }
        channel.custom_tags = attrs;
        channel.custom_tags.extend(tags);
        channel
    }
}

/// Parse `key="value"` attributes out of a tag line
pub fn extract_attrs(info: &str) -> BTreeMap<String, String> {
    ATTR_RE
        .captures_iter(info)
        .map(|caps| (caps[1].to_lowercase(), caps[2].trim().to_string()))
        .collect()
}

/// Split the body of an `#EXTINF:` line into its attributes and display name.
///
/// The name starts at the first comma after the last quoted attribute, so
/// commas inside attribute values don't truncate it.
fn split_extinf(info: &str) -> (BTreeMap<String, String>, Option<String>) {
    let attrs = extract_attrs(info);
    let attrs_end = ATTR_RE.find_iter(info).last().map(|m| m.end()).unwrap_or(0);
    let name = info[attrs_end..]
        .find(',')
        .map(|pos| info[attrs_end + pos + 1..].trim().to_string());
    (attrs, name)
}

/// URL-decode a channel name if it looks percent-encoded
pub fn decode_name(name: &str) -> String {
    if !name.contains('%') {
        return name.to_string();
    }
    match urlencoding::decode(name) {
        Ok(decoded) => decoded.trim().to_string(),
        Err(_) => name.to_string(),
    }
}

/// Best-effort display name for an entry that only has a URL
pub fn name_from_url(url: &str) -> String {
    let from_path = url::Url::parse(url).ok().and_then(|parsed| {
        let segment = parsed
            .path_segments()
            .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(str::to_string));
        match segment {
            Some(seg) => {
                let stem = seg.rsplit_once('.').map(|(s, _)| s.to_string()).unwrap_or(seg);
                Some(decode_name(&stem))
            }
            None => parsed.host_str().map(str::to_string),
        }
    });
    from_path
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_CHANNEL_NAME.to_string())
}

fn looks_like_url(s: &str) -> bool {
    s.contains("://")
}

/// Parse M3U / M3U8 content
pub fn parse_m3u(content: &str) -> Playlist {
    let mut playlist = Playlist::default();
    let mut pending: Option<PendingEntry> = None;

    for raw in content.lines() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() {
            continue;
        }

        if line.starts_with("#EXTM3U") {
            playlist.header_attrs = extract_attrs(line);
            playlist.epg_url = playlist
                .header_attrs
                .get("x-tvg-url")
                .or_else(|| playlist.header_attrs.get("url-tvg"))
                .cloned();
            continue;
        }

        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let (attrs, name) = split_extinf(info);
            // Tags seen before this #EXTINF still belong to the entry, but a
            // second #EXTINF without a URL in between starts a new one
            if pending.as_ref().is_some_and(|p| p.has_extinf) {
                playlist.skipped_lines += 1;
                pending = None;
            }
            let entry = pending.get_or_insert_with(PendingEntry::default);
            entry.has_extinf = true;
            entry.attrs = attrs;
            entry.name = name;
            continue;
        }

        if let Some(group) = line.strip_prefix("#EXTGRP:") {
            let group = group.trim();
            if !group.is_empty() {
                pending.get_or_insert_with(PendingEntry::default).group_override =
                    Some(group.to_string());
            }
            continue;
        }

        if let Some(backup) = line.strip_prefix("#EXTBAK:") {
            let backup = backup.trim();
            if !backup.is_empty() {
                pending
                    .get_or_insert_with(PendingEntry::default)
                    .backups
                    .push(backup.to_string());
            }
            continue;
        }

        if let Some(title) = line.strip_prefix("#PLAYLIST:") {
            playlist.title = Some(title.trim().to_string());
            continue;
        }

        if line.starts_with('#') {
            if let Some(caps) = TAG_RE.captures(line) {
                pending
                    .get_or_insert_with(PendingEntry::default)
                    .tags
                    .insert(format!("#{}", &caps[1]), caps[2].trim().to_string());
            }
            continue;
        }

        if looks_like_url(line) || line.starts_with('/') {
            let position = playlist.channels.len() + 1;
            let entry = pending.take().unwrap_or_default();
            playlist.channels.push(entry.into_channel(line, position));
        } else {
            tracing::debug!(line, "skipping unrecognized playlist line");
            playlist.skipped_lines += 1;
        }
    }

    playlist
}

/// Parse a plain text list: `Name,URL`, `Name | URL`, or one bare URL per line
pub fn parse_txt(content: &str) -> Playlist {
    let mut playlist = Playlist::default();

    for raw in content.lines() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, url) = if let Some((name, url)) = line.rsplit_once(" | ") {
            (Some(name.trim()), url.trim())
        } else if let Some((name, url)) = line
            .rsplit_once(',')
            .filter(|(_, url)| looks_like_url(url))
        {
            (Some(name.trim()), url.trim())
        } else {
            (None, line)
        };

        if !looks_like_url(url) {
            playlist.skipped_lines += 1;
            continue;
        }

        let name = name
            .filter(|n| !n.is_empty())
            .map(decode_name)
            .unwrap_or_else(|| name_from_url(url));
        let mut channel = Channel::new(name, url);
        channel.num = playlist.channels.len() as u32 + 1;
        playlist.channels.push(channel);
    }

    playlist
}

/// Detect the format from content and parse accordingly
pub fn parse_playlist(content: &str) -> Playlist {
    let head = content.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("#EXTM3U") || content.contains("#EXTINF") {
        parse_m3u(content)
    } else {
        parse_txt(content)
    }
}

/// Decode file bytes as UTF-8, falling back to Latin-1
pub fn decode_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            tracing::debug!("playlist is not valid UTF-8, decoding as Latin-1");
            bytes.iter().map(|&b| b as char).collect()
        }
    }
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Read and parse a playlist from disk. `.json` files are read as channel exports.
pub fn read_playlist_file(path: &Path) -> Result<Playlist> {
    let bytes = std::fs::read(path)?;
    let content = decode_bytes(&bytes);
    if is_json_path(path) {
        return Ok(Playlist {
            channels: from_json(&content)?,
            ..Default::default()
        });
    }
    let playlist = parse_playlist(&content);
    tracing::info!(
        path = %path.display(),
        channels = playlist.channels.len(),
        skipped = playlist.skipped_lines,
        "parsed playlist"
    );
    Ok(playlist)
}

fn escape_attr(value: &str) -> String {
    value.replace('"', "'")
}

/// Serialize channels to M3U text
pub fn to_m3u(channels: &[Channel], epg_url: Option<&str>) -> String {
    let mut out = String::with_capacity(channels.len() * 160 + 32);
    out.push_str("#EXTM3U");
    if let Some(epg) = epg_url {
        out.push_str(&format!(" x-tvg-url=\"{}\"", escape_attr(epg)));
    }
    out.push('\n');

    for ch in channels {
        out.push_str("#EXTINF:-1");
        if let Some(id) = &ch.tvg_id {
            out.push_str(&format!(" tvg-id=\"{}\"", escape_attr(id)));
        }
        if let Some(logo) = &ch.logo {
            out.push_str(&format!(" tvg-logo=\"{}\"", escape_attr(logo)));
        }
        if ch.num > 0 {
            out.push_str(&format!(" tvg-chno=\"{}\"", ch.num));
        }
        out.push_str(&format!(" group-title=\"{}\"", escape_attr(&ch.group)));
        for (key, value) in ch.custom_tags.iter().filter(|(k, _)| !k.starts_with('#')) {
            if KNOWN_ATTRS.contains(&key.as_str()) {
                continue;
            }
            out.push_str(&format!(" {}=\"{}\"", key, escape_attr(value)));
        }
        out.push(',');
        out.push_str(&ch.name);
        out.push('\n');

        out.push_str(&format!("#EXTGRP:{}\n", ch.group));
        for (key, value) in ch.custom_tags.iter().filter(|(k, _)| k.starts_with('#')) {
            out.push_str(&format!("{}:{}\n", key, value));
        }
        for backup in &ch.backups {
            out.push_str(&format!("#EXTBAK:{}\n", backup));
        }
        out.push_str(&ch.url);
        out.push('\n');
    }

    out
}

pub fn to_json(channels: &[Channel]) -> Result<String> {
    Ok(serde_json::to_string_pretty(channels)?)
}

/// Accepts a bare channel array or an object with a `channels` field
pub fn from_json(content: &str) -> Result<Vec<Channel>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum JsonPlaylist {
        List(Vec<Channel>),
        Wrapped { channels: Vec<Channel> },
    }

    match serde_json::from_str::<JsonPlaylist>(content) {
        Ok(JsonPlaylist::List(channels)) | Ok(JsonPlaylist::Wrapped { channels }) => Ok(channels),
        Err(e) => Err(MatrixError::parse("channel JSON", e.to_string())),
    }
}

/// Write a playlist atomically: the content goes to a unique temp file in the
/// same directory which is then renamed over the target.
pub fn write_playlist_file(path: &Path, channels: &[Channel], epg_url: Option<&str>) -> Result<()> {
    let content = if is_json_path(path) {
        to_json(channels)?
    } else {
        to_m3u(channels, epg_url)
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MatrixError::InvalidInput(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    tracing::info!(path = %path.display(), channels = channels.len(), "saved playlist");
    Ok(())
}

/// Download and parse a remote playlist
pub async fn fetch_playlist(client: &reqwest::Client, url: &str) -> Result<Playlist> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let bytes = resp.bytes().await?;
    let playlist = parse_playlist(&decode_bytes(&bytes));
    tracing::info!(url, channels = playlist.channels.len(), "fetched playlist");
    Ok(playlist)
}
