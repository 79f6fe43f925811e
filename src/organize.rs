use crate::channel::{Channel, ChannelStatus};
use crate::errors::Result;
use crate::parser::{read_playlist_file, Playlist};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SortKey {
    Name,
    Group,
    Number,
    Status,
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Drop channels whose URL was already seen. Returns how many were removed.
pub fn dedupe_by_url(channels: &mut Vec<Channel>) -> usize {
    let before = channels.len();
    let mut seen = HashSet::with_capacity(channels.len());
    channels.retain(|c| seen.insert(c.url.trim().to_string()));
    before - channels.len()
}

/// Collapse channels sharing a name into one entry, keeping the other URLs as backups.
/// Returns how many entries were folded away.
pub fn merge_duplicates_as_backups(channels: &mut Vec<Channel>) -> usize {
    let mut first_by_name: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Channel> = Vec::with_capacity(channels.len());
    let mut folded = 0;

    for ch in channels.drain(..) {
        let key = normalize_name(&ch.name);
        match first_by_name.get(&key) {
            Some(&idx) => {
                let target = &mut merged[idx];
                target.add_backup(ch.url);
                for b in ch.backups {
                    target.add_backup(b);
                }
                folded += 1;
            }
            None => {
                first_by_name.insert(key, merged.len());
                merged.push(ch);
            }
        }
    }

    *channels = merged;
    folded
}

fn status_rank(status: ChannelStatus) -> u8 {
    match status {
        ChannelStatus::Working => 0,
        ChannelStatus::Unchecked => 1,
        ChannelStatus::Timeout => 2,
        ChannelStatus::Broken => 3,
    }
}

/// Stable sort by the given key
pub fn sort_channels(channels: &mut [Channel], key: SortKey) {
    match key {
        SortKey::Name => channels.sort_by_key(|c| c.name.to_lowercase()),
        SortKey::Group => {
            channels.sort_by(|a, b| {
                a.group
                    .to_lowercase()
                    .cmp(&b.group.to_lowercase())
                    .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            });
        }
        SortKey::Number => channels.sort_by_key(|c| if c.num == 0 { u32::MAX } else { c.num }),
        SortKey::Status => channels.sort_by_key(|c| status_rank(c.status)),
    }
}

/// Number channels 1..=n in list order
pub fn renumber(channels: &mut [Channel]) {
    for (i, ch) in channels.iter_mut().enumerate() {
        ch.num = i as u32 + 1;
    }
}

/// Unique groups in first-appearance order
pub fn group_names(channels: &[Channel]) -> Vec<String> {
    let mut seen = HashSet::new();
    channels
        .iter()
        .filter(|c| seen.insert(c.group.as_str()))
        .map(|c| c.group.clone())
        .collect()
}

pub fn filter_by_group<'a>(channels: &'a [Channel], group: &str) -> Vec<&'a Channel> {
    channels
        .iter()
        .filter(|c| c.group.eq_ignore_ascii_case(group))
        .collect()
}

/// Rename a group everywhere. Returns the number of channels touched.
pub fn rename_group(channels: &mut [Channel], from: &str, to: &str) -> usize {
    let mut count = 0;
    for ch in channels.iter_mut().filter(|c| c.group == from) {
        ch.group = to.to_string();
        count += 1;
    }
    count
}

/// Move the channels at `indices` into `group`
pub fn set_group(channels: &mut [Channel], indices: &[usize], group: &str) -> usize {
    let mut count = 0;
    for &i in indices {
        if let Some(ch) = channels.get_mut(i) {
            ch.group = group.to_string();
            count += 1;
        }
    }
    count
}

/// Fuzzy search over name, group and tvg-id; best match first
pub fn search<'a>(channels: &'a [Channel], query: &str) -> Vec<&'a Channel> {
    let query = query.trim();
    if query.is_empty() {
        return channels.iter().collect();
    }

    let matcher = SkimMatcherV2::default().ignore_case();
    let mut scored: Vec<(i64, usize, &Channel)> = channels
        .iter()
        .enumerate()
        .filter_map(|(i, ch)| {
            let best = [
                Some(ch.name.as_str()),
                Some(ch.group.as_str()),
                ch.tvg_id.as_deref(),
            ]
            .into_iter()
            .flatten()
            .filter_map(|field| matcher.fuzzy_match(field, query))
            .max()?;
            Some((best, i, ch))
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, _, ch)| ch).collect()
}

/// Plain substring replacement in channel names
pub fn find_replace_names(channels: &mut [Channel], find: &str, replace: &str) -> usize {
    if find.is_empty() {
        return 0;
    }
    let mut count = 0;
    for ch in channels.iter_mut().filter(|c| c.name.contains(find)) {
        ch.name = ch.name.replace(find, replace).trim().to_string();
        count += 1;
    }
    count
}

pub fn remove_by_status(channels: &mut Vec<Channel>, statuses: &[ChannelStatus]) -> usize {
    let before = channels.len();
    channels.retain(|c| !statuses.contains(&c.status));
    before - channels.len()
}

pub fn status_counts(channels: &[Channel]) -> BTreeMap<ChannelStatus, usize> {
    let mut counts = BTreeMap::new();
    for ch in channels {
        *counts.entry(ch.status).or_insert(0) += 1;
    }
    counts
}

/// Make a string safe to use as a file name on all platforms
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();

    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
    ];
    let stem = cleaned.split('.').next().unwrap_or("").to_uppercase();
    let mut result = if reserved.contains(&stem.as_str()) {
        format!("_{}", cleaned)
    } else {
        cleaned.to_string()
    };

    if result.is_empty() {
        result = "untitled".to_string();
    }
    result.chars().take(200).collect()
}

/// Parse several playlists in parallel and concatenate them in argument order
pub fn merge_files(paths: &[PathBuf]) -> Result<Playlist> {
    let parsed: Vec<Result<Playlist>> = paths.par_iter().map(|p| read_playlist_file(p)).collect();

    let mut merged = Playlist::default();
    for playlist in parsed {
        let playlist = playlist?;
        if merged.epg_url.is_none() {
            merged.epg_url = playlist.epg_url;
        }
        merged.skipped_lines += playlist.skipped_lines;
        merged.channels.extend(playlist.channels);
    }
    Ok(merged)
}
