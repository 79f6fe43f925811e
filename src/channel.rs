use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_CHANNEL_NAME: &str = "Unknown Channel";
pub const DEFAULT_GROUP: &str = "Uncategorized";

/// Result of the last validation run for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Unchecked,
    Working,
    Broken,
    Timeout,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Unchecked => "unchecked",
            ChannelStatus::Working => "working",
            ChannelStatus::Broken => "broken",
            ChannelStatus::Timeout => "timeout",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Broken | ChannelStatus::Timeout)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unchecked" | "" => Ok(ChannelStatus::Unchecked),
            "working" => Ok(ChannelStatus::Working),
            "broken" => Ok(ChannelStatus::Broken),
            "timeout" => Ok(ChannelStatus::Timeout),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// A single playlist entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub url: String,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub tvg_id: Option<String>,
    #[serde(default)]
    pub num: u32,
    #[serde(default)]
    pub backups: Vec<String>,
    /// Attributes and `#KEY:VALUE` lines we don't model explicitly
    #[serde(default)]
    pub custom_tags: BTreeMap<String, String>,
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    #[serde(default)]
    pub status: ChannelStatus,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

impl Channel {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name: if name.trim().is_empty() {
                DEFAULT_CHANNEL_NAME.to_string()
            } else {
                name
            },
            group: default_group(),
            url: url.into(),
            logo: None,
            tvg_id: None,
            num: 0,
            backups: Vec::new(),
            custom_tags: BTreeMap::new(),
            uuid: Uuid::new_v4(),
            status: ChannelStatus::Unchecked,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        if !group.trim().is_empty() {
            self.group = group;
        }
        self
    }

    /// Primary URL followed by backups, skipping empties and repeats
    pub fn all_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = Vec::with_capacity(1 + self.backups.len());
        for u in std::iter::once(&self.url).chain(self.backups.iter()) {
            let u = u.as_str();
            if !u.is_empty() && !urls.contains(&u) {
                urls.push(u);
            }
        }
        urls
    }

    pub fn add_backup(&mut self, url: impl Into<String>) {
        let url = url.into();
        if url.is_empty() || url == self.url || self.backups.contains(&url) {
            return;
        }
        self.backups.push(url);
    }

    /// Swap the primary URL with the backup at `index`
    pub fn promote_backup(&mut self, index: usize) -> bool {
        if index >= self.backups.len() {
            return false;
        }
        std::mem::swap(&mut self.url, &mut self.backups[index]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_channel_defaults() {
        let ch = Channel::new("  ", "http://a/1.ts");
        assert_eq!(ch.name, DEFAULT_CHANNEL_NAME);
        assert_eq!(ch.group, DEFAULT_GROUP);
        assert_eq!(ch.status, ChannelStatus::Unchecked);
        assert_ne!(ch.uuid, Channel::new("x", "y").uuid);
    }

    #[test]
    fn test_backups_are_unique() {
        let mut ch = Channel::new("News", "http://a/1.ts");
        ch.add_backup("http://a/1.ts");
        ch.add_backup("http://b/1.ts");
        ch.add_backup("http://b/1.ts");
        assert_eq!(ch.backups, vec!["http://b/1.ts".to_string()]);
        assert_eq!(ch.all_urls(), vec!["http://a/1.ts", "http://b/1.ts"]);
    }

    #[test]
    fn test_promote_backup_swaps_urls() {
        let mut ch = Channel::new("News", "http://a/1.ts");
        ch.add_backup("http://b/1.ts");
        assert!(ch.promote_backup(0));
        assert_eq!(ch.url, "http://b/1.ts");
        assert_eq!(ch.backups[0], "http://a/1.ts");
        assert!(!ch.promote_backup(5));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ChannelStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert_eq!("Working".parse::<ChannelStatus>().unwrap(), ChannelStatus::Working);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let ch: Channel = serde_json::from_str(r#"{"name":"A","url":"http://x"}"#).unwrap();
        assert_eq!(ch.group, DEFAULT_GROUP);
        assert!(ch.backups.is_empty());
    }
}
