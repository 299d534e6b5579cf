#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use chrono::{DateTime, Local};

use crate::domain::clean_domain;

/// A named group of domains. Builtin lists ship as read-only presets.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockList {
    pub id: String,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sites: Vec<String>,
    pub created_at: DateTime<Local>,
    pub modified_at: DateTime<Local>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub builtin: bool,
}

impl BlockList {
    pub fn new(name: &str, sites: &[String], now: DateTime<Local>) -> Self {
        let mut list = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            sites: Vec::new(),
            created_at: now,
            modified_at: now,
            builtin: false,
        };
        list.set_sites(sites, now);
        list
    }

    /// Replace the sites with their cleaned, deduplicated form.
    pub fn set_sites(&mut self, sites: &[String], now: DateTime<Local>) {
        let mut cleaned: Vec<String> = Vec::with_capacity(sites.len());
        for site in sites {
            let d = clean_domain(site);
            if !d.is_empty() && !cleaned.contains(&d) {
                cleaned.push(d);
            }
        }
        self.sites = cleaned;
        self.modified_at = now;
    }

    /// Preset categories seeded into new policies. Ids are stable so that
    /// re-seeding never duplicates them.
    pub fn builtin_presets(now: DateTime<Local>) -> Vec<BlockList> {
        const PRESETS: &[(&str, &str, &[&str])] = &[
            (
                "builtin-social",
                "Social media",
                &[
                    "facebook.com",
                    "instagram.com",
                    "tiktok.com",
                    "twitter.com",
                    "x.com",
                    "reddit.com",
                    "snapchat.com",
                ],
            ),
            (
                "builtin-video",
                "Video streaming",
                &["youtube.com", "netflix.com", "twitch.tv", "vimeo.com"],
            ),
            (
                "builtin-news",
                "News",
                &["news.google.com", "cnn.com", "bbc.com", "nytimes.com"],
            ),
        ];

        PRESETS
            .iter()
            .map(|(id, name, sites)| BlockList {
                id: id.to_string(),
                name: name.to_string(),
                sites: sites.iter().map(|s| s.to_string()).collect(),
                created_at: now,
                modified_at: now,
                builtin: true,
            })
            .collect()
    }
}
