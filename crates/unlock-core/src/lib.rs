//! Core domain model for the offer-gated unlock flow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "unlock-core";

/// Number of offers requested per fetch (sent as both `min` and `max`).
pub const DEFAULT_MAX_OFFERS: usize = 4;

/// Fixed countdown between offer selection and reveal.
pub const COUNTDOWN_DURATION_MS: u64 = 60_000;

/// Period of the recurring countdown tick.
pub const TICK_PERIOD_MS: u64 = 100;

/// Resource URL used when the selected item has no catalog entry.
pub const FALLBACK_RESOURCE_URL: &str = "https://premiumscripts.vercel.app/";

/// Key under which the pending-offer breadcrumb is written.
pub const PENDING_OFFER_KEY: &str = "pendingOffer";

/// Reward label shown on every offer; never sourced from upstream.
pub const OFFER_REWARD_LABEL: &str = "Premium Scripts Access";

pub const COMPLETED_STATUS: &str = "completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    #[serde(rename = "VERY EASY")]
    VeryEasy,
    #[serde(rename = "EASY")]
    Easy,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HARD")]
    Hard,
}

impl Difficulty {
    /// Position-based rotation applied to every fetched batch. `Hard` is never assigned.
    pub const ROTATION: [Difficulty; 4] = [
        Difficulty::VeryEasy,
        Difficulty::Easy,
        Difficulty::Medium,
        Difficulty::Medium,
    ];

    pub fn for_position(position: usize) -> Self {
        Self::ROTATION[position % Self::ROTATION.len()]
    }

    pub fn label(self) -> &'static str {
        match self {
            Difficulty::VeryEasy => "VERY EASY",
            Difficulty::Easy => "EASY",
            Difficulty::Medium => "MEDIUM",
            Difficulty::Hard => "HARD",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One incentive task in its normalized shape. Every field is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub reward: String,
    pub url: String,
    pub icon: String,
    pub category: String,
}

impl Offer {
    /// `#` is the placeholder for offers the provider sent without a link.
    pub fn is_navigable(&self) -> bool {
        self.url != "#"
    }
}

/// Result of a single provider call. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferBatch {
    pub success: bool,
    pub offers: Vec<Offer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OfferBatch {
    pub fn success(offers: Vec<Offer>) -> Self {
        Self {
            success: true,
            offers,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            offers: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// Best-effort breadcrumb written when an offer is opened. Never read back by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOfferRecord {
    pub offer_id: String,
    pub game_name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl PendingOfferRecord {
    pub fn new(offer_id: impl Into<String>, game_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            offer_id: offer_id.into(),
            game_name: game_name.into(),
            timestamp: at.timestamp_millis(),
        }
    }
}

/// Body accepted by the completion-acknowledgement endpoint. Missing or non-string fields read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionNotice {
    #[serde(deserialize_with = "lenient_text")]
    pub offer_id: String,
    #[serde(deserialize_with = "lenient_text")]
    pub user_ip: String,
    #[serde(deserialize_with = "lenient_text")]
    pub user_agent: String,
    #[serde(deserialize_with = "lenient_text")]
    pub status: String,
    #[serde(deserialize_with = "lenient_text")]
    pub game_name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseText {
    Text(String),
    Other(serde::de::IgnoredAny),
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match LooseText::deserialize(deserializer)? {
        LooseText::Text(text) => text,
        LooseText::Other(_) => String::new(),
    })
}

impl CompletionNotice {
    pub fn is_completed(&self) -> bool {
        self.status == COMPLETED_STATUS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAck {
    pub success: bool,
    pub message: String,
}

/// Combined state of one unlock session as seen from outside the controller.
///
/// The offer list and the countdown are independent sub-states; once a
/// countdown exists it dominates the reported state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    LoadingOffers,
    OffersShown,
    Error,
    CountdownRunning,
    Unlocked,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::LoadingOffers => "loading-offers",
            SessionState::OffersShown => "offers-shown",
            SessionState::Error => "error",
            SessionState::CountdownRunning => "countdown-running",
            SessionState::Unlocked => "unlocked",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptCategory {
    #[serde(rename = "FPS")]
    Fps,
    #[serde(rename = "RPG")]
    Rpg,
    Simulator,
    Adventure,
    Obby,
    Horror,
    Other,
}

/// Static metadata for one downloadable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: ScriptCategory,
    #[serde(default)]
    pub features: Vec<String>,
    pub logo_url: String,
    pub script_url: String,
    #[serde(default)]
    pub trending: bool,
    #[serde(default)]
    pub new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogFilter {
    #[default]
    All,
    Trending,
    New,
}

impl CatalogFilter {
    pub fn matches(self, entry: &CatalogEntry) -> bool {
        match self {
            CatalogFilter::All => true,
            CatalogFilter::Trending => entry.trending,
            CatalogFilter::New => entry.new,
        }
    }
}

impl FromStr for CatalogFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(CatalogFilter::All),
            "trending" => Ok(CatalogFilter::Trending),
            "new" => Ok(CatalogFilter::New),
            other => Err(format!("unknown catalog filter `{other}` (expected all, trending or new)")),
        }
    }
}

/// Read-only item → resource mapping handed to the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    fallback_url: String,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>, fallback_url: impl Into<String>) -> Self {
        Self {
            entries,
            fallback_url: fallback_url.into(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_entries(), FALLBACK_RESOURCE_URL)
    }

    pub fn with_fallback_url(mut self, fallback_url: impl Into<String>) -> Self {
        self.fallback_url = fallback_url.into();
        self
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn fallback_url(&self) -> &str {
        &self.fallback_url
    }

    /// Exact match on either the entry id or its display name.
    pub fn find(&self, item: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|entry| entry.id == item || entry.name == item)
    }

    pub fn resolve(&self, item: &str) -> String {
        self.find(item)
            .map(|entry| entry.script_url.clone())
            .unwrap_or_else(|| self.fallback_url.clone())
    }

    pub fn filtered(&self, filter: CatalogFilter) -> Vec<&CatalogEntry> {
        self.entries.iter().filter(|e| filter.matches(e)).collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn entry(
    id: &str,
    name: &str,
    category: ScriptCategory,
    features: &[&str],
    logo_url: &str,
    script_url: &str,
) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        category,
        features: features.iter().map(|f| f.to_string()).collect(),
        logo_url: logo_url.to_string(),
        script_url: script_url.to_string(),
        trending: false,
        new: false,
    }
}

fn builtin_entries() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            trending: true,
            new: true,
            ..entry(
                "99-nights-forest",
                "99 Nights in the Forest",
                ScriptCategory::Horror,
                &["Diamonds Finder", "Godmode", "Kill-Aura", "Auto Rescue Child", "FLY"],
                "/99-nights-logo.png",
                "https://99nightsscripts.vercel.app/",
            )
        },
        CatalogEntry {
            trending: true,
            ..entry(
                "plants-vs-brainrots",
                "Plants Vs Brainrots",
                ScriptCategory::Other,
                &["Item Dupe", "Auto Farm & Auto Buy", "Auto-Attack", "Kill-Aura", "No Cooldown"],
                "https://tr.rbxcdn.com/180DAY-549f1500c07a8bbd19537056d34b605e/150/150/Image/Webp/noFilter",
                "https://plantsvsbrainrotsscripts.vercel.app/",
            )
        },
        CatalogEntry {
            new: true,
            ..entry(
                "grow-garden",
                "Grow a Garden",
                ScriptCategory::Simulator,
                &["Spawn Pets & Seeds", "Steal People Fruits", "Dupe Fruits", "Instant Grow", "Teleport"],
                "https://tr.rbxcdn.com/180DAY-900822048ca4e4fdda877229576ffc04/150/150/Image/Webp/noFilter",
                "https://premiumscripts.vercel.app/",
            )
        },
        entry(
            "steal-brainrot",
            "Steal a Brainrot",
            ScriptCategory::Adventure,
            &["Auto Steal", "Item ESP", "Speed Hack", "TELEPORT", "FLY"],
            "https://tr.rbxcdn.com/180DAY-706a6a11a02ea7f005b60e0a7cfe9fd5/150/150/Image/Webp/noFilter",
            "https://stealbrainrotscripts.vercel.app/",
        ),
    ]
}
