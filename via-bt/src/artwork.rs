//! Album art enrichment via the iTunes Search API
//!
//! When the phone exposes no embedded art, the media reconciler dispatches
//! one lookup per track change, keyed by (title, artist). The lookup runs on
//! its own task so a slow network call never stalls the reconciliation loop;
//! the result travels back through a bounded channel drained by that loop.
//! There is no retry: the next track change is the natural retry trigger.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const SEARCH_URL: &str = "https://itunes.apple.com/search";
const USER_AGENT: &str = "via/0.1.0";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(8);
const RESULT_LIMIT: &str = "5";

/// A resolved artwork URL, tagged with the track it was requested for so the
/// reconciler can discard late deliveries after a track change.
#[derive(Debug, Clone)]
pub struct ArtDelivery {
    pub title: String,
    pub artist: String,
    pub url: String,
}

/// Dispatch seam between the reconciler and the network lookup
pub trait ArtLookup {
    /// Kick off one asynchronous lookup; the result (if any) arrives on
    /// `reply`. Must not block the caller.
    fn dispatch(&self, title: String, artist: String, reply: mpsc::Sender<ArtDelivery>);
}

/// iTunes Search API response (only the field we need)
#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "artworkUrl100")]
    artwork_url_100: Option<String>,
}

/// One-shot song search against the public iTunes endpoint
#[derive(Debug, Clone, Default)]
pub struct ItunesArtLookup;

impl ItunesArtLookup {
    pub fn new() -> Self {
        Self
    }
}

impl ArtLookup for ItunesArtLookup {
    fn dispatch(&self, title: String, artist: String, reply: mpsc::Sender<ArtDelivery>) {
        tokio::spawn(async move {
            match search_artwork(&title, &artist).await {
                Ok(url) => {
                    debug!(%title, %artist, "Artwork found");
                    // Late art is disposable; drop it if the channel is full
                    let _ = reply.try_send(ArtDelivery { title, artist, url });
                }
                Err(e) => warn!(%title, %artist, "Artwork lookup failed: {}", e),
            }
        });
    }
}

/// Free-text song search; returns the first result's artwork URL upgraded to
/// the 600x600 variant.
async fn search_artwork(title: &str, artist: &str) -> Result<String> {
    // Each lookup is a single attempt on its own task; a fresh client keeps
    // the 8 s budget scoped to exactly this request.
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(LOOKUP_TIMEOUT)
        .build()
        .map_err(|e| Error::Enrichment(e.to_string()))?;

    let term = format!("{} {}", artist, title);
    let response = client
        .get(SEARCH_URL)
        .query(&[
            ("term", term.as_str()),
            ("media", "music"),
            ("entity", "song"),
            ("limit", RESULT_LIMIT),
        ])
        .send()
        .await
        .map_err(|e| Error::Enrichment(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Enrichment(format!("HTTP {}", status.as_u16())));
    }

    let parsed: SearchResponse = response
        .json()
        .await
        .map_err(|e| Error::Enrichment(e.to_string()))?;

    parsed
        .results
        .into_iter()
        .find_map(|r| r.artwork_url_100)
        .map(|url| upgrade_artwork_url(&url))
        .ok_or_else(|| Error::Enrichment("no artwork in results".to_owned()))
}

/// iTunes thumbnails follow a `...100x100bb.jpg` naming convention; the
/// 600x600 variant exists at the same path.
fn upgrade_artwork_url(url: &str) -> String {
    url.replace("100x100", "600x600")
}
