use serde::{Deserialize, Serialize};

/// The agreed playback timeline. Overwritten wholesale, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackRecord {
    pub is_playing: bool,
    /// Seconds into the media.
    pub last_known_time: f64,
    /// Epoch milliseconds at which `last_known_time` was observed.
    pub last_update_timestamp: i64,
    pub playback_rate: f64,
}

impl Default for PlaybackRecord {
    fn default() -> Self {
        Self {
            is_playing: false,
            last_known_time: 0.0,
            last_update_timestamp: 0,
            playback_rate: 1.0,
        }
    }
}

impl PlaybackRecord {
    pub fn playing_from(time: f64, now_ms: i64) -> Self {
        Self {
            is_playing: true,
            last_known_time: time,
            last_update_timestamp: now_ms,
            playback_rate: 1.0,
        }
    }

    pub fn paused_at(time: f64, now_ms: i64) -> Self {
        Self {
            is_playing: false,
            last_known_time: time,
            last_update_timestamp: now_ms,
            playback_rate: 1.0,
        }
    }

    /// Where playback should be at `now_ms`.
    ///
    /// A paused record does not advance. Timestamps from the future (clock
    /// skew between members) are treated as zero elapsed time.
    pub fn projected_time(&self, now_ms: i64) -> f64 {
        if !self.is_playing {
            return self.last_known_time;
        }
        let elapsed = (now_ms - self.last_update_timestamp).max(0) as f64 / 1000.0;
        self.last_known_time + elapsed * self.playback_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    #[serde(alias = "tv")]
    Series,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSelection {
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
}

impl MediaSelection {
    pub fn movie() -> Self {
        Self {
            media_type: MediaType::Movie,
            season: None,
            episode: None,
        }
    }

    pub fn episode(season: u32, episode: u32) -> Self {
        Self {
            media_type: MediaType::Series,
            season: Some(season),
            episode: Some(episode),
        }
    }

    pub fn label(&self) -> String {
        match (self.media_type, self.season, self.episode) {
            (MediaType::Series, Some(s), Some(e)) => format!("S{s}E{e}"),
            (MediaType::Series, Some(s), None) => format!("season {s}"),
            (MediaType::Series, None, _) => "series".to_string(),
            (MediaType::Movie, _, _) => "movie".to_string(),
        }
    }
}
