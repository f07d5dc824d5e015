//! Media drivers: one control surface over every playback backend a segment can use.
//!
//! The controller mounts exactly one [`DriverHandle`] per segment and pushes
//! transport intent into it. Backends never report back into the controller;
//! their [`MediaStatus`] is only read for display.

pub mod external;
#[cfg(feature = "native-audio")]
pub mod native_audio;
pub mod placeholder;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};

use crate::settings::MediaSettings;

use external::{ExternalPlayer, PlayerSource};
use placeholder::Placeholder;

// Set to true to log every mount and teardown
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

const EMBED_HOST_MARKERS: [&str; 2] = ["youtube.com", "youtu.be"];
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "webm", "mov", "m4v"];
const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "wav", "ogg", "flac"];
const EMBED_VIDEO_ID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    /// Third-party video-sharing player.
    Embedded,
    Video,
    Audio,
    None,
}

impl MediaKind {
    pub fn detect(media_url: &str) -> Self {
        let url = media_url.trim();
        if url.is_empty() {
            return MediaKind::None;
        }
        if EMBED_HOST_MARKERS.iter().any(|marker| url.contains(marker)) {
            return MediaKind::Embedded;
        }
        match extension_of(url) {
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => MediaKind::Video,
            Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => MediaKind::Audio,
            _ => MediaKind::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Embedded => "embedded",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::None => "none",
        }
    }
}

/// Lower-cased extension of the URL path, ignoring `?query` and `#fragment`.
fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let (_, ext) = path.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Extracts the 11-character video id from a video-sharing URL.
///
/// The id follows the right-most of `youtu.be/`, `v/`, `u/<c>/`, `embed/`,
/// `watch?v=` or `&v=` and runs up to the next `#`, `&` or `?`.
pub fn embedded_video_id(url: &str) -> Option<String> {
    const MARKERS: [&str; 5] = ["youtu.be/", "v/", "embed/", "watch?v=", "&v="];

    let bytes = url.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut consider = |start: usize, len: usize| {
        if best.map_or(true, |(best_start, _)| start > best_start) {
            best = Some((start, len));
        }
    };

    for marker in MARKERS {
        if let Some(start) = url.rfind(marker) {
            consider(start, marker.len());
        }
    }
    // `u/<word char>/`
    for (start, _) in url.match_indices("u/") {
        let word = bytes.get(start + 2).copied();
        let slash = bytes.get(start + 3).copied();
        if matches!(word, Some(c) if c.is_ascii_alphanumeric() || c == b'_') && slash == Some(b'/') {
            consider(start, 4);
        }
    }

    let (start, len) = best?;
    let rest = &url[start + len..];
    let id: String = rest
        .chars()
        .take_while(|c| !matches!(c, '#' | '&' | '?'))
        .collect();
    (id.chars().count() == EMBED_VIDEO_ID_LEN).then_some(id)
}

/// What the presentation layer shows in the media area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum MediaStatus {
    /// The segment has no media.
    None,
    Loading,
    Ready,
    Unavailable(String),
}

/// A concrete playback backend. Every call is fire-and-forget: failures are
/// logged by the backend and folded into [`MediaBackend::status`].
pub trait MediaBackend: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn set_muted(&mut self, muted: bool);
    fn status(&self) -> MediaStatus;
    fn dispose(&mut self);
}

/// Process-wide mount counter. Bumped on every mount and every teardown so that
/// an asynchronous callback can tell whether its mount is still the live one.
#[derive(Debug, Clone, Default)]
pub struct MountEpoch(Arc<AtomicU64>);

impl MountEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Generation {
        let value = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            epoch: self.clone(),
            value,
        }
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// The epoch value captured by one mount.
#[derive(Debug, Clone)]
pub struct Generation {
    epoch: MountEpoch,
    value: u64,
}

impl Generation {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_live(&self) -> bool {
        self.epoch.current() == self.value
    }

    /// Ends this mount. A no-op if a newer mount already superseded it.
    pub fn retire(&self) {
        let _ = self.epoch.0.compare_exchange(
            self.value,
            self.value + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// The mounted driver for one segment.
pub struct DriverHandle {
    segment_id: String,
    media_url: String,
    kind: MediaKind,
    generation: Generation,
    backend: Box<dyn MediaBackend>,
    disposed: bool,
}

impl DriverHandle {
    pub fn new(
        segment_id: &str,
        media_url: &str,
        kind: MediaKind,
        generation: Generation,
        backend: Box<dyn MediaBackend>,
    ) -> Self {
        Self {
            segment_id: segment_id.to_string(),
            media_url: media_url.to_string(),
            kind,
            generation,
            backend,
            disposed: false,
        }
    }

    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation.value()
    }

    pub fn is_bound_to(&self, segment_id: &str, media_url: &str) -> bool {
        !self.disposed && self.segment_id == segment_id && self.media_url == media_url
    }

    pub fn play(&mut self) {
        if !self.disposed {
            self.backend.play();
        }
    }

    pub fn pause(&mut self) {
        if !self.disposed {
            self.backend.pause();
        }
    }

    pub fn mute(&mut self) {
        if !self.disposed {
            self.backend.set_muted(true);
        }
    }

    pub fn unmute(&mut self) {
        if !self.disposed {
            self.backend.set_muted(false);
        }
    }

    pub fn status(&self) -> MediaStatus {
        if self.disposed {
            MediaStatus::None
        } else {
            self.backend.status()
        }
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.generation.retire();
        self.backend.dispose();
        log_debug!(
            "disposed {} driver for segment {} (generation {})",
            self.kind.as_str(),
            self.segment_id,
            self.generation.value()
        );
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Builds drivers. Mounting never fails: a backend that cannot start mounts in
/// its unavailable state instead.
pub trait MediaDriverFactory: Send + Sync {
    fn mount(&self, segment_id: &str, media_url: &str) -> DriverHandle;
}

/// Factory for a desktop session: local audio through the output device,
/// video and embedded players through the external player process.
pub struct DesktopDriverFactory {
    epoch: MountEpoch,
    settings: MediaSettings,
}

impl DesktopDriverFactory {
    pub fn new(settings: MediaSettings) -> Self {
        Self {
            epoch: MountEpoch::new(),
            settings,
        }
    }

    fn backend_for(
        &self,
        kind: MediaKind,
        media_url: &str,
        generation: &Generation,
    ) -> Box<dyn MediaBackend> {
        match kind {
            MediaKind::None => Box::new(Placeholder::empty()),
            MediaKind::Embedded => match embedded_video_id(media_url) {
                Some(video_id) => Box::new(ExternalPlayer::launch(
                    PlayerSource::Embedded { video_id },
                    generation.clone(),
                    &self.settings,
                )),
                None => Box::new(Placeholder::unavailable("Invalid video URL")),
            },
            MediaKind::Video => Box::new(ExternalPlayer::launch(
                PlayerSource::Video(media_url.to_string()),
                generation.clone(),
                &self.settings,
            )),
            MediaKind::Audio if is_remote(media_url) => Box::new(ExternalPlayer::launch(
                PlayerSource::Audio(media_url.to_string()),
                generation.clone(),
                &self.settings,
            )),
            MediaKind::Audio => self.local_audio(media_url),
        }
    }

    #[cfg(feature = "native-audio")]
    fn local_audio(&self, media_url: &str) -> Box<dyn MediaBackend> {
        Box::new(native_audio::NativeAudio::open(
            local_path(media_url),
            self.settings.volume,
        ))
    }

    #[cfg(not(feature = "native-audio"))]
    fn local_audio(&self, _media_url: &str) -> Box<dyn MediaBackend> {
        Box::new(Placeholder::unavailable("Built without native audio output"))
    }
}

impl MediaDriverFactory for DesktopDriverFactory {
    fn mount(&self, segment_id: &str, media_url: &str) -> DriverHandle {
        let generation = self.epoch.begin();
        let kind = MediaKind::detect(media_url);
        let backend = self.backend_for(kind, media_url.trim(), &generation);
        log_info!(
            "mounted {} driver for segment {} (generation {})",
            kind.as_str(),
            segment_id,
            generation.value()
        );
        DriverHandle::new(segment_id, media_url, kind, generation, backend)
    }
}

fn is_remote(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(feature = "native-audio")]
fn local_path(url: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}
