use super::{DriverHandle, MediaBackend, MediaDriverFactory, MediaKind, MediaStatus, MountEpoch};

/// Backend for segments without playable media. Every control call is a no-op.
#[derive(Debug, Clone)]
pub struct Placeholder {
    status: MediaStatus,
}

impl Placeholder {
    pub fn empty() -> Self {
        Self {
            status: MediaStatus::None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            status: MediaStatus::Unavailable(reason.into()),
        }
    }
}

impl MediaBackend for Placeholder {
    fn play(&mut self) {}

    fn pause(&mut self) {}

    fn set_muted(&mut self, _muted: bool) {}

    fn status(&self) -> MediaStatus {
        self.status.clone()
    }

    fn dispose(&mut self) {}
}

/// Mounts placeholders only; used when media output is switched off.
#[derive(Debug, Default)]
pub struct PlaceholderFactory {
    epoch: MountEpoch,
}

impl PlaceholderFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaDriverFactory for PlaceholderFactory {
    fn mount(&self, segment_id: &str, media_url: &str) -> DriverHandle {
        let kind = MediaKind::detect(media_url);
        let backend = match kind {
            MediaKind::None => Placeholder::empty(),
            _ => Placeholder::unavailable("Media output disabled"),
        };
        DriverHandle::new(
            segment_id,
            media_url,
            kind,
            self.epoch.begin(),
            Box::new(backend),
        )
    }
}
