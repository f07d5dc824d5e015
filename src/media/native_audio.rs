use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
};

use rodio::{Decoder, OutputStream, Sink};

use super::{MediaBackend, MediaStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

enum AudioCommand {
    Play,
    Pause,
    SetMuted(bool),
    Stop,
}

/// Local audio file played in a loop on a dedicated output thread.
///
/// The output stream is not `Send`, so the thread owns it for the whole mount
/// and the handle talks to it over a channel.
pub struct NativeAudio {
    tx: Option<Sender<AudioCommand>>,
    status: Arc<Mutex<MediaStatus>>,
}

impl NativeAudio {
    pub fn open(path: PathBuf, volume: f32) -> Self {
        let status = Arc::new(Mutex::new(MediaStatus::Loading));
        let (tx, rx) = mpsc::channel::<AudioCommand>();
        let thread_status = Arc::clone(&status);
        let volume = volume.clamp(0.0, 1.0);

        let spawned = thread::Builder::new()
            .name("native-audio".to_string())
            .spawn(move || run_output(path, volume, rx, thread_status));

        match spawned {
            Ok(_) => Self {
                tx: Some(tx),
                status,
            },
            Err(err) => {
                log_error!("Failed to spawn audio thread: {}", err);
                set_status(&status, MediaStatus::Unavailable(err.to_string()));
                Self { tx: None, status }
            }
        }
    }

    fn send(&self, command: AudioCommand) {
        if let Some(tx) = &self.tx {
            if tx.send(command).is_err() {
                log_debug!("audio thread already stopped; command dropped");
            }
        }
    }
}

impl MediaBackend for NativeAudio {
    fn play(&mut self) {
        self.send(AudioCommand::Play);
    }

    fn pause(&mut self) {
        self.send(AudioCommand::Pause);
    }

    fn set_muted(&mut self, muted: bool) {
        self.send(AudioCommand::SetMuted(muted));
    }

    fn status(&self) -> MediaStatus {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dispose(&mut self) {
        self.send(AudioCommand::Stop);
        self.tx = None;
    }
}

fn set_status(status: &Mutex<MediaStatus>, value: MediaStatus) {
    let mut guard = match status.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = value;
}

fn run_output(
    path: PathBuf,
    volume: f32,
    rx: Receiver<AudioCommand>,
    status: Arc<Mutex<MediaStatus>>,
) {
    // `_stream` must outlive the sink or playback goes silent.
    let (_stream, sink) = match open_sink(&path, volume) {
        Ok(pair) => pair,
        Err(reason) => {
            log_warn!("Audio unavailable: {}", reason);
            set_status(&status, MediaStatus::Unavailable(reason));
            return;
        }
    };
    set_status(&status, MediaStatus::Ready);

    while let Ok(command) = rx.recv() {
        match command {
            AudioCommand::Play => sink.play(),
            AudioCommand::Pause => sink.pause(),
            AudioCommand::SetMuted(muted) => sink.set_volume(if muted { 0.0 } else { volume }),
            AudioCommand::Stop => {
                sink.stop();
                break;
            }
        }
    }
    log_debug!("audio thread for {} exiting", path.display());
}

fn open_sink(path: &Path, volume: f32) -> Result<(OutputStream, Sink), String> {
    let file = File::open(path).map_err(|e| format!("Cannot open {}: {}", path.display(), e))?;
    let source = Decoder::new_looped(BufReader::new(file))
        .map_err(|e| format!("Cannot decode {}: {}", path.display(), e))?;
    let (stream, handle) = OutputStream::try_default()
        .map_err(|e| format!("Failed to create audio output stream: {}", e))?;
    let sink =
        Sink::try_new(&handle).map_err(|e| format!("Failed to create audio sink: {}", e))?;

    // Mounted paused; the controller pushes play intent.
    sink.pause();
    sink.set_volume(volume);
    sink.append(source);
    Ok((stream, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn missing_file_degrades_to_unavailable() {
        let mut audio = NativeAudio::open(PathBuf::from("/definitely/not/here.mp3"), 0.8);

        let deadline = Instant::now() + Duration::from_secs(5);
        while audio.status() == MediaStatus::Loading && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(audio.status(), MediaStatus::Unavailable(reason) if reason.contains("Cannot open")));

        // the thread is gone; calls must still be harmless
        audio.play();
        audio.set_muted(true);
        audio.dispose();
        audio.pause();
    }
}
