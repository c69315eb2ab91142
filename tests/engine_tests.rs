// Integration tests for the capture engine
//
// Time is paused so the synthetic microphone's real-time pacing and the
// power-saving backoff can be checked to the millisecond without waiting.

use anyhow::Result;
use loqa_recorder::audio::adts::scan_file;
use loqa_recorder::audio::{Segment, SyntheticProvider};
use loqa_recorder::engine::{
    CaptureSettings, Engine, ExclusiveFocus, ExitReason, PauseReason, ProcessWakeToken,
    SessionState, SilenceStrategy,
};
use loqa_recorder::events::NullSink;
use loqa_recorder::{CaptureError, SessionStore, StartError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

const VOICE: i16 = 3000;

struct Harness {
    _temp_dir: TempDir,
    root: PathBuf,
    provider: Arc<SyntheticProvider>,
    store: Arc<SessionStore>,
    engine: Engine,
}

impl Harness {
    fn new(provider: SyntheticProvider) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();
        let provider = Arc::new(provider);
        let store = Arc::new(SessionStore::open(&root)?);
        let engine = Engine::new(provider.clone(), store.clone(), Arc::new(NullSink));
        Ok(Self {
            _temp_dir: temp_dir,
            root,
            provider,
            store,
            engine,
        })
    }

    fn chunk(&self, name: &str) -> PathBuf {
        self.root.join(format!("capture_{}.aac.tmp", name))
    }
}

fn aggressive() -> CaptureSettings {
    CaptureSettings {
        silence_strategy: SilenceStrategy::Aggressive,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_session() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    let path = h.chunk("basic");

    h.engine.start(&path, "user", &CaptureSettings::default()).await?;
    assert!(h.engine.is_active());
    assert!(h.store.lock().is_locked());
    assert_eq!(h.engine.current_path().await, Some(path.clone()));

    sleep(Duration::from_secs(3)).await;
    let status = h.engine.status();
    assert_eq!(status.state, SessionState::Capturing);
    assert!(status.recording);
    assert!(status.current_bytes > 0);
    assert!(h.store.snapshot().read().recording);

    let outcome = h.engine.stop_and_wait().await.expect("session outcome");
    assert_eq!(outcome.exit, ExitReason::Stopped);
    assert_eq!(outcome.path, path);
    assert_eq!(outcome.reason, "user");
    assert_eq!(outcome.sample_rate, 16000);
    assert_eq!(std::fs::metadata(&path)?.len(), outcome.bytes);
    assert!(outcome.duration >= Duration::from_millis(2900));
    assert!(outcome.duration <= Duration::from_millis(3200));

    // Every resource is released and the lock is gone
    assert!(!h.engine.is_active());
    assert_eq!(h.provider.live_devices(), 0);
    assert!(!h.store.lock().is_locked());
    let status = h.engine.status();
    assert_eq!(status.state, SessionState::Idle);
    assert!(!status.recording);
    assert!(!h.store.snapshot().read().recording);

    // Nothing left to stop
    assert!(h.engine.stop_and_wait().await.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_configured_rate_opens_first() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    let settings = CaptureSettings {
        sample_rate: 44100,
        ..Default::default()
    };

    h.engine.start(h.chunk("rate"), "user", &settings).await?;
    let opens = h.provider.opens();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].sample_rate, 44100);
    assert_eq!(h.engine.status().sample_rate, 44100);

    let outcome = h.engine.stop_and_wait().await.expect("session outcome");
    assert_eq!(outcome.sample_rate, 44100);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_second_start_rejected() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    h.engine.start(h.chunk("one"), "user", &CaptureSettings::default()).await?;

    let second = h.engine.start(h.chunk("two"), "user", &CaptureSettings::default()).await;
    assert!(matches!(second, Err(StartError::AlreadyActive)));
    assert!(!h.chunk("two").exists());
    assert_eq!(h.provider.successful_opens(), 1);

    h.engine.stop_and_wait().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_blocks_start() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    h.provider.set_permission(false);

    let result = h.engine.start(h.chunk("denied"), "user", &CaptureSettings::default()).await;
    assert!(matches!(result, Err(StartError::PermissionDenied)));
    assert!(!h.engine.is_active());
    assert!(h.provider.opens().is_empty());
    assert!(!h.store.lock().is_locked());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_permission_revoked_during_open_is_reported_as_denial() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    h.provider.deny_next_opens(1);

    let result = h.engine.start(h.chunk("revoked"), "user", &CaptureSettings::default()).await;
    assert!(matches!(result, Err(StartError::PermissionDenied)));
    assert_eq!(h.engine.status().state, SessionState::Error);
    // Denial is fatal: no retry, no device left open
    assert_eq!(h.provider.opens().len(), 1);
    assert_eq!(h.provider.live_devices(), 0);
    assert!(!h.chunk("revoked").exists());
    assert!(!h.store.lock().is_locked());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unwritable_lock_is_surfaced() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    // A non-empty directory where the lock file belongs defeats the rename
    let lock_path = h.store.lock().path().to_path_buf();
    std::fs::create_dir_all(lock_path.join("blocker"))?;

    h.engine.start(h.chunk("unlocked"), "user", &CaptureSettings::default()).await?;

    let status = h.engine.status();
    assert_eq!(status.state, SessionState::Capturing);
    let error = status.last_error.expect("lock failure reported");
    assert!(error.contains("session lock"), "unexpected error {}", error);

    h.engine.stop_and_wait().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wake_token_and_focus_gate_start() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(SessionStore::open(temp_dir.path())?);
    let provider = Arc::new(SyntheticProvider::constant(VOICE));
    let wake = Arc::new(ProcessWakeToken::new());
    let focus = Arc::new(ExclusiveFocus::new());
    let engine = Engine::new(provider.clone(), store, Arc::new(NullSink))
        .with_wake_token(wake.clone())
        .with_focus(focus.clone());
    let path = temp_dir.path().join("capture_gate.aac.tmp");

    wake.set_unavailable(true);
    let result = engine.start(&path, "user", &CaptureSettings::default()).await;
    assert!(matches!(result, Err(StartError::WakeTokenUnavailable)));
    wake.set_unavailable(false);

    focus.set_denied(true);
    let result = engine.start(&path, "user", &CaptureSettings::default()).await;
    assert!(matches!(result, Err(StartError::FocusDenied)));
    assert!(!wake.is_held(), "wake token released after focus denial");
    focus.set_denied(false);

    assert!(provider.opens().is_empty());

    engine.start(&path, "user", &CaptureSettings::default()).await?;
    assert!(wake.is_held());
    assert!(focus.is_held());

    engine.stop_and_wait().await;
    assert!(!wake.is_held());
    assert!(!focus.is_held());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_microphone_reports_error() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(SessionStore::open(temp_dir.path())?);
    let provider = Arc::new(SyntheticProvider::constant(VOICE));
    let wake = Arc::new(ProcessWakeToken::new());
    let engine =
        Engine::new(provider.clone(), store.clone(), Arc::new(NullSink)).with_wake_token(wake.clone());
    provider.set_gone(true);

    let path = temp_dir.path().join("capture_gone.aac.tmp");
    let result = engine.start(&path, "user", &CaptureSettings::default()).await;
    match result {
        Err(StartError::MicrophoneAccessFailed(CaptureError::Gone(_))) => {}
        other => panic!("unexpected start result: {:?}", other),
    }

    let status = engine.status();
    assert_eq!(status.state, SessionState::Error);
    assert!(status.last_error.unwrap_or_default().contains("gone"));
    assert!(!wake.is_held());
    assert!(!engine.is_active());
    assert!(!store.lock().is_locked());
    assert!(!path.exists());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_aggressive_backoff_doubles_to_cap() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(0))?;
    h.engine.start(h.chunk("backoff"), "user", &aggressive()).await?;

    sleep(Duration::from_secs(110)).await;

    let opens: Vec<_> = h.provider.opens().into_iter().filter(|o| o.succeeded).collect();
    assert_eq!(opens.len(), 8, "unexpected opens: {:?}", opens);

    // 12 s of silence, then the first 1 s power-down
    let first = opens[1].at - opens[0].at;
    assert!(first >= Duration::from_secs(13) && first < Duration::from_millis(13500));

    // Each later gap is the backoff delay plus one probe and one frame
    let expected = [2u64, 4, 8, 16, 30, 30];
    for (i, secs) in expected.iter().enumerate() {
        let gap = opens[i + 2].at - opens[i + 1].at;
        let target = Duration::from_secs(*secs) + Duration::from_millis(110);
        let diff = if gap > target { gap - target } else { target - gap };
        assert!(
            diff < Duration::from_millis(500),
            "gap {} was {:?}, expected about {:?}",
            i,
            gap,
            target
        );
    }

    let status = h.engine.status();
    assert_eq!(status.state, SessionState::SilenceBackoff);
    assert_eq!(status.backoff_ms, 30_000);
    assert_eq!(h.provider.live_devices(), 0);

    let outcome = h.engine.stop_and_wait().await.expect("session outcome");
    assert_eq!(outcome.exit, ExitReason::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_voice_resets_backoff() -> Result<()> {
    let provider = SyntheticProvider::new(vec![
        Segment::silence(Duration::from_secs(14)),
        Segment::voice(Duration::from_secs(2), VOICE),
    ]);
    let h = Harness::new(provider)?;
    h.engine.start(h.chunk("reset"), "user", &aggressive()).await?;

    // Backed off twice (1 s, 2 s), heard voice, then 12 s of silence again
    sleep(Duration::from_millis(28_600)).await;

    let status = h.engine.status();
    assert_eq!(status.state, SessionState::SilenceBackoff);
    assert_eq!(status.backoff_ms, 1000);

    h.engine.stop_and_wait().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_force_wakeup_cuts_backoff_short() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(0))?;
    h.engine.start(h.chunk("wakeup"), "user", &aggressive()).await?;

    // Inside the 16 s backoff window
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.engine.status().state, SessionState::SilenceBackoff);
    let before = h.provider.successful_opens();

    assert!(h.engine.force_wakeup());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.provider.successful_opens(), before + 1);

    h.engine.stop_and_wait().await;
    assert!(!h.engine.force_wakeup(), "no session, nothing to wake");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_standard_strategy_keeps_device_and_skips_silence() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(0))?;
    h.engine.start(h.chunk("standard"), "user", &CaptureSettings::default()).await?;

    sleep(Duration::from_secs(5)).await;
    let bytes_at_5s = h.engine.status().current_bytes;
    sleep(Duration::from_secs(20)).await;

    let status = h.engine.status();
    assert_eq!(status.state, SessionState::Capturing);
    assert_eq!(status.current_bytes, bytes_at_5s);
    assert_eq!(h.provider.live_devices(), 1);
    assert_eq!(h.provider.successful_opens(), 1);

    h.engine.stop_and_wait().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_preroll_precedes_speech() -> Result<()> {
    let provider = SyntheticProvider::new(vec![
        Segment::silence(Duration::from_secs(5)),
        Segment::voice(Duration::from_secs(2), VOICE),
    ]);
    let h = Harness::new(provider)?;
    h.engine.start(h.chunk("preroll"), "user", &CaptureSettings::default()).await?;

    sleep(Duration::from_secs(12)).await;
    let outcome = h.engine.stop_and_wait().await.expect("session outcome");

    // 1 s hold, 0.8 s pre-roll, 2 s voice, 1 s hold: about 4.8 s of audio,
    // plus the encoder's lookahead flushed as silence
    let audio = scan_file(&outcome.path)?.duration();
    assert!(
        audio > Duration::from_millis(4300) && audio < Duration::from_millis(5800),
        "unexpected audio length {:?}",
        audio
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pause_releases_device_and_stops_clock() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    h.engine.start(h.chunk("pause"), "user", &CaptureSettings::default()).await?;

    sleep(Duration::from_secs(2)).await;
    assert!(h.engine.pause());
    assert!(!h.engine.pause(), "already paused");

    sleep(Duration::from_millis(500)).await;
    let status = h.engine.status();
    assert_eq!(status.state, SessionState::Paused);
    assert_eq!(status.pause_reason, Some(PauseReason::User));
    assert!(h.store.snapshot().read().paused);
    assert_eq!(h.provider.live_devices(), 0);

    sleep(Duration::from_secs(5)).await;
    assert!(h.engine.resume());
    assert!(!h.engine.resume(), "already resumed");

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.engine.status().state, SessionState::Capturing);
    assert_eq!(h.provider.live_devices(), 1);

    let outcome = h.engine.stop_and_wait().await.expect("session outcome");
    assert!(outcome.duration >= Duration::from_millis(3800));
    assert!(outcome.duration <= Duration::from_millis(4500));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_focus_loss_pauses_and_restore_resumes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(SessionStore::open(temp_dir.path())?);
    let provider = Arc::new(SyntheticProvider::constant(VOICE));
    let focus = Arc::new(ExclusiveFocus::new());
    let engine =
        Engine::new(provider.clone(), store, Arc::new(NullSink)).with_focus(focus.clone());

    let path = temp_dir.path().join("capture_focus.aac.tmp");
    engine.start(&path, "user", &CaptureSettings::default()).await?;
    sleep(Duration::from_secs(1)).await;

    focus.interrupt();
    sleep(Duration::from_millis(300)).await;
    let status = engine.status();
    assert_eq!(status.state, SessionState::Paused);
    assert_eq!(status.pause_reason, Some(PauseReason::Focus));
    assert_eq!(provider.live_devices(), 0);

    focus.restore();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.status().state, SessionState::Capturing);
    assert_eq!(provider.live_devices(), 1);

    engine.stop_and_wait().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_user_pause_survives_focus_restore() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(SessionStore::open(temp_dir.path())?);
    let provider = Arc::new(SyntheticProvider::constant(VOICE));
    let focus = Arc::new(ExclusiveFocus::new());
    let engine = Engine::new(provider, store, Arc::new(NullSink)).with_focus(focus.clone());

    let path = temp_dir.path().join("capture_user.aac.tmp");
    engine.start(&path, "user", &CaptureSettings::default()).await?;
    sleep(Duration::from_secs(1)).await;

    assert!(engine.pause());
    focus.interrupt();
    focus.restore();
    sleep(Duration::from_millis(500)).await;

    let status = engine.status();
    assert_eq!(status.state, SessionState::Paused);
    assert_eq!(status.pause_reason, Some(PauseReason::User));

    engine.stop_and_wait().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_read_faults_trigger_hardware_recovery() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    h.engine.start(h.chunk("faults"), "user", &CaptureSettings::default()).await?;

    sleep(Duration::from_secs(1)).await;
    h.provider.inject_read_faults(3);
    sleep(Duration::from_secs(6)).await;

    assert!(h.engine.is_active());
    assert_eq!(h.engine.status().state, SessionState::Capturing);
    assert_eq!(h.provider.live_devices(), 1);
    assert!(h.provider.successful_opens() >= 2);

    let outcome = h.engine.stop_and_wait().await.expect("session outcome");
    assert_eq!(outcome.exit, ExitReason::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lost_device_ends_session_with_error() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    let path = h.chunk("lost");
    h.engine.start(&path, "user", &CaptureSettings::default()).await?;

    sleep(Duration::from_secs(1)).await;
    h.provider.set_gone(true);
    sleep(Duration::from_millis(500)).await;

    assert!(!h.engine.is_active());
    let status = h.engine.status();
    assert_eq!(status.state, SessionState::Error);
    assert!(status.last_error.is_some());
    assert!(!h.store.lock().is_locked());

    let outcome = h.engine.take_finished().await.expect("finished session");
    assert!(matches!(outcome.exit, ExitReason::DeviceLost(_)));
    // Audio captured before the loss stays on disk
    assert!(path.exists());
    assert!(outcome.bytes > 0);
    assert!(h.engine.take_finished().await.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_storage_quota_stops_cleanly() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    let settings = CaptureSettings {
        storage_quota: 2_000,
        ..Default::default()
    };
    h.engine.start(h.chunk("quota"), "user", &settings).await?;

    sleep(Duration::from_secs(2)).await;
    assert!(!h.engine.is_active());
    assert_eq!(h.engine.status().state, SessionState::Idle);

    let outcome = h.engine.take_finished().await.expect("finished session");
    assert_eq!(outcome.exit, ExitReason::StorageLimit);
    assert!(outcome.bytes >= 2_000);
    assert_eq!(std::fs::metadata(&outcome.path)?.len(), outcome.bytes);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_finished_session_collected_by_next_start() -> Result<()> {
    let h = Harness::new(SyntheticProvider::constant(VOICE))?;
    let settings = CaptureSettings {
        storage_quota: 2_000,
        ..Default::default()
    };
    h.engine.start(h.chunk("first"), "user", &settings).await?;
    sleep(Duration::from_secs(1)).await;

    // The first session hit its quota; a new start must not lose it
    h.engine.start(h.chunk("second"), "user", &CaptureSettings::default()).await?;

    let first = h.engine.take_finished().await.expect("first outcome");
    assert_eq!(first.path, h.chunk("first"));
    assert_eq!(first.exit, ExitReason::StorageLimit);

    let second = h.engine.stop_and_wait().await.expect("second outcome");
    assert_eq!(second.path, h.chunk("second"));
    Ok(())
}
