//! End-to-end playback through the WAV backend and a paced null sink

use anyhow::Result;
use avsync::player::{EngineEvent, PlaybackEngine, PlaybackState};
use avsync_integration_tests::{null_audio_config, EventLog, PositionRecorder, TestFixture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn engine_for(
    fixture_path: &std::path::Path,
    recorder: &Arc<PositionRecorder>,
) -> Result<(PlaybackEngine, EventLog)> {
    let (handler, events) = EventLog::new();
    let engine = PlaybackEngine::builder(fixture_path)
        .with_config(null_audio_config())
        .with_render_sink(recorder.clone())
        .with_event_handler(handler)
        .build()?;
    engine.start()?;
    Ok((engine, events))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wav_plays_in_real_time() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let (engine, mut events) = engine_for(&fixture.media_files.tone_10s, &recorder)?;

    let opened = events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::MediaOpened { .. }))
        .await?;
    if let EngineEvent::MediaOpened { info, .. } = opened {
        assert!(info.has_audio());
        assert!(!info.has_video());
        assert_eq!(info.duration(), Duration::from_secs(10));
    }

    let started = Instant::now();
    engine.play()?;
    let reached = recorder.wait_for(Duration::from_secs(5), |ms| ms >= 1900).await?;

    assert!(reached <= 2100, "position jumped to {} ms", reached);
    assert!(
        started.elapsed() >= Duration::from_millis(1500),
        "audio was not paced: 2 s played in {:?}",
        started.elapsed()
    );
    assert!(engine.queued_audio_span() <= Duration::from_millis(1000));

    let positions = recorder.positions();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "positions out of order: {:?}", positions);

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_freezes_transport() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let (engine, mut events) = engine_for(&fixture.media_files.tone_10s, &recorder)?;

    engine.play()?;
    events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::StateChanged(PlaybackState::Playing)))
        .await?;
    sleep(Duration::from_millis(500)).await;

    engine.stop()?;
    events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::StateChanged(PlaybackState::Idle)))
        .await?;
    let stopped_at = engine.current_time_ms();
    assert!(stopped_at >= 300, "transport only reached {} ms", stopped_at);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.current_time_ms(), stopped_at);
    assert!(!engine.is_playing());

    // Playing again continues from where the transport stopped
    engine.play()?;
    sleep(Duration::from_millis(300)).await;
    assert!(engine.current_time_ms() > stopped_at);

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_of_stream() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let (engine, mut events) = engine_for(&fixture.media_files.tone_short, &recorder)?;

    engine.play()?;
    events
        .wait_for(Duration::from_secs(5), |e| matches!(e, EngineEvent::EndOfStream))
        .await?;
    assert_eq!(engine.state(), PlaybackState::Idle);
    assert_eq!(engine.current_time_ms(), 500);

    // Nothing left to play forwards
    engine.play()?;
    events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::EndOfStream))
        .await?;
    assert_eq!(engine.state(), PlaybackState::Idle);

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_audio_plays_out_after_end() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let (engine, mut events) = engine_for(&fixture.media_files.tone_short, &recorder)?;

    engine.play()?;
    events
        .wait_for(Duration::from_secs(5), |e| matches!(e, EngineEvent::EndOfStream))
        .await?;

    let deadline = Instant::now() + Duration::from_secs(3);
    while !engine.audio_drained() {
        assert!(Instant::now() < deadline, "audio never drained");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.queued_audio_span(), Duration::ZERO);

    // The final unit of the half second tone was heard
    let last = recorder.last().unwrap_or_default();
    assert!(last >= 370, "last played position {} ms", last);

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_file_reports_error() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let (engine, mut events) = engine_for(&fixture.path().join("missing.wav"), &recorder)?;

    let event = events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::Error(_)))
        .await?;
    if let EngineEvent::Error(message) = event {
        assert!(!message.is_empty());
    }
    assert!(engine.media_info().is_none());

    engine.close();
    Ok(())
}
