//! Transport commands: seeking, speed changes, coalescing and shutdown

use anyhow::Result;
use avsync::decoder::{SyntheticBackend, SyntheticConfig};
use avsync::player::{EngineEvent, PlaybackEngine, PlaybackState, ViewerSettings};
use avsync::utils::error::StreamError;
use avsync_integration_tests::{null_audio_config, EventLog, PositionRecorder, TestFixture};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread")]
async fn test_seek_while_playing() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let (handler, mut events) = EventLog::new();
    let engine = PlaybackEngine::builder(&fixture.media_files.tone_10s)
        .with_config(null_audio_config())
        .with_render_sink(recorder.clone())
        .with_event_handler(handler)
        .build()?;
    engine.start()?;

    engine.play()?;
    recorder.wait_for(Duration::from_secs(3), |ms| ms >= 300).await?;

    engine.seek(5000)?;
    events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::Seeked(5000)))
        .await?;
    let landed = recorder.wait_for(Duration::from_secs(3), |ms| ms >= 5000).await?;
    assert!(landed < 5300, "first position after seek was {} ms", landed);

    let now = engine.current_time_ms();
    assert!((5000..6500).contains(&now), "transport at {} ms", now);
    assert!(engine.is_playing());

    // Backwards seek flushes and restarts from the target
    recorder.clear();
    engine.seek(1000)?;
    let landed = recorder.wait_for(Duration::from_secs(3), |ms| ms < 5000).await?;
    assert!((1000..1500).contains(&landed), "first position after seek was {} ms", landed);

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_seek_out_of_range_rejected() -> Result<()> {
    let fixture = TestFixture::new()?;
    let (handler, mut events) = EventLog::new();
    let engine = PlaybackEngine::builder(&fixture.media_files.tone_10s)
        .with_config(null_audio_config())
        .with_event_handler(handler)
        .build()?;
    engine.start()?;
    events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::MediaOpened { .. }))
        .await?;

    assert!(matches!(engine.seek(20_000), Err(StreamError::OutOfRange(_))));
    assert!(matches!(engine.seek(-1), Err(StreamError::OutOfRange(_))));
    assert!(engine.seek(10_000).is_ok());

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_speed_bounds() -> Result<()> {
    let fixture = TestFixture::new()?;
    let (handler, mut events) = EventLog::new();
    let engine = PlaybackEngine::builder(&fixture.media_files.tone_10s)
        .with_config(null_audio_config())
        .with_event_handler(handler)
        .build()?;
    engine.start()?;

    assert!(matches!(engine.adjust_speed(0.0), Err(StreamError::OutOfRange(_))));
    assert!(matches!(engine.adjust_speed(-4.5), Err(StreamError::OutOfRange(_))));
    assert!(matches!(engine.adjust_speed(f32::NAN), Err(StreamError::OutOfRange(_))));

    engine.play()?;
    engine.adjust_speed(2.0)?;
    events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::SpeedChanged(s) if *s == 2.0))
        .await?;
    assert_eq!(engine.speed(), 2.0);

    // Above 1x the transport runs on without sound
    let before = engine.current_time_ms();
    sleep(Duration::from_millis(500)).await;
    let advanced = engine.current_time_ms() - before;
    assert!(advanced >= 700, "transport advanced {} ms in 500 ms at 2x", advanced);
    assert!(engine.is_playing());

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_seeks_coalesce() -> Result<()> {
    let (handler, mut events) = EventLog::new();
    let engine = PlaybackEngine::builder("synthetic")
        .with_backend(Arc::new(SyntheticBackend::new(SyntheticConfig {
            width: 64,
            height: 48,
            ..SyntheticConfig::default()
        })))
        .with_config(null_audio_config())
        .with_event_handler(handler)
        .build()?;

    engine.seek(100)?;
    engine.seek(200)?;
    engine.seek(300)?;
    engine.start()?;

    let seeked = events
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::Seeked(_)))
        .await?;
    assert!(matches!(seeked, EngineEvent::Seeked(300)));

    sleep(Duration::from_millis(200)).await;
    assert!(!events.drain().iter().any(|e| matches!(e, EngineEvent::Seeked(_))));

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offset_shifts_positions() -> Result<()> {
    let fixture = TestFixture::new()?;
    let recorder = Arc::new(PositionRecorder::default());
    let engine = PlaybackEngine::builder(&fixture.media_files.tone_10s)
        .with_config(null_audio_config())
        .with_settings(ViewerSettings {
            offset_ms: 1000,
            ..ViewerSettings::default()
        })
        .with_render_sink(recorder.clone())
        .build()?;
    engine.start()?;

    // Seeks are given in shifted time
    engine.seek(3000)?;
    engine.play()?;
    let first = recorder.wait_for(Duration::from_secs(3), |_| true).await?;
    assert!((3000..3300).contains(&first), "first position {} ms", first);

    engine.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_is_idempotent() -> Result<()> {
    let fixture = TestFixture::new()?;
    let (handler, mut events) = EventLog::new();
    let engine = PlaybackEngine::builder(&fixture.media_files.tone_10s)
        .with_config(null_audio_config())
        .with_event_handler(handler)
        .build()?;
    engine.start()?;
    engine.play()?;
    sleep(Duration::from_millis(200)).await;

    engine.close();
    engine.close();
    assert_eq!(engine.state(), PlaybackState::Idle);
    assert!(events.drain().iter().any(|e| matches!(e, EngineEvent::StreamClosed)));

    // A never-started engine closes without opening anything
    let idle = PlaybackEngine::builder(&fixture.media_files.tone_10s)
        .with_config(null_audio_config())
        .build()?;
    idle.close();
    assert!(idle.media_info().is_none());
    Ok(())
}
