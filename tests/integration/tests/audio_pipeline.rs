//! Audio output ordering, backpressure and shutdown with real threads

use anyhow::Result;
use avsync::audio::{AudioOutput, NullSinkFactory};
use avsync::decoder::{AudioFormat, AudioRequest, BufferPool, DecodedUnit, Track};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn mono_format() -> Result<AudioFormat> {
    let request: AudioRequest = "mono_signed".parse()?;
    Ok(request.with_rate(22050))
}

fn unit(pool: &BufferPool, timestamp_us: i64) -> DecodedUnit {
    let mut unit = pool.acquire();
    unit.set_filled(64, timestamp_us, 32);
    unit
}

#[test]
fn test_units_play_in_decode_order() -> Result<()> {
    let played = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&played);
    let output = AudioOutput::builder(Arc::new(NullSinkFactory::new(0.0)))
        .with_timestamp_listener(Arc::new(move |ms: i64| recorder.lock().unwrap().push(ms)))
        .playing()
        .build(mono_format()?)?;

    let pool = BufferPool::new(Track::Audio, 64);
    for k in 0..50 {
        assert!(output.give_sample(unit(&pool, k * 20_000)));
    }

    for _ in 0..100 {
        if played.lock().unwrap().len() == 50 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    output.close();

    let played = played.lock().unwrap().clone();
    let expected: Vec<i64> = (0..50).map(|k| k * 20).collect();
    assert_eq!(played, expected);
    assert_eq!(pool.outstanding(), 0);
    Ok(())
}

#[test]
fn test_producer_blocks_at_horizon() -> Result<()> {
    let output = Arc::new(
        AudioOutput::builder(Arc::new(NullSinkFactory::new(0.0)))
            .with_horizon_us(500_000)
            .build(mono_format()?)?,
    );
    let pool = BufferPool::new(Track::Audio, 64);
    let pushed = Arc::new(AtomicUsize::new(0));

    let producer = {
        let output = Arc::clone(&output);
        let pool = pool.clone();
        let pushed = Arc::clone(&pushed);
        thread::spawn(move || {
            for k in 0..=10 {
                if !output.give_sample(unit(&pool, k * 100_000)) {
                    break;
                }
                pushed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Output starts paused: 0..=500 ms fit, 600 ms waits for the head to move
    thread::sleep(Duration::from_millis(200));
    assert_eq!(pushed.load(Ordering::SeqCst), 6);
    assert!(output.queued_span_us() <= 500_000);

    output.start_output();
    producer.join().unwrap();
    assert_eq!(pushed.load(Ordering::SeqCst), 11);

    output.close();
    assert_eq!(pool.outstanding(), 0);
    Ok(())
}

#[test]
fn test_close_unblocks_and_releases() -> Result<()> {
    let output = Arc::new(
        AudioOutput::builder(Arc::new(NullSinkFactory::new(0.0)))
            .with_horizon_us(100_000)
            .build(mono_format()?)?,
    );
    let pool = BufferPool::new(Track::Audio, 64);

    let producer = {
        let output = Arc::clone(&output);
        let pool = pool.clone();
        thread::spawn(move || {
            (0..10)
                .map(|k| output.give_sample(unit(&pool, k * 50_000)))
                .collect::<Vec<bool>>()
        })
    };

    thread::sleep(Duration::from_millis(100));
    output.close();
    output.close();

    let accepted = producer.join().unwrap();
    assert_eq!(&accepted[..3], &[true, true, true]);
    assert!(accepted[3..].iter().all(|ok| !ok));
    assert_eq!(pool.outstanding(), 0);
    Ok(())
}
