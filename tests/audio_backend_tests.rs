// Integration tests for capture device acquisition
//
// These tests drive the acquisition algorithm against the synthetic
// microphone: rate priority, fallback, bounded retry and the errors that
// must never be retried.

use loqa_recorder::audio::backend::{acquire, acquire_once, candidate_rates, ACQUIRE_TIMEOUT};
use loqa_recorder::audio::{CaptureDevice, DeviceProvider, SyntheticProvider};
use loqa_recorder::CaptureError;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_each_supported_rate_selected_first() {
    for rate in [16000, 44100, 48000] {
        let provider = SyntheticProvider::constant(1000);
        let device = acquire(&provider, &candidate_rates(rate), ACQUIRE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(device.sample_rate(), rate);
        let opens = provider.opens();
        assert_eq!(opens.len(), 1, "{}Hz should open on the first attempt", rate);
        assert_eq!(opens[0].sample_rate, rate);
        assert!(opens[0].succeeded);
    }
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_next_supported_rate() {
    let provider = SyntheticProvider::constant(1000).with_rates(vec![44100]);

    let device = acquire(&provider, &candidate_rates(16000), ACQUIRE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(device.sample_rate(), 44100);
    // Unsupported rates are skipped without opening anything
    assert_eq!(provider.opens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_busy_device_retried_within_pass() {
    let provider = SyntheticProvider::constant(1000);
    provider.fail_next_opens(2);

    let device = acquire_once(&provider, &candidate_rates(16000)).await.unwrap();

    assert_eq!(device.sample_rate(), 48000);
    let opens = provider.opens();
    assert_eq!(opens.len(), 3);
    assert!(!opens[0].succeeded);
    assert!(!opens[1].succeeded);
    assert!(opens[2].succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_acquisition_gives_up_after_timeout() {
    let provider = SyntheticProvider::constant(1000);
    provider.fail_next_opens(usize::MAX);

    let err = match acquire(&provider, &[16000], ACQUIRE_TIMEOUT).await {
        Ok(_) => panic!("acquisition should fail"),
        Err(e) => e,
    };

    match err {
        CaptureError::AcquisitionTimedOut { waited, .. } => {
            assert!(waited >= ACQUIRE_TIMEOUT);
            assert!(waited < ACQUIRE_TIMEOUT + Duration::from_secs(1));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(provider.opens().len() > 1, "busy devices are retried");
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_not_retried() {
    let provider = SyntheticProvider::constant(1000);
    provider.set_permission(false);

    assert_eq!(provider.check_permission(), Err(CaptureError::PermissionDenied));
    let result = acquire(&provider, &candidate_rates(16000), ACQUIRE_TIMEOUT).await;

    assert!(matches!(result, Err(CaptureError::PermissionDenied)));
    assert_eq!(provider.opens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gone_device_not_retried() {
    let provider = SyntheticProvider::constant(1000);
    provider.set_gone(true);

    let result = acquire(&provider, &candidate_rates(16000), ACQUIRE_TIMEOUT).await;

    assert!(matches!(result, Err(CaptureError::Gone(_))));
    assert_eq!(provider.opens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_released_device_stops_delivering() {
    let provider = SyntheticProvider::constant(1000);
    let mut device = acquire(&provider, &[16000], ACQUIRE_TIMEOUT).await.unwrap();
    assert_eq!(provider.live_devices(), 1);

    device.release();
    device.release();
    assert_eq!(provider.live_devices(), 0);

    let mut buf = vec![0i16; 160];
    assert!(device.read(&mut buf).await.is_err());
}
