use super::*;
use backon::BackoffBuilder;

fn delays(policy: &RetryPolicy) -> Vec<Duration> {
    policy.backoff().build().collect()
}

// Float factor arithmetic, so compare within a millisecond.
fn assert_close(actual: &[Duration], expected_ms: &[u64]) {
    assert_eq!(actual.len(), expected_ms.len(), "{actual:?}");
    for (retry, (delay, ms)) in actual.iter().zip(expected_ms).enumerate() {
        let expected = Duration::from_millis(*ms);
        let diff = if *delay > expected {
            *delay - expected
        } else {
            expected - *delay
        };
        assert!(diff < Duration::from_millis(1), "retry {retry}: {delay:?}");
    }
}

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.base_delay, Duration::from_millis(100));
    assert_eq!(policy.max_delay, Duration::from_secs(30));
    assert_eq!(policy.max_retries, 3);
}

#[test]
fn test_exponential_backoff() {
    let policy = RetryPolicy::default().with_max_retries(4);
    assert_close(&delays(&policy), &[100, 200, 400, 800]);
}

#[test]
fn test_delay_capped_at_max() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(500),
        max_retries: 5,
    };

    // 100 * 2^3 = 800, capped at 500
    assert_close(&delays(&policy), &[100, 200, 400, 500, 500]);
}

#[test]
fn test_backoff_zero_retries_is_empty() {
    let policy = RetryPolicy::default().with_max_retries(0);
    assert!(delays(&policy).is_empty());
}

#[test]
fn test_from_broker_config() {
    let config = BrokerConfig {
        default_max_retries: 5,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 80,
        ..BrokerConfig::default()
    };
    let policy = RetryPolicy::from_broker_config(&config);
    assert_eq!(policy.max_retries, 5);
    assert_close(&delays(&policy), &[10, 20, 40, 80, 80]);
}
