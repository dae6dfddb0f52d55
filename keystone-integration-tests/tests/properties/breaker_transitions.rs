//! The circuit breaker follows its state machine for any sequence of call
//! outcomes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keystone::config::{FailureThreshold, HalfOpenSuccesses, TimeoutMs};
use keystone::errors::{MeshError, MeshResult};
use keystone::mesh::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use keystone::types::ServiceId;
use proptest::prelude::*;

use super::runtime;

fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        ServiceId::try_new("inventory").unwrap(),
        CircuitBreakerConfig {
            failure_threshold: FailureThreshold::try_new(threshold).unwrap(),
            recovery_timeout: TimeoutMs::from_millis(recovery_ms),
            half_open_successes: HalfOpenSuccesses::try_new(3).unwrap(),
        },
    )
}

async fn call(breaker: &CircuitBreaker, succeed: bool, invoked: &AtomicUsize) -> MeshResult<()> {
    breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            if succeed {
                Ok(())
            } else {
                Err(MeshError::Transport {
                    service_id: ServiceId::try_new("inventory").unwrap(),
                    message: "connection refused".into(),
                })
            }
        })
        .await
}

proptest! {
    /// With a recovery timeout far in the future, the circuit opens on the
    /// threshold-th consecutive failure and then rejects without calling.
    #[test]
    fn closed_circuit_opens_on_consecutive_failures(
        threshold in 1u32..6,
        outcomes in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        runtime().block_on(async {
            let breaker = breaker(threshold, 3_600_000);
            let invoked = AtomicUsize::new(0);
            let mut consecutive = 0u32;
            let mut open = false;
            let mut expected_calls = 0usize;

            for succeed in outcomes {
                let result = call(&breaker, succeed, &invoked).await;
                if open {
                    prop_assert!(matches!(result, Err(MeshError::CircuitOpen(_))));
                } else {
                    expected_calls += 1;
                    prop_assert_eq!(result.is_ok(), succeed);
                    if succeed {
                        consecutive = 0;
                    } else {
                        consecutive += 1;
                        open = consecutive >= threshold;
                    }
                }
                prop_assert_eq!(invoked.load(Ordering::SeqCst), expected_calls);
                let expected_state = if open { CircuitState::Open } else { CircuitState::Closed };
                prop_assert_eq!(breaker.state(), expected_state);
            }
            prop_assert_eq!(breaker.trips(), u64::from(open));
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// After the recovery timeout, three probe successes close the circuit
    /// and any probe failure opens it again.
    #[test]
    fn half_open_probes_decide_the_next_state(
        outcomes in prop::collection::vec(any::<bool>(), 1..12),
    ) {
        runtime().block_on(async {
            let breaker = breaker(1, 2);
            let invoked = AtomicUsize::new(0);
            prop_assert!(call(&breaker, false, &invoked).await.is_err());
            let mut trips = 1u64;
            // `None` is closed, `Some(n)` is half-open after n probe successes.
            let mut probes: Option<u32> = Some(0);

            for succeed in outcomes {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let result = call(&breaker, succeed, &invoked).await;
                prop_assert_eq!(result.is_ok(), succeed);

                probes = match (probes, succeed) {
                    (Some(2), true) | (None, true) => None,
                    (Some(n), true) => Some(n + 1),
                    (_, false) => {
                        trips += 1;
                        Some(0)
                    }
                };
                match probes {
                    None => prop_assert_eq!(breaker.state(), CircuitState::Closed),
                    Some(0) => prop_assert_ne!(breaker.state(), CircuitState::Closed),
                    Some(_) => prop_assert_eq!(breaker.state(), CircuitState::HalfOpen),
                }
                prop_assert_eq!(breaker.trips(), trips);
            }
            Ok(())
        })?;
    }
}
