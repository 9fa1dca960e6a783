//! Fault-injection scenarios.
//!
//! Each test impairs one worker's transport and checks that the damage
//! is visible exactly where it should be: live streams starve under
//! loss, poll-based reads do not, offline windows refuse operations,
//! and swapping profiles mid-run takes effect immediately.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mesh_client::{ClientError, NetworkProfile};
    use mesh_harness::{verify, VerifyOptions};

    use crate::common::Scenario;

    fn total_loss() -> NetworkProfile {
        NetworkProfile {
            packet_loss_rate: Some(1.0),
            ..NetworkProfile::default()
        }
    }

    #[tokio::test]
    async fn test_total_loss_starves_streams_but_not_polls() {
        let scenario = Scenario::new("chaos-loss");
        let workers = scenario
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let convo = scenario.dm(&workers[0], &workers[1]).await;

        scenario
            .pool
            .set_worker_network_conditions("alice", total_loss())
            .unwrap();

        let streamed = verify::verify_message_stream(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(3)
                .with_token("starved")
                .with_per_message_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert_eq!(streamed.reception_percentage(), 0.0);
        assert!(!streamed.meets_floors());

        // The same receiver, the same impairment: history reads are
        // routed around the lossy stream path entirely.
        let polled = verify::verify_message_poll(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(3).with_token("polled"),
        )
        .await
        .unwrap();
        assert!(polled.all_received());
        assert_eq!(polled.reception_percentage(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_latency_delays_but_delivers() {
        let scenario = Scenario::new("chaos-latency");
        let workers = scenario
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let convo = scenario.dm(&workers[0], &workers[1]).await;

        scenario
            .pool
            .set_worker_network_conditions("alice", NetworkProfile::high_latency())
            .unwrap();

        let started = tokio::time::Instant::now();
        let report = verify::verify_message_stream(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(2).with_token("slow"),
        )
        .await
        .unwrap();

        assert!(report.all_received());
        assert_eq!(report.order_percentage(), 100.0);
        // Two messages, each held for at least the base latency.
        assert!(started.elapsed() >= Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_profile_swap_takes_effect_immediately() {
        let scenario = Scenario::new("chaos-swap");
        let workers = scenario
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let convo = scenario.dm(&workers[0], &workers[1]).await;

        let clean = verify::verify_message_stream(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(2).with_token("clean"),
        )
        .await
        .unwrap();
        assert!(clean.all_received());

        scenario
            .pool
            .set_worker_network_conditions("alice", total_loss())
            .unwrap();
        let impaired = verify::verify_message_stream(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(2)
                .with_token("impaired")
                .with_per_message_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert_eq!(impaired.reception_percentage(), 0.0);

        // Last write wins: restoring an unimpaired profile heals the
        // stream for subsequent traffic.
        scenario
            .pool
            .set_worker_network_conditions("alice", NetworkProfile::default())
            .unwrap();
        let healed = verify::verify_message_stream(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(2).with_token("healed"),
        )
        .await
        .unwrap();
        assert!(healed.all_received());
    }

    #[tokio::test]
    async fn test_certain_disconnect_refuses_operations() {
        let scenario = Scenario::new("chaos-offline");
        let workers = scenario
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();

        let profile = NetworkProfile {
            disconnect_probability: Some(1.0),
            disconnect_duration_ms: Some(200),
            ..NetworkProfile::default()
        };
        scenario
            .pool
            .set_worker_network_conditions("alice", profile)
            .unwrap();

        let alice = scenario.pool.get("alice").unwrap();
        let refused = alice.client().new_dm(workers[0].inbox_id()).await;
        assert_eq!(refused.err(), Some(ClientError::Offline));
        // The window holds across operations, not just the one that
        // opened it.
        assert_eq!(
            alice.client().inbox_state().await.err(),
            Some(ClientError::Offline)
        );

        // Wait out the window and stop re-rolling; the worker recovers
        // without being rebuilt.
        tokio::time::sleep(Duration::from_millis(250)).await;
        alice.apply_network_profile(NetworkProfile::default());
        assert!(alice.client().new_dm(workers[0].inbox_id()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_limit_throttles_large_payloads() {
        let scenario = Scenario::new("chaos-bandwidth");
        let workers = scenario
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let convo = scenario.dm(&workers[0], &workers[1]).await;

        scenario
            .pool
            .set_worker_network_conditions("alice", NetworkProfile::bandwidth_limited())
            .unwrap();

        let started = tokio::time::Instant::now();
        let report = verify::verify_message_stream(
            convo.as_ref(),
            &workers[1..],
            &VerifyOptions::new(1)
                .with_token(&"x".repeat(8_000))
                .with_per_message_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap();

        assert!(report.all_received());
        // 64 kbit/s over an ~8 KB payload is on the order of a second.
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_impairment_is_scoped_to_one_worker() {
        let scenario = Scenario::new("chaos-scope");
        let workers = scenario
            .pool
            .create_workers_named(&["henry", "nancy", "oscar"])
            .await
            .unwrap();
        let (sender, receivers) = workers.split_first().unwrap();
        let convo = scenario.group(sender, receivers).await;

        scenario
            .pool
            .set_worker_network_conditions("nancy", total_loss())
            .unwrap();

        let report = verify::verify_message_stream(
            convo.as_ref(),
            receivers,
            &VerifyOptions::new(4)
                .with_token("scoped")
                .with_per_message_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        // nancy hears nothing, oscar hears everything.
        assert!(!report.all_received());
        assert_eq!(report.reception_percentage(), 50.0);
        let nancy = report
            .receivers
            .iter()
            .find(|r| r.worker.starts_with("nancy"))
            .unwrap();
        assert!(nancy.payloads.is_empty());
        let oscar = report
            .receivers
            .iter()
            .find(|r| r.worker.starts_with("oscar"))
            .unwrap();
        assert_eq!(oscar.payloads, report.expected);
    }
}
