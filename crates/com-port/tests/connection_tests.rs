//! Integration tests for port connections
//!
//! These tests drive a [`ComPort`] against scripted simulated devices and
//! verify:
//! - Command/response matching and templating
//! - Timeouts and error reporting
//! - Serialization of concurrent callers
//! - Probing, background logging and transport errors

use std::sync::Arc;
use std::time::Duration;

use com_port::sim::{SimDevice, SimHandle, SimTransport};
use com_port::{
    BackgroundLog, ComPort, LockOrdering, LockPolicy, PortConfig, PortError, PortState,
    TransportFault, LOG_CAPACITY,
};
use com_protocol::{DeviceProfile, Macro, ProtocolError};
use regex::Regex;
use serde_json::json;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub const PATH: &str = "/dev/ttySIM0";

    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Short timeouts so failing paths finish quickly
    pub fn fast_config() -> PortConfig {
        PortConfig {
            read_timeout_ms: 300,
            lock: LockPolicy {
                poll_interval_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn mock_profile() -> DeviceProfile {
        DeviceProfile::builder("mock", 9600, vec![Macro::new("ID?", "^INITTED$").unwrap()])
            .operation("ping", vec![Macro::new("PING", "^PONG$").unwrap()])
            .operation(
                "move",
                vec![Macro::new("GOTO {target.x} {target.y}", "^OK").unwrap()],
            )
            .operation(
                "pair",
                vec![
                    Macro::new("A", "^ACK$").unwrap(),
                    Macro::new("B", "^ACK$").unwrap(),
                ],
            )
            .operation("say", vec![Macro::new("SAY {n}", "^ACK$").unwrap()])
            .build()
            .unwrap()
    }

    /// Device that understands every command in [`mock_profile`]
    pub fn mock_device() -> SimDevice {
        SimDevice::new()
            .respond("ID?", "INITTED")
            .respond("PING", "PONG")
            .respond_matching(Regex::new("^GOTO ").unwrap(), "OK")
            .respond_matching(Regex::new("^(A|B|SAY .*)$").unwrap(), "ACK")
    }

    /// Port on a fresh transport with the mock profile assigned
    pub fn port_with(device: SimDevice, config: &PortConfig) -> (ComPort, SimHandle) {
        init_tracing();
        let transport = SimTransport::new();
        let handle = transport.add_port(PATH, device);
        let port = ComPort::with_config(PATH, Arc::new(transport), config);
        port.set_profile(Some(Arc::new(mock_profile())));
        (port, handle)
    }

    /// Poll `check` until it holds or `limit` passes
    pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }
}

use helpers::*;

// ============================================================================
// Command Tests
// ============================================================================

mod command_tests {
    use super::*;

    #[tokio::test]
    async fn send_connects_and_returns_trimmed_response() {
        let (port, handle) = port_with(mock_device(), &fast_config());

        let responses = port.send("ping", None).await.unwrap();

        assert_eq!(responses, vec!["PONG"]);
        assert_eq!(port.state(), PortState::Background);
        assert_eq!(handle.writes(), vec!["PING"]);
        assert_eq!(handle.bauds(), vec![9600]);
    }

    #[tokio::test]
    async fn send_resolves_templates() -> anyhow::Result<()> {
        let (port, handle) = port_with(mock_device(), &fast_config());

        let params = json!({ "target": { "x": 10, "y": 20 } });
        let responses = port.send("move", Some(&params)).await?;

        assert_eq!(responses, vec!["OK"]);
        assert_eq!(handle.writes(), vec!["GOTO 10 20"]);
        Ok(())
    }

    #[tokio::test]
    async fn chunked_response_is_reassembled() {
        let (port, _handle) = port_with(mock_device().chunked(2), &fast_config());

        let responses = port.send("ping", None).await.unwrap();

        assert_eq!(responses, vec!["PONG"]);
    }

    #[tokio::test]
    async fn multi_macro_operation_returns_all_responses() -> anyhow::Result<()> {
        let (port, handle) = port_with(mock_device(), &fast_config());

        let responses = port.send("pair", None).await?;

        assert_eq!(responses, vec!["ACK", "ACK"]);
        assert_eq!(handle.writes(), vec!["A", "B"]);
        Ok(())
    }

    #[tokio::test]
    async fn custom_terminator_is_written() {
        let (port, handle) = port_with(mock_device(), &fast_config());
        port.set_line_terminator("\r\n");

        port.send("ping", None).await.unwrap();

        // The device strips the carriage return before recording
        assert_eq!(handle.writes(), vec!["PING"]);
    }

    #[tokio::test]
    async fn read_waits_for_unsolicited_match() {
        let (port, handle) = port_with(SimDevice::new(), &fast_config());
        port.connect(None).await.unwrap();

        let reader = {
            let port = port.clone();
            tokio::spawn(async move { port.read(&Regex::new("^READY$").unwrap()).await })
        };
        assert!(wait_until(Duration::from_secs(1), || port.state() == PortState::Busy).await);
        assert!(handle.emit("READY\r\n"));

        assert_eq!(reader.await.unwrap().unwrap(), "READY");
        assert_eq!(port.state(), PortState::Background);
    }
}

// ============================================================================
// Error Tests
// ============================================================================

mod error_tests {
    use super::*;

    #[tokio::test]
    async fn timeout_names_port_and_duration() {
        let (port, _handle) = port_with(SimDevice::new(), &fast_config());

        let err = port.send("ping", None).await.unwrap_err();

        assert_eq!(
            err,
            PortError::Timeout {
                path: PATH.into(),
                timeout_ms: 300,
            }
        );
        let message = err.to_string();
        assert!(message.contains(PATH));
        assert!(message.contains("300ms"));
        assert_eq!(port.state(), PortState::Background);
    }

    #[tokio::test]
    async fn no_profile_and_no_baud_rate() {
        init_tracing();
        let transport = SimTransport::new();
        transport.add_port(PATH, mock_device());
        let port = ComPort::new(PATH, Arc::new(transport));

        assert_eq!(
            port.send("ping", None).await.unwrap_err(),
            PortError::NoProfile(PATH.into())
        );
        assert_eq!(
            port.connect(None).await.unwrap_err(),
            PortError::NoBaudRate(PATH.into())
        );
        assert_eq!(port.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn unknown_operation_is_reported() {
        let (port, handle) = port_with(mock_device(), &fast_config());

        let err = port.send("fly", None).await.unwrap_err();

        assert_eq!(
            err,
            PortError::Protocol(ProtocolError::UnknownOperation {
                profile: "mock".into(),
                operation: "fly".into(),
            })
        );
        assert!(err.is_configuration());
        assert_eq!(handle.open_count(), 0);
    }

    #[tokio::test]
    async fn empty_macro_list_is_rejected() {
        let (port, _handle) = port_with(mock_device(), &fast_config());

        assert_eq!(
            port.send_macros(&[], None).await.unwrap_err(),
            PortError::EmptyMacroList(PATH.into())
        );
    }

    #[tokio::test]
    async fn failed_open_leaves_port_closed() {
        let (port, _handle) = port_with(mock_device().refuse_open(), &fast_config());

        let err = port.send("ping", None).await.unwrap_err();

        assert!(matches!(err, PortError::Open { .. }));
        assert_eq!(port.state(), PortState::Closed);
        assert!(port.last_error().is_some());
    }

    #[tokio::test]
    async fn busy_port_times_out_waiting_for_lock() {
        let mut config = fast_config();
        config.read_timeout_ms = 2000;
        config.lock.lock_attempts = 5;
        let (port, _handle) = port_with(
            mock_device().delay(Duration::from_millis(400)),
            &config,
        );

        let first = {
            let port = port.clone();
            tokio::spawn(async move { port.send("ping", None).await })
        };
        assert!(wait_until(Duration::from_secs(1), || port.state() == PortState::Busy).await);

        let err = port.send("ping", None).await.unwrap_err();
        assert!(matches!(err, PortError::LockTimeout { attempts: 5, .. }));

        assert_eq!(first.await.unwrap().unwrap(), vec!["PONG"]);
    }

    #[tokio::test]
    async fn slow_open_times_out_waiting_to_connect() {
        let mut config = fast_config();
        config.lock.connect_attempts = 3;
        let device = mock_device().open_delay(Duration::from_millis(500));
        let (port, _handle) = port_with(device, &config);

        let opening = {
            let port = port.clone();
            tokio::spawn(async move { port.connect(None).await })
        };
        assert!(wait_until(Duration::from_secs(1), || port.state() == PortState::Connecting).await);

        let err = port.send("ping", None).await.unwrap_err();
        assert_eq!(
            err,
            PortError::ConnectTimeout {
                path: PATH.into(),
                attempts: 3,
            }
        );

        opening.await.unwrap().unwrap();
        assert_eq!(port.state(), PortState::Background);
    }

    #[tokio::test]
    async fn read_deadline_counts_time_spent_writing() {
        // 8-byte link drained every 100ms: the write alone outlasts the timeout
        let device = mock_device()
            .capacity(8)
            .read_stall(Duration::from_millis(100));
        let (port, _handle) = port_with(device, &fast_config());
        port.connect(None).await.unwrap();

        let params = json!({ "n": "x".repeat(40) });
        let err = port.send("say", Some(&params)).await.unwrap_err();

        assert_eq!(
            err,
            PortError::Timeout {
                path: PATH.into(),
                timeout_ms: 300,
            }
        );
        assert_eq!(port.state(), PortState::Background);
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_sends_do_not_overlap() {
        let mut config = fast_config();
        config.read_timeout_ms = 2000;
        let (port, handle) = port_with(mock_device().delay(Duration::from_millis(50)), &config);

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let port = port.clone();
                tokio::spawn(async move { port.send("ping", None).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), vec!["PONG"]);
        }

        let writes = handle.timed_writes();
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            // Each write waits for the previous reply, which takes 50ms
            assert!(pair[1].0.duration_since(pair[0].0) >= Duration::from_millis(45));
        }
    }

    #[tokio::test]
    async fn fifo_callers_run_in_arrival_order() {
        let mut config = fast_config();
        config.read_timeout_ms = 2000;
        let (port, handle) = port_with(mock_device().delay(Duration::from_millis(20)), &config);

        let mut tasks = Vec::new();
        for n in 0..4 {
            let port = port.clone();
            tasks.push(tokio::spawn(async move {
                port.send("say", Some(&json!({ "n": n }))).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(handle.writes(), vec!["SAY 0", "SAY 1", "SAY 2", "SAY 3"]);
    }

    #[tokio::test]
    async fn fifo_operations_are_not_interleaved() {
        let mut config = fast_config();
        config.read_timeout_ms = 2000;
        let (port, handle) = port_with(mock_device().delay(Duration::from_millis(10)), &config);

        let a = {
            let port = port.clone();
            tokio::spawn(async move { port.send("pair", None).await })
        };
        let b = {
            let port = port.clone();
            tokio::spawn(async move { port.send("pair", None).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(handle.writes(), vec!["A", "B", "A", "B"]);
    }

    #[tokio::test]
    async fn polled_ordering_still_serializes_writes() {
        let mut config = fast_config();
        config.read_timeout_ms = 2000;
        config.lock.ordering = LockOrdering::Polled;
        let (port, handle) = port_with(mock_device().delay(Duration::from_millis(30)), &config);

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let port = port.clone();
                tokio::spawn(async move { port.send("ping", None).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), vec!["PONG"]);
        }

        assert_eq!(handle.open_count(), 1);
        let writes = handle.timed_writes();
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            assert!(pair[1].0.duration_since(pair[0].0) >= Duration::from_millis(25));
        }
    }
}

// ============================================================================
// Probe Tests
// ============================================================================

mod classify_tests {
    use super::*;

    #[tokio::test]
    async fn matching_device_is_identified_and_closed() {
        let (port, handle) = port_with(mock_device(), &fast_config());
        let profile = mock_profile();

        assert!(port.classify(&profile).await.unwrap());

        assert_eq!(port.state(), PortState::Closed);
        assert_eq!(handle.writes(), vec!["ID?"]);
        assert_eq!(handle.open_count(), 1);
        assert!(wait_until(Duration::from_secs(1), || !handle.is_open()).await);
    }

    #[tokio::test]
    async fn silent_device_is_not_identified() {
        let (port, _handle) = port_with(SimDevice::new(), &fast_config());

        assert!(!port.classify(&mock_profile()).await.unwrap());
        assert_eq!(port.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn wrong_answer_is_not_identified() {
        let device = SimDevice::new().respond("ID?", "SOMETHING ELSE");
        let (port, _handle) = port_with(device, &fast_config());

        assert!(!port.classify(&mock_profile()).await.unwrap());
        assert_eq!(port.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn open_failure_propagates() {
        let (port, _handle) = port_with(mock_device().refuse_open(), &fast_config());

        let err = port.classify(&mock_profile()).await.unwrap_err();

        assert!(matches!(err, PortError::Open { .. }));
        assert_eq!(port.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn startup_delay_is_honoured() {
        let (port, handle) = port_with(mock_device(), &fast_config());
        let init = vec![Macro::new("ID?", "^INITTED$").unwrap()];
        let profile = DeviceProfile::builder("slow", 4800, init)
            .startup_delay(Duration::from_millis(100))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        assert!(port.classify(&profile).await.unwrap());

        let writes = handle.timed_writes();
        assert!(writes[0].0.duration_since(started) >= Duration::from_millis(100));
        assert_eq!(handle.bauds(), vec![4800]);
    }

    #[tokio::test]
    async fn dead_link_fails_probe_and_closes() {
        let (port, handle) = port_with(mock_device().hang_up_on_open(), &fast_config());

        let err = port.classify(&mock_profile()).await.unwrap_err();

        assert!(
            matches!(err, PortError::Write { .. } | PortError::Transport { .. }),
            "unexpected error: {err}"
        );
        assert_eq!(port.state(), PortState::Closed);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn dropped_probe_still_closes_port() {
        let mut config = fast_config();
        config.read_timeout_ms = 1000;
        let (port, handle) = port_with(SimDevice::new(), &config);
        let profile = mock_profile();

        let probe = tokio::time::timeout(Duration::from_millis(200), port.classify(&profile));
        assert!(probe.await.is_err());

        assert!(wait_until(Duration::from_secs(1), || port.state() == PortState::Closed).await);
        assert!(wait_until(Duration::from_secs(1), || !handle.is_open()).await);
        assert_eq!(handle.writes(), vec!["ID?"]);
    }
}

// ============================================================================
// Background And Transport Event Tests
// ============================================================================

mod event_tests {
    use super::*;

    #[tokio::test]
    async fn unsolicited_data_goes_to_background_log() {
        let (port, handle) = port_with(SimDevice::new(), &fast_config());
        port.connect(None).await.unwrap();

        assert!(handle.emit("TEMP=21\r\nHUM=40\r\n"));

        assert!(wait_until(Duration::from_secs(1), || port.background_log().len() == 3).await);
        assert_eq!(port.background_log(), vec!["TEMP=21", "HUM=40", ""]);
        assert_eq!(port.drain_log().len(), 3);
        assert!(port.background_log().is_empty());
    }

    #[tokio::test]
    async fn greeting_lands_in_background_log() {
        let (port, _handle) = port_with(SimDevice::new().greeting("BOOT OK"), &fast_config());
        port.connect(None).await.unwrap();

        assert!(wait_until(Duration::from_secs(1), || port.snapshot().log_len > 0).await);
        assert_eq!(port.background_log()[0], "BOOT OK");
    }

    #[tokio::test]
    async fn receive_data_while_closed_is_dropped() {
        let (port, _handle) = port_with(SimDevice::new(), &fast_config());

        port.receive_data("noise");

        assert!(port.background_log().is_empty());
        assert_eq!(port.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn soft_error_fails_read_and_returns_to_background() {
        let mut config = fast_config();
        config.read_timeout_ms = 5000;
        let (port, _handle) = port_with(SimDevice::new(), &config);

        let pending = {
            let port = port.clone();
            tokio::spawn(async move { port.send("ping", None).await })
        };
        assert!(wait_until(Duration::from_secs(1), || port.state() == PortState::Busy).await);

        port.receive_error(TransportFault::open("framing error"));

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PortError::Transport { ref message, .. } if message == "framing error"
        ));
        assert_eq!(port.state(), PortState::Background);
        assert_eq!(port.last_error().as_deref(), Some("framing error"));
    }

    #[tokio::test]
    async fn fatal_error_closes_port() {
        let (port, _handle) = port_with(SimDevice::new(), &fast_config());
        port.connect(None).await.unwrap();

        port.receive_error(TransportFault::closed("device unplugged"));

        assert_eq!(port.state(), PortState::Closed);
        assert_eq!(port.last_error().as_deref(), Some("device unplugged"));
    }

    #[tokio::test]
    async fn hang_up_closes_port() {
        let (port, handle) = port_with(SimDevice::new(), &fast_config());
        port.connect(None).await.unwrap();
        let mut states = port.subscribe_state();

        handle.hang_up();

        let closed = tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|state| *state == PortState::Closed),
        )
        .await;
        assert!(closed.is_ok());
        assert!(port.last_error().is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reconnect_works() {
        let (port, handle) = port_with(mock_device(), &fast_config());

        port.close().await.unwrap();
        port.connect(None).await.unwrap();
        port.close().await.unwrap();
        port.close().await.unwrap();
        assert_eq!(port.state(), PortState::Closed);

        assert_eq!(port.send("ping", None).await.unwrap(), vec!["PONG"]);
        assert_eq!(handle.open_count(), 2);
    }

    #[tokio::test]
    async fn snapshot_reports_profile_and_state() {
        let (port, _handle) = port_with(mock_device(), &fast_config());
        port.set_name(Some("mock0".into()));

        let snapshot = port.snapshot();

        assert_eq!(snapshot.path, PATH);
        assert_eq!(snapshot.name.as_deref(), Some("mock0"));
        assert_eq!(snapshot.state_display(), "closed (mock)");
    }
}

// ============================================================================
// Property Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk() -> impl Strategy<Value = String> {
        "[a-z0-9\r\n]{0,64}"
    }

    proptest! {
        #[test]
        fn log_never_exceeds_capacity(chunks in prop::collection::vec(chunk(), 0..400)) {
            let mut log = BackgroundLog::new();
            for c in &chunks {
                log.push_chunk(c);
                prop_assert!(log.len() <= LOG_CAPACITY);
            }
            prop_assert!(log.entries().iter().all(|entry| !entry.contains('\n')));
        }

        #[test]
        fn log_preserves_text_below_capacity(
            chunks in prop::collection::vec("[a-z\n]{0,16}", 0..50)
        ) {
            let mut log = BackgroundLog::new();
            for c in &chunks {
                log.push_chunk(c);
            }
            prop_assert_eq!(log.entries().join("\n"), chunks.concat());
        }
    }
}
