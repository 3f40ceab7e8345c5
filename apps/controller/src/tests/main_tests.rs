use super::*;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("scanlink").chain(args.iter().copied()))
        .expect("arguments parse")
}

#[test]
fn global_flags_precede_subcommand() {
    let cli = parse(&["--server-url", "ws://10.0.0.5:8765/ws", "--wait-secs", "3", "list"]);
    assert_eq!(cli.server_url.as_deref(), Some("ws://10.0.0.5:8765/ws"));
    assert_eq!(cli.wait_secs, 3);
    assert!(matches!(cli.command, Command::List));
}

#[test]
fn relative_moves_accept_negative_deltas() {
    let cli = parse(&["move", "--rotate-by", "-30", "--tilt-by", "-5.5"]);
    match cli.command {
        Command::Move {
            rotation,
            tilt,
            rotate_by,
            tilt_by,
        } => {
            assert_eq!(rotation, None);
            assert_eq!(tilt, None);
            assert_eq!(rotate_by, Some(-30.0));
            assert_eq!(tilt_by, Some(-5.5));
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn config_subcommand_takes_json_patch() {
    let cli = parse(&["config", "default", "--set", r#"{"fps":15}"#]);
    match cli.command {
        Command::Config { source_id, set } => {
            assert_eq!(source_id, "default");
            assert_eq!(set.as_deref(), Some(r#"{"fps":15}"#));
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn scan_without_flags_uses_default_config() {
    let config = ScanArgs::default().to_config().expect("default is valid");
    assert_eq!(config, ScanConfig::default());
}

#[test]
fn scan_flags_override_preset() {
    let cli = parse(&[
        "scan",
        "--preset",
        "quick-scan",
        "--horizontal-step",
        "45",
        "--mode",
        "alternate",
    ]);
    let Command::Scan(args) = cli.command else {
        panic!("expected scan command");
    };
    let config = args.to_config().expect("valid config");
    assert_eq!(config.vertical_angles, 4);
    assert_eq!(config.horizontal_step, 45);
    assert_eq!(config.movement_delay, 1.0);
    assert_eq!(config.operation_mode, OperationMode::Alternate);
}

#[test]
fn unknown_preset_is_rejected() {
    let args = ScanArgs {
        preset: Some("panorama".into()),
        ..ScanArgs::default()
    };
    let err = args.to_config().expect_err("no such preset");
    assert!(err.to_string().contains("panorama"));
}

#[test]
fn out_of_range_scan_values_are_rejected() {
    let args = ScanArgs {
        movement_delay: Some(0.1),
        ..ScanArgs::default()
    };
    assert!(args.to_config().is_err());

    let args = ScanArgs {
        vertical_angles: Some(11),
        ..ScanArgs::default()
    };
    assert!(args.to_config().is_err());
}

#[test]
fn every_builtin_preset_resolves() {
    for preset in builtin_presets() {
        let args = ScanArgs {
            preset: Some(preset.id.to_string()),
            ..ScanArgs::default()
        };
        assert_eq!(args.to_config().expect("preset is valid"), preset.config);
    }
}

#[test]
fn missing_subcommand_fails_to_parse() {
    assert!(Cli::try_parse_from(["scanlink"]).is_err());
}

mod connection {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use client_core::transport::{Channel, ChannelPeer, Connector};

    use super::*;

    /// Opens in-process channels; `refuse` turns every attempt into a failure.
    struct LocalConnector {
        refuse: bool,
        peers: Mutex<Vec<ChannelPeer>>,
    }

    #[async_trait]
    impl Connector for LocalConnector {
        async fn connect(&self, _url: &str) -> anyhow::Result<Channel> {
            if self.refuse {
                bail!("connection refused");
            }
            let (channel, peer) = Channel::pair();
            self.peers.lock().expect("peers lock").push(peer);
            Ok(channel)
        }
    }

    fn client(refuse: bool) -> ControllerClient {
        let settings = ControllerSettings {
            refresh_on_open: false,
            ..ControllerSettings::default()
        };
        ControllerClient::with_connector(
            settings,
            Arc::new(LocalConnector {
                refuse,
                peers: Mutex::new(Vec::new()),
            }),
        )
    }

    #[tokio::test]
    async fn connection_opened_before_subscribing_is_not_missed() {
        let client = client(false);
        let state = client.state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.read().await.connection != ConnectionState::Open {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("in-process connection opens");

        // Subscribed only after `Connected` went out.
        let mut events = client.subscribe_events();
        await_connected(&client, &mut events, Duration::from_millis(100))
            .await
            .expect("open connection is seen through state");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_device_fails_after_wait() {
        let client = client(true);
        let mut events = client.subscribe_events();
        let err = await_connected(&client, &mut events, Duration::from_millis(50))
            .await
            .expect_err("nothing to connect to");
        assert!(err.to_string().contains("no answer"));
        client.shutdown().await;
    }
}
