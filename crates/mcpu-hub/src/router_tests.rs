use serde_json::{Value, json};

use mcpu_core::CoreExecutionOptions;

use crate::test_support::{MockBehavior, build_router, mock_spec, write_mock_server};

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_servers_lists_configured_servers_disconnected() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_server(temp.path(), MockBehavior::default()).unwrap();
    let router = build_router(
        vec![("a", mock_spec(&script)), ("b", mock_spec(&script))],
        temp.path(),
    );

    let result = router
        .execute(CoreExecutionOptions::from_argv(["servers"]))
        .await;
    assert!(result.success);
    assert_eq!(result.exit_code, 0);

    let listing: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
    let entries = listing.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"], "a");
    assert_eq!(entries[0]["state"], "disconnected");
    assert_eq!(entries[1]["name"], "b");
    assert_eq!(entries[1]["state"], "disconnected");

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_call_returns_tool_payload() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_server(temp.path(), MockBehavior::default()).unwrap();
    let router = build_router(vec![("good", mock_spec(&script))], temp.path());

    let result = router
        .execute(CoreExecutionOptions {
            argv: argv(&["call", "good", "t"]),
            params: Some(json!({"x": 1})),
            ..Default::default()
        })
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output.as_deref(), Some("{\"y\":2}"));
    assert_eq!(result.exit_code, 0);

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_call_with_flags_builds_arguments() {
    let temp = tempfile::tempdir().unwrap();
    let call_log = temp.path().join("calls.log");
    let behavior = MockBehavior {
        call_log: Some(call_log.clone()),
        ..Default::default()
    };
    let script = write_mock_server(temp.path(), behavior).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv([
            "call",
            "s",
            "echo_tool",
            "--path=/tmp",
            "--count:number=3",
        ]))
        .await;
    assert!(result.success);

    let logged = std::fs::read_to_string(&call_log).unwrap();
    assert!(logged.contains("\"path\":\"/tmp\""));
    assert!(logged.contains("\"count\":3"));

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_call_unknown_server_is_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let router = build_router(vec![], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["call", "ghost", "t"]))
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert!(result.error.as_deref().unwrap().contains("unknown server"));
}

#[tokio::test]
async fn test_tool_error_preserves_payload() {
    let temp = tempfile::tempdir().unwrap();
    let behavior = MockBehavior {
        call_is_error: true,
        ..Default::default()
    };
    let script = write_mock_server(temp.path(), behavior).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["call", "s", "boom_tool"]))
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.output.as_deref(), Some("tool blew up"));
    assert!(result.error.as_deref().unwrap().contains("boom_tool"));

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_tools_and_info_serve_cached_schemas() {
    let temp = tempfile::tempdir().unwrap();
    let list_log = temp.path().join("lists.log");
    let behavior = MockBehavior {
        list_log: Some(list_log.clone()),
        ..Default::default()
    };
    let script = write_mock_server(temp.path(), behavior).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["tools", "s"]))
        .await;
    assert!(result.success);
    let listing: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
    assert_eq!(listing["s"][0]["name"], "echo_tool");
    assert_eq!(listing["s"][0]["description"], "Echo tool");

    // info serves the full descriptor from the cache: no second list call.
    let result = router
        .execute(CoreExecutionOptions::from_argv(["info", "s", "echo_tool"]))
        .await;
    assert!(result.success);
    let descriptors: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
    assert_eq!(descriptors[0]["name"], "echo_tool");
    assert!(descriptors[0]["inputSchema"].is_object());

    let listings = std::fs::read_to_string(&list_log).unwrap();
    assert_eq!(listings.lines().count(), 1);

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_info_unknown_tool_is_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_server(temp.path(), MockBehavior::default()).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["info", "s", "nope"]))
        .await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("'nope'"));

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_concurrent_cold_tools_hit_child_once() {
    let temp = tempfile::tempdir().unwrap();
    let list_log = temp.path().join("lists.log");
    let behavior = MockBehavior {
        list_log: Some(list_log.clone()),
        ..Default::default()
    };
    let script = write_mock_server(temp.path(), behavior).unwrap();
    let router = build_router(vec![("cold", mock_spec(&script))], temp.path());

    let mut handles = Vec::new();
    for _ in 0..2 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .execute(CoreExecutionOptions::from_argv(["tools", "cold"]))
                .await
        }));
    }
    let mut outputs = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success);
        outputs.push(result.output.unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);

    let listings = std::fs::read_to_string(&list_log).unwrap();
    assert_eq!(listings.lines().count(), 1, "expected a single tools/list");

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_connect_reload_disconnect_flow() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_server(temp.path(), MockBehavior::default()).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["connect", "s"]))
        .await;
    assert!(result.success);

    let result = router
        .execute(CoreExecutionOptions::from_argv(["servers"]))
        .await;
    let listing: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
    assert_eq!(listing[0]["state"], "ready");
    assert!(listing[0]["pid"].is_u64());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["reload", "s"]))
        .await;
    assert!(result.success);

    let result = router
        .execute(CoreExecutionOptions::from_argv(["disconnect", "s"]))
        .await;
    assert!(result.success);
    let result = router
        .execute(CoreExecutionOptions::from_argv(["servers"]))
        .await;
    let listing: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
    assert_eq!(listing[0]["state"], "disconnected");

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_reload_forces_fresh_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let list_log = temp.path().join("lists.log");
    let behavior = MockBehavior {
        list_log: Some(list_log.clone()),
        ..Default::default()
    };
    let script = write_mock_server(temp.path(), behavior).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());

    router
        .execute(CoreExecutionOptions::from_argv(["tools", "s"]))
        .await;
    router
        .execute(CoreExecutionOptions::from_argv(["reload", "s"]))
        .await;
    let result = router
        .execute(CoreExecutionOptions::from_argv(["tools", "s"]))
        .await;
    assert!(result.success);

    let listings = std::fs::read_to_string(&list_log).unwrap();
    assert_eq!(listings.lines().count(), 2);

    router.pool().shutdown_all().await;
}

#[tokio::test]
async fn test_unknown_command_is_validation_error() {
    let temp = tempfile::tempdir().unwrap();
    let router = build_router(vec![], temp.path());

    let result = router
        .execute(CoreExecutionOptions::from_argv(["frobnicate"]))
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, 2);
    assert!(result.error.as_deref().unwrap().contains("frobnicate"));

    let result = router.execute(CoreExecutionOptions::default()).await;
    assert_eq!(result.exit_code, 2);
}

#[tokio::test]
async fn test_large_output_spills_with_refs_mode() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_server(temp.path(), MockBehavior::default()).unwrap();
    let router = build_router(vec![("s", mock_spec(&script))], temp.path());
    let out_dir = temp.path().join("out");

    let result = router
        .execute(CoreExecutionOptions {
            argv: argv(&["call", "s", "t", "--x=1"]),
            params: Some(json!({"response_mode": "refs"})),
            output_dir: Some(out_dir.clone()),
            ..Default::default()
        })
        .await;
    assert!(result.success, "error: {:?}", result.error);

    let body: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
    assert_eq!(body["truncated"], true);
    let file = body["file"].as_str().unwrap();
    assert!(file.starts_with(out_dir.to_str().unwrap()));
    assert_eq!(std::fs::read_to_string(file).unwrap(), "{\"y\":2}");

    router.pool().shutdown_all().await;
}
