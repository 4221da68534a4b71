mod common;

use std::sync::Arc;

use common::{manifest, Harness, ScriptedFetcher};
use plughost_plugin::{NewLocalPlugin, PluginError, PluginState, DEV_PLUGIN_ID};
use plughost_store::MemoryBackend;
use serde_json::json;

const SOURCE: &str = "https://ex.example/p";

// ─── Start / stop ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_twice_and_stop_unstarted() {
    let h = Harness::new();
    h.install("clock", "ok").await;

    assert!(matches!(
        h.runtime.stop("clock").await,
        Err(PluginError::NotLoaded(_))
    ));
    assert!(matches!(
        h.runtime.stop("missing").await,
        Err(PluginError::NotFound(_))
    ));

    h.runtime.start("clock").await.unwrap();
    assert!(matches!(
        h.runtime.start("clock").await,
        Err(PluginError::AlreadyLoaded(_))
    ));
    assert_eq!(h.runtime.state("clock"), PluginState::Running);
    assert_eq!(h.events(), vec!["load:clock"]);
}

#[tokio::test]
async fn test_concurrent_start_fails_fast() {
    let h = Harness::new();
    h.install("clock", "ok").await;

    let (a, b) = tokio::join!(h.runtime.start("clock"), h.runtime.start("clock"));
    let failures = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(PluginError::AlreadyLoaded(_))))
        .count();
    assert_eq!(failures, 1, "{a:?} {b:?}");
    assert_eq!(h.events(), vec!["load:clock"]);
}

#[tokio::test]
async fn test_start_stop_accounting() {
    let h = Harness::new();
    h.install("clock", "ok").await;

    h.runtime.start("clock").await.unwrap();
    let record = h.runtime.registry().get("clock").unwrap();
    assert_eq!(record.usage_stats.start_count, 1);
    assert!(record.enabled_at.is_some());
    assert!(record.usage_stats.last_started.is_some());

    let store = h.runtime.plugin_store("clock").unwrap();
    assert_eq!(store.get("loads"), Some(json!(1)));

    h.runtime.stop("clock").await.unwrap();
    assert_eq!(h.runtime.state("clock"), PluginState::Disabled);
    assert_eq!(h.events(), vec!["load:clock", "unload:clock"]);

    let record = h.runtime.registry().get("clock").unwrap();
    assert!(!record.enabled);
    assert!(record.disabled_at.is_some());
    assert!(record.usage_stats.total_uptime_ms.is_some());
}

#[tokio::test]
async fn test_evaluation_failure_disables_plugin() {
    let h = Harness::new();
    h.install("broken", "fail-eval").await;
    h.runtime.registry().update("broken", |r| r.enabled = true).unwrap();

    let err = h.runtime.start("broken").await.unwrap_err();
    assert!(matches!(err, PluginError::Evaluation { .. }), "{err}");
    assert!(!h.runtime.is_loaded("broken"));

    let record = h.runtime.registry().get("broken").unwrap();
    assert!(!record.enabled);
    assert_eq!(record.usage_stats.error_count, 1);
    assert!(record.last_error.unwrap().contains("syntax error"));
}

#[tokio::test]
async fn test_on_load_failure_rolls_back() {
    let h = Harness::new();
    h.install("flaky", "fail-load").await;

    let err = h.runtime.start("flaky").await.unwrap_err();
    assert!(matches!(err, PluginError::Hook(_)), "{err}");
    assert_eq!(h.runtime.state("flaky"), PluginState::Disabled);
    assert_eq!(h.events(), vec!["load:flaky", "unload:flaky"]);

    let record = h.runtime.registry().get("flaky").unwrap();
    assert!(!record.enabled);
    assert_eq!(record.usage_stats.start_count, 0);
    assert_eq!(record.last_error.as_deref(), Some("plugin hook failed: boom"));

    // The slot is released, so a fixed plugin can start again.
    h.runtime
        .registry()
        .update("flaky", |r| r.code = "ok".into())
        .unwrap();
    h.runtime.start("flaky").await.unwrap();
}

#[tokio::test]
async fn test_invalid_manifest_is_never_evaluated() {
    let h = Harness::new();
    h.runtime.registry().ready().await;
    let mut bad = manifest("bad", "1.0");
    bad.author = String::new();
    bad.permissions = vec!["filesystem".into()];
    h.runtime
        .install_local("bad", NewLocalPlugin::new(bad, "ok"))
        .unwrap();
    h.runtime.registry().update("bad", |r| r.enabled = true).unwrap();

    let err = h.runtime.start("bad").await.unwrap_err();
    match &err {
        PluginError::Validation(violations) => assert_eq!(violations.len(), 3, "{err}"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(h.events().is_empty());
    assert_eq!(h.runtime.state("bad"), PluginState::Disabled);

    let record = h.runtime.registry().get("bad").unwrap();
    assert!(!record.enabled);
    assert!(record.disabled_at.is_some());
    assert_eq!(record.usage_stats.error_count, 1);
    assert_eq!(record.usage_stats.start_count, 0);
    let last_error = record.last_error.unwrap();
    for violation in [
        "author must not be empty",
        "version '1.0' must have the form x.y.z",
        "unknown permission 'filesystem'",
    ] {
        assert!(last_error.contains(violation), "{last_error}");
    }
}

#[tokio::test]
async fn test_stop_during_on_load_is_refused() {
    let h = Harness::new();
    h.install("slow", "gated").await;

    let runtime = h.runtime.clone();
    let start = tokio::spawn(async move { runtime.start("slow").await });
    while !h.events().contains(&"load:slow".to_string()) {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.runtime.state("slow"), PluginState::Starting);
    assert!(!h.runtime.is_loaded("slow"));
    assert!(matches!(
        h.runtime.stop("slow").await,
        Err(PluginError::NotLoaded(_))
    ));
    assert!(matches!(
        h.runtime.start("slow").await,
        Err(PluginError::AlreadyLoaded(_))
    ));

    h.gate.notify_one();
    start.await.unwrap().unwrap();
    assert_eq!(h.runtime.state("slow"), PluginState::Running);
    assert_eq!(h.runtime.registry().get("slow").unwrap().usage_stats.start_count, 1);

    h.runtime.stop("slow").await.unwrap();
    assert_eq!(h.events(), vec!["load:slow", "unload:slow"]);
}

#[tokio::test]
async fn test_failing_gated_on_load_unloads_once() {
    let h = Harness::new();
    h.install("slow", "gated-fail").await;

    let runtime = h.runtime.clone();
    let start = tokio::spawn(async move { runtime.start("slow").await });
    while !h.events().contains(&"load:slow".to_string()) {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        h.runtime.stop("slow").await,
        Err(PluginError::NotLoaded(_))
    ));

    h.gate.notify_one();
    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, PluginError::Hook(_)), "{err}");
    assert_eq!(h.runtime.state("slow"), PluginState::Disabled);
    assert_eq!(h.events(), vec!["load:slow", "unload:slow"]);
}

#[tokio::test]
async fn test_enable_and_disable() {
    let h = Harness::new();
    h.install("clock", "ok").await;

    h.runtime.enable("clock").await.unwrap();
    assert!(h.runtime.registry().get("clock").unwrap().enabled);
    assert_eq!(h.runtime.loaded_ids(), vec!["clock"]);

    h.runtime.disable("clock").await.unwrap();
    assert!(!h.runtime.registry().get("clock").unwrap().enabled);
    assert!(h.runtime.loaded_ids().is_empty());

    // Disabling a stopped plugin only persists the flag.
    h.runtime.disable("clock").await.unwrap();
}

// ─── Updates ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_check_update_skips_unchanged_hash() {
    let h = Harness::new();
    h.runtime.registry().ready().await;
    let mut v1 = manifest("p", "1.0.0");
    v1.content_hash = Some("h1".into());
    h.fetcher.publish(SOURCE, v1, "code-v1");

    let record = h.runtime.install_remote("p", SOURCE, true).await.unwrap();
    assert_eq!(record.code, "code-v1");
    assert_eq!(record.manifest.version, "1.0.0");
    assert!(record.last_updated.is_some());

    assert!(!h.runtime.check_update("p").await.unwrap());
    assert_eq!(h.fetcher.code_fetches.lock().len(), 1);

    let mut v2 = manifest("p", "1.1.0");
    v2.content_hash = Some("h2".into());
    h.fetcher.publish(SOURCE, v2, "code-v2");
    assert!(h.runtime.check_update("p").await.unwrap());
    assert_eq!(h.runtime.registry().get("p").unwrap().code, "code-v2");

    let notified = h.host.notified.lock().clone();
    assert_eq!(notified.last(), Some(&("p".to_string(), "1.1.0".to_string())));
}

#[tokio::test]
async fn test_update_of_running_plugin_fires_on_update() {
    let h = Harness::new();
    h.runtime.registry().ready().await;
    h.fetcher.publish(SOURCE, manifest("p", "1.0.0"), "ok");
    h.runtime.install_remote("p", SOURCE, false).await.unwrap();
    h.runtime.start("p").await.unwrap();

    // Without a content hash every check refetches the code.
    assert!(h.runtime.check_update("p").await.unwrap());
    assert_eq!(h.events(), vec!["load:p", "update:p"]);
    let stats = h.runtime.registry().get("p").unwrap().usage_stats;
    assert_eq!(stats.start_count, 2);
}

#[tokio::test]
async fn test_check_update_errors() {
    let h = Harness::new();
    h.install("local", "ok").await;
    assert!(matches!(
        h.runtime.check_update("local").await,
        Err(PluginError::CannotUpdateLocal(_))
    ));

    h.runtime
        .registry()
        .insert_remote("empty", "", false)
        .unwrap();
    assert!(matches!(
        h.runtime.check_update("empty").await,
        Err(PluginError::MissingSource(_))
    ));
}

#[tokio::test]
async fn test_failed_remote_install_is_rolled_back() {
    let h = Harness::new();
    h.runtime.registry().ready().await;

    let err = h
        .runtime
        .install_remote("gone", "https://ex.example/gone", false)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::UpdateCheck { .. }), "{err}");
    assert!(!h.runtime.registry().contains("gone"));

    assert!(matches!(
        h.runtime.install_remote("Bad Id", SOURCE, false).await,
        Err(PluginError::InvalidId(_))
    ));
}

// ─── Remove / dev plugin / settings ─────────────────────────────────────

#[tokio::test]
async fn test_remove_unloads_and_deletes() {
    let h = Harness::new();
    h.install("clock", "ok").await;
    h.runtime.start("clock").await.unwrap();

    h.runtime.remove("clock").await.unwrap();
    assert_eq!(h.events(), vec!["load:clock", "unload:clock"]);
    assert!(!h.runtime.registry().contains("clock"));
    assert!(matches!(
        h.runtime.remove("clock").await,
        Err(PluginError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_activate_dev_replaces_running_dev_plugin() {
    let h = Harness::new();

    h.runtime
        .activate_dev(manifest("dev", "0.1.0"), "ok")
        .await
        .unwrap();
    h.runtime
        .activate_dev(manifest("dev", "0.2.0"), "ok")
        .await
        .unwrap();

    assert_eq!(
        h.events(),
        vec!["load:dev-plugin", "unload:dev-plugin", "load:dev-plugin"]
    );
    let record = h.runtime.registry().get(DEV_PLUGIN_ID).unwrap();
    assert!(record.enabled);
    assert!(record.origin.is_local());
    assert_eq!(record.manifest.version, "0.2.0");

    let store = h.runtime.plugin_store(DEV_PLUGIN_ID).unwrap();
    assert_eq!(store.get("loads"), Some(json!(2)));

    h.runtime.remove(DEV_PLUGIN_ID).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_settings_hooks() {
    let h = Harness::new();
    h.install("plain", "ok").await;
    h.install("tuned", "with-settings").await;

    assert!(matches!(
        h.runtime.settings_changed("plain", &json!({})).await,
        Err(PluginError::NotLoaded(_))
    ));

    h.runtime.start("plain").await.unwrap();
    h.runtime.start("tuned").await.unwrap();

    h.runtime
        .settings_changed("plain", &json!({"interval": 5}))
        .await
        .unwrap();
    let store = h.runtime.plugin_store("plain").unwrap();
    assert_eq!(store.get("settings"), Some(json!({"interval": 5})));

    assert!(!h.runtime.open_settings("plain").unwrap());
    assert!(h.runtime.open_settings("tuned").unwrap());
    let shown = h.host.settings_shown.lock().clone();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].0, "tuned");
}

// ─── Startup / shutdown ─────────────────────────────────────────────────

#[tokio::test]
async fn test_start_all_isolates_failures_and_survives_restart() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let h = Harness::with_backend(Arc::new(MemoryBackend::new()), fetcher.clone());
    let registry = h.runtime.registry();
    registry.ready().await;

    h.install("a", "ok").await;
    h.install("b", "fail-eval").await;
    h.install("c", "ok").await;
    h.install("idle", "ok").await;
    for id in ["a", "b", "c"] {
        registry.update(id, |r| r.enabled = true).unwrap();
    }

    fetcher.publish(SOURCE, manifest("p", "1.0.0"), "ok");
    h.runtime.install_remote("p", SOURCE, true).await.unwrap();
    registry.update("p", |r| r.enabled = true).unwrap();
    fetcher.take_down(SOURCE);

    let stop = h.runtime.start_all().await.unwrap();
    assert_eq!(h.runtime.loaded_ids(), vec!["a", "c", "p"]);
    assert!(registry.get("p").unwrap().last_error.is_some());
    assert!(!registry.get("b").unwrap().enabled);

    stop.stop_all().await;
    assert!(h.runtime.loaded_ids().is_empty());
    assert!(registry.get("a").unwrap().enabled, "enabled intent kept");
    for id in ["a", "c", "p"] {
        h.runtime.plugin_store(id).unwrap().flush().await;
    }

    let restarted = Harness::with_backend(h.backend.clone(), fetcher);
    restarted.runtime.start_all().await.unwrap();
    assert_eq!(restarted.runtime.loaded_ids(), vec!["a", "c", "p"]);
    let store = restarted.runtime.plugin_store("a").unwrap();
    assert_eq!(store.get("loads"), Some(json!(2)));
}

#[tokio::test]
async fn test_start_all_skips_dev_plugin() {
    let h = Harness::new();
    h.runtime
        .activate_dev(manifest("dev", "0.1.0"), "ok")
        .await
        .unwrap();
    h.runtime.stop(DEV_PLUGIN_ID).await.unwrap();
    h.runtime
        .registry()
        .update(DEV_PLUGIN_ID, |r| r.enabled = true)
        .unwrap();

    let stop = h.runtime.start_all().await.unwrap();
    assert!(!h.runtime.is_loaded(DEV_PLUGIN_ID));
    stop.stop_all().await;
}
