// tests/orchestrator.rs

//! Install orchestration loop scenarios.

mod common;

use common::{
    Fixture, RecordingServiceControl, ScriptedDownloader, ScriptedInstaller, drain_events, ident,
    request_context,
};
use pakd::download::NoDownloader;
use pakd::orchestrator::{Completed, InstallRequest};
use pakd::session::message::Event;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn installs_local_package() {
    let fixture = Fixture::new();
    fixture.package_with_file(ident("app", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(Arc::new(NoDownloader));

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;

    let completed = orchestrator.install(&ctx, request).await;
    assert_eq!(completed, Completed::Success);
    assert_eq!(fixture.installer.install_order(), vec![ident("app", "1.0.0.0")]);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::Installed { package } if *package == ident("app", "1.0.0.0"))));
}

#[tokio::test]
async fn already_satisfied_request_succeeds_without_installing() {
    let fixture = Fixture::new();
    let app = fixture.registry.get_or_add(ident("app", "1.0.0.0"));
    fixture.mark_installed(app.identity());
    let orchestrator = fixture.orchestrator(Arc::new(NoDownloader));

    let (ctx, mut rx) = request_context();
    let completed = orchestrator
        .install(&ctx, InstallRequest::new(ident("app", "1.0.0.0")))
        .await;

    assert_eq!(completed, Completed::Success);
    assert!(fixture.installer.install_order().is_empty());
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::PackageSatisfiedBy { .. })));
}

#[tokio::test]
async fn downloads_missing_file_then_installs() {
    let fixture = Fixture::new();
    fixture.package_with_remote(ident("app", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(ScriptedDownloader::succeeding());

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;

    let completed = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.install(&ctx, request),
    )
    .await
    .expect("orchestration should terminate");
    assert_eq!(completed, Completed::Success);

    let events = drain_events(&mut rx);
    let remote_file_events = events
        .iter()
        .filter(|e| matches!(e, Event::RequireRemoteFile { .. }))
        .count();
    // At most once per package per request, even across retry iterations.
    assert_eq!(remote_file_events, 1);
    assert!(events.iter().any(|e| matches!(e, Event::Installed { .. })));
}

#[tokio::test]
async fn overall_progress_is_monotonic_across_plan_changes() {
    let fixture = Fixture::new();
    let app = fixture.package_with_remote(ident("app", "1.0.0.0"));
    app.add_dependency(ident("lib", "1.0.0.0"));
    fixture.package_with_remote(ident("lib", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(ScriptedDownloader::succeeding());

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;

    let completed = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.install(&ctx, request),
    )
    .await
    .expect("orchestration should terminate");
    assert_eq!(completed, Completed::Success);

    let mut last = 0u8;
    for event in drain_events(&mut rx) {
        if let Event::InstallingProgress {
            overall_percent, ..
        } = event
        {
            assert!(
                overall_percent >= last,
                "overall progress went backwards: {} -> {}",
                last,
                overall_percent
            );
            last = overall_percent;
        }
    }
    assert!(last > 0);
}

#[tokio::test]
async fn install_order_follows_the_graph() {
    let fixture = Fixture::new();
    let app = fixture.package_with_file(ident("app", "1.0.0.0"));
    app.add_dependency(ident("lib", "1.0.0.0"));
    fixture.package_with_file(ident("lib", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(Arc::new(NoDownloader));

    let (ctx, _rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;

    let completed = orchestrator.install(&ctx, request).await;
    assert_eq!(completed, Completed::Success);
    assert_eq!(
        fixture.installer.install_order(),
        vec![ident("lib", "1.0.0.0"), ident("app", "1.0.0.0")]
    );
}

#[tokio::test]
async fn pretend_reports_the_plan_without_installing() {
    let fixture = Fixture::new();
    fixture.package_with_file(ident("app", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(Arc::new(NoDownloader));

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;
    request.pretend = true;

    let completed = orchestrator.install(&ctx, request).await;
    assert_eq!(completed, Completed::Success);
    assert!(fixture.installer.install_order().is_empty());

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::PackageFound { .. })));
    assert!(!events.iter().any(|e| matches!(e, Event::Installed { .. })));
}

#[tokio::test]
async fn pinned_install_failure_is_fatal() {
    let installer = ScriptedInstaller::failing_for(&[ident("app", "1.0.0.0")]);
    let fixture = Fixture::with_installer(installer);
    fixture.package_with_file(ident("app", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(Arc::new(NoDownloader));

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;

    let completed = orchestrator.install(&ctx, request).await;
    assert_eq!(completed, Completed::Failed);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::FailedInstall { .. })));
}

#[tokio::test]
async fn exhausted_download_fails_with_diagnostics() {
    let fixture = Fixture::new();
    fixture.package_with_remote(ident("app", "1.0.0.0"));
    let orchestrator =
        fixture.orchestrator(ScriptedDownloader::failing_for(&[ident("app", "1.0.0.0")]));

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("app", "1.0.0.0"));
    request.exact = true;

    let completed = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.install(&ctx, request),
    )
    .await
    .expect("orchestration should terminate");
    assert_eq!(completed, Completed::Failed);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::UnableToResolve { reason, .. } if reason.contains("download")
    )));
}

#[tokio::test]
async fn cancellation_terminates_with_canceled() {
    let fixture = Fixture::new();
    fixture.package_with_file(ident("app", "1.0.0.0"));
    let orchestrator = fixture.orchestrator(Arc::new(NoDownloader));

    let (ctx, mut rx) = request_context();
    ctx.cancel_token().cancel();

    let completed = orchestrator
        .install(&ctx, InstallRequest::new(ident("app", "1.0.0.0")))
        .await;
    assert_eq!(completed, Completed::Canceled);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::OperationCanceled)));
}

#[tokio::test]
async fn installing_newer_self_schedules_restart() {
    let fixture = Fixture::new();
    fixture.package_with_file(ident("pakd", "2.0.0.0"));
    let control = Arc::new(RecordingServiceControl::default());
    let orchestrator = fixture
        .orchestrator(Arc::new(NoDownloader))
        .with_own_identity(ident("pakd", "1.0.0.0"))
        .with_service_control(control.clone());

    let (ctx, mut rx) = request_context();
    let mut request = InstallRequest::new(ident("pakd", "2.0.0.0"));
    request.exact = true;

    let completed = orchestrator.install(&ctx, request).await;
    assert_eq!(completed, Completed::RestartRequired);
    assert!(control.restart_scheduled.load(Ordering::SeqCst));

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RestartRequired { active_version } if *active_version == ident("pakd", "2.0.0.0")
    )));
}
