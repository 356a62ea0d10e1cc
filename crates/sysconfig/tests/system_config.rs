mod common;

use common::*;
use exitcodes::FailureKind;
use std::path::Path;
use sysconfig::{DaemonPaths, Mode};

fn installed(name: &str) -> std::path::PathBuf {
    Path::new(INSTALL_DIR).join(name)
}

#[test]
fn fresh_machine_fails_check_then_passes_after_apply() {
    let host = FakeHost::fresh();
    let inputs = inputs();

    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::FailedCheck);
    assert_eq!(failure.message(), "access_bpf does not exist");
    assert_eq!(host.mutations(), 0);

    configure(&host, &inputs, Mode::Apply).unwrap();
    configure(&host, &inputs, Mode::Check).unwrap();

    let gid = host.capture_gid().unwrap();
    let server = host.file(installed("capture-server")).unwrap();
    assert_eq!(server.contents, b"capture server v1");
    assert_eq!((server.uid, server.gid, server.mode), (USER_UID, gid, 0o2700));

    let setup = host.file(installed("bpf-setup")).unwrap();
    assert_eq!(setup.contents, b"bpf setup v1");
    assert_eq!((setup.uid, setup.gid, setup.mode), (0, 0, 0o755));

    let devices = host.devices();
    assert_eq!(devices.len(), 9);
    for dev in devices {
        let file = host.file(&dev).unwrap();
        assert_eq!(file.gid, gid, "{}", dev.display());
        assert_eq!(file.mode & 0o040, 0o040, "{}", dev.display());
    }

    let plist = host.file(DaemonPaths::default().plist).unwrap();
    let text = String::from_utf8(plist.contents).unwrap();
    assert!(text.contains("<string>/opt/capture/bpf-setup</string>"));
    assert!(text.contains("<string>/Applications/Capture.app</string>"));
    assert_eq!((plist.uid, plist.gid, plist.mode), (0, 0, 0o644));
}

#[test]
fn installed_system_checks_clean_as_the_user() {
    let host = FakeHost::fresh();
    let inputs = inputs();
    configure(&host, &inputs, Mode::Apply).unwrap();
    host.reset_mutations();

    // Checks run unprivileged, both on their own and after an elevated apply.
    host.act_as(USER_UID);
    configure(&host, &inputs, Mode::Check).unwrap();
    assert_eq!(host.mutations(), 0);

    // A root-only device configurator could be neither compared nor run.
    host.update(installed("bpf-setup"), |f| f.mode = 0o700);
    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::UnexpectedFailure);
    assert!(
        failure.message().starts_with("failed to read /opt/capture/bpf-setup"),
        "{failure}"
    );
}

#[test]
fn unprivileged_apply_fails_without_changes() {
    let host = FakeHost::fresh();
    host.act_as(USER_UID);

    let failure = configure(&host, &inputs(), Mode::Apply).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::UnexpectedFailure);
    assert_eq!(failure.message(), "failed to create access_bpf");
    assert_eq!(host.mutations(), 0);
    assert!(host.capture_gid().is_none());
}

#[test]
fn second_apply_changes_nothing() {
    let host = FakeHost::fresh();
    let inputs = inputs();

    configure(&host, &inputs, Mode::Apply).unwrap();
    assert!(host.mutations() > 0);

    host.reset_mutations();
    configure(&host, &inputs, Mode::Apply).unwrap();
    assert_eq!(host.mutations(), 0);
}

#[test]
fn check_fails_exactly_when_apply_has_work_to_do() {
    let perturbations: Vec<(&str, Box<dyn Fn(&FakeHost)>)> = vec![
        (
            "capture server lost setgid",
            Box::new(|host: &FakeHost| host.update(installed("capture-server"), |f| f.mode = 0o700)),
        ),
        (
            "capture server owned by root",
            Box::new(|host: &FakeHost| host.update(installed("capture-server"), |f| f.uid = 0)),
        ),
        (
            "device configurator group writable",
            Box::new(|host: &FakeHost| host.update(installed("bpf-setup"), |f| f.mode = 0o770)),
        ),
        (
            "device back to default group",
            Box::new(|host: &FakeHost| host.update(device(2), |f| f.gid = 0)),
        ),
        (
            "device not group readable",
            Box::new(|host: &FakeHost| host.update(device(5), |f| f.mode = 0o600)),
        ),
        (
            "daemon registration removed",
            Box::new(|host: &FakeHost| {
                host.lock().files.remove(&DaemonPaths::default().plist);
            }),
        ),
        (
            "capture server removed",
            Box::new(|host: &FakeHost| {
                host.lock().files.remove(&installed("capture-server"));
            }),
        ),
    ];

    for (name, perturb) in perturbations {
        let host = FakeHost::fresh();
        let inputs = inputs();
        configure(&host, &inputs, Mode::Apply).unwrap();
        configure(&host, &inputs, Mode::Check).unwrap();

        perturb(&host);
        let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
        assert_eq!(failure.kind(), FailureKind::FailedCheck, "{name}: {failure}");

        host.reset_mutations();
        configure(&host, &inputs, Mode::Apply).unwrap();
        assert!(host.mutations() > 0, "{name}");
        configure(&host, &inputs, Mode::Check).unwrap();
    }
}

#[test]
fn device_failure_names_the_device() {
    let host = FakeHost::fresh();
    let inputs = inputs();
    configure(&host, &inputs, Mode::Apply).unwrap();

    host.update(device(2), |f| f.gid = 0);
    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.to_string(), "/dev/bpf2 not owned by access_bpf");
}

#[test]
fn outdated_binary_is_reported_only_by_check() {
    let host = FakeHost::fresh();
    let inputs = inputs();
    configure(&host, &inputs, Mode::Apply).unwrap();

    host.update(Path::new(BUNDLE).join("capture-server"), |f| {
        f.contents = b"capture server v2".to_vec();
    });
    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Outdated);
    assert!(failure.message().contains("capture-server"));

    configure(&host, &inputs, Mode::Apply).unwrap();
    configure(&host, &inputs, Mode::Check).unwrap();
    let server = host.file(installed("capture-server")).unwrap();
    assert_eq!(server.contents, b"capture server v2");
    assert_eq!(server.mode, 0o2700);
}

#[test]
fn failed_check_takes_precedence_over_outdated() {
    let host = FakeHost::fresh();
    let inputs = inputs();
    configure(&host, &inputs, Mode::Apply).unwrap();

    host.update(Path::new(BUNDLE).join("bpf-setup"), |f| {
        f.contents = b"bpf setup v2".to_vec();
    });
    host.update(device(0), |f| f.mode = 0o600);

    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::FailedCheck);
}

#[test]
fn silent_setgid_failure_is_detected() {
    let host = FakeHost::fresh();
    host.lock().drop_setgid = true;

    let failure = configure(&host, &inputs(), Mode::Apply).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::UnexpectedFailure);
    assert!(
        failure.message().contains("silent chmod failure"),
        "{failure}"
    );
}

#[test]
fn invalid_inputs_are_bad_input() {
    let host = FakeHost::fresh();

    let mut unknown_user = inputs();
    unknown_user.username = "mallory".into();
    let failure = configure(&host, &unknown_user, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::BadInput);

    let mut missing_sentinel = inputs();
    missing_sentinel.sentinel = "/Applications/Gone.app".into();
    let failure = configure(&host, &missing_sentinel, Mode::Apply).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::BadInput);
    assert!(failure.to_string().contains("sentinel"));

    host.lock()
        .files
        .remove(&Path::new(BUNDLE).join("capture-server"));
    let failure = configure(&host, &inputs(), Mode::Apply).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::BadInput);

    assert_eq!(host.mutations(), 0);
}

#[test]
fn device_configurator_exit_codes_are_classified() {
    let host = FakeHost::fresh();
    let inputs = inputs();
    configure(&host, &inputs, Mode::Apply).unwrap();

    host.lock().device_exit = Some((1, "/dev/bpf7 does not have group read permissions".into()));
    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::FailedCheck);
    assert_eq!(
        failure.message(),
        "/dev/bpf7 does not have group read permissions"
    );

    host.lock().device_exit = Some((139, "segmentation fault".into()));
    let failure = configure(&host, &inputs, Mode::Apply).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::UnexpectedFailure);
    assert!(failure.message().ends_with("segmentation fault"));
}

#[test]
fn rewritten_daemon_registration_is_restored() {
    let host = FakeHost::fresh();
    let inputs = inputs();
    configure(&host, &inputs, Mode::Apply).unwrap();
    let original = host.file(&inputs.daemon.plist).unwrap().contents;

    host.update(&inputs.daemon.plist, |f| f.contents = b"<plist/>".to_vec());
    let failure = configure(&host, &inputs, Mode::Check).unwrap_err();
    assert_eq!(failure.kind(), FailureKind::FailedCheck);
    assert!(failure.message().contains("org.capturehelper.bpf-setup.plist"));

    configure(&host, &inputs, Mode::Apply).unwrap();
    assert_eq!(host.file(&inputs.daemon.plist).unwrap().contents, original);
}
