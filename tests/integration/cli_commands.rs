use crate::common::*;
use assert_cmd::Command;
use predicates::prelude::*;
use std::time::Duration;

#[test]
fn ps_lists_every_role() {
    let [comfy_port, mini_port, gallery_port] = free_ports(3).try_into().unwrap();
    let setup = TestSetup::new(&format!(
        "COMFY_PORT={comfy_port}\nMINI_PORT={mini_port}\nSMART_GALLERY_PORT={gallery_port}\n"
    ));

    Command::cargo_bin("pocketrig")
        .unwrap()
        .args(["ps", "-f", setup.env_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("ROLE"))
        .stdout(predicate::str::contains("ComfyUI"))
        .stdout(predicate::str::contains("Smart Gallery"))
        .stdout(predicate::str::contains(comfy_port.to_string()))
        .stdout(predicate::str::contains("disabled"));
}

#[test]
fn invalid_port_is_reported() {
    let setup = TestSetup::new("COMFY_PORT=0\n");
    Command::cargo_bin("pocketrig")
        .unwrap()
        .args(["ps", "-f", setup.env_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("COMFY_PORT"));
}

#[test]
fn stop_with_nothing_running() {
    let [comfy_port, mini_port, gallery_port] = free_ports(3).try_into().unwrap();
    let setup = TestSetup::new(&format!(
        "COMFY_PORT={comfy_port}\nMINI_PORT={mini_port}\nSMART_GALLERY_PORT={gallery_port}\n"
    ));
    Command::cargo_bin("pocketrig")
        .unwrap()
        .args(["stop", "-f", setup.env_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing was listening"));
}

#[tokio::test]
async fn stop_reclaims_a_foreign_listener() {
    let [comfy_port, mini_port, gallery_port] = free_ports(3).try_into().unwrap();
    let setup = TestSetup::new(&format!(
        "COMFY_PORT={comfy_port}\nMINI_PORT={mini_port}\nSMART_GALLERY_PORT={gallery_port}\n"
    ));

    let mut squatter = tokio::process::Command::new("python3")
        .args(["-m", "http.server", &mini_port.to_string(), "--bind", "127.0.0.1"])
        .kill_on_drop(true)
        .spawn()
        .expect("python3 is required for this test");
    assert!(wait_for_port(mini_port, Duration::from_secs(10)).await);

    Command::cargo_bin("pocketrig")
        .unwrap()
        .args(["stop", "-f", setup.env_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mini"));

    assert!(wait_for_port_release(mini_port, Duration::from_secs(5)).await);
    let status = tokio::time::timeout(Duration::from_secs(5), squatter.wait())
        .await
        .expect("squatter survived stop")
        .unwrap();
    assert!(!status.success());
}
