use crate::common::*;
use std::time::Duration;
use tokio::process::Command;

const PASSWORD: &str = "letmein";

#[tokio::test]
async fn serve_starts_chain_and_stop_frees_ports() {
    let [comfy_port, mini_port, control_port] = free_ports(3).try_into().unwrap();
    let setup = TestSetup::new("");
    let comfy = setup.launcher("comfy.sh", &http_server(comfy_port));
    let mini = setup.launcher("mini.sh", &http_server(mini_port));
    std::fs::write(
        &setup.env_path,
        format!(
            "LOGIN_PASS={PASSWORD}\n\
             COMFY_PATH={}\nCOMFY_PORT={comfy_port}\n\
             MINI_PATH={}\nMINI_PORT={mini_port}\n\
             CONTROL_PORT={control_port}\n\
             WAIT_FOR_COMFY_SECS=20\n",
            comfy.display(),
            mini.display()
        ),
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_pocketrig"))
        .args(["serve", "-f", setup.env_path.to_str().unwrap()])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start pocketrig");

    assert!(
        wait_for_port(control_port, Duration::from_secs(10)).await,
        "control API did not come up on {control_port}"
    );
    assert!(
        wait_for_port(comfy_port, Duration::from_secs(15)).await,
        "primary never listened on {comfy_port}"
    );
    assert!(
        wait_for_port(mini_port, Duration::from_secs(30)).await,
        "companion was not started after the primary became ready"
    );

    let client = no_redirect_client();
    let base = format!("http://127.0.0.1:{control_port}");
    let (cookie, csrf) = login(&client, &base, PASSWORD).await;

    let status: serde_json::Value = client
        .get(format!("{base}/status"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["comfy"], true);
    assert_eq!(status["mini"], true);
    assert_eq!(status["gallery"], false);

    let net: serde_json::Value = client
        .get(format!("{base}/netinfo"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(net["comfy_port"], comfy_port);
    assert_eq!(net["mini_port"], mini_port);

    let resp = client
        .post(format!("{base}/stop"))
        .header("cookie", &cookie)
        .header("x-csrf-token", &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "success");

    assert!(
        wait_for_port_release(comfy_port, Duration::from_secs(10)).await,
        "primary port {comfy_port} still in use after stop"
    );
    assert!(
        wait_for_port_release(mini_port, Duration::from_secs(10)).await,
        "companion port {mini_port} still in use after stop"
    );

    interrupt(child.id().unwrap());
    tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("pocketrig did not exit in time")
        .expect("failed to wait on pocketrig");
    assert!(wait_for_port_release(control_port, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn skip_launch_serves_without_spawning() {
    let [comfy_port, control_port] = free_ports(2).try_into().unwrap();
    let setup = TestSetup::new("");
    let comfy = setup.launcher("comfy.sh", &http_server(comfy_port));
    std::fs::write(
        &setup.env_path,
        format!(
            "LOGIN_PASS={PASSWORD}\nCOMFY_PATH={}\nCOMFY_PORT={comfy_port}\nCONTROL_PORT={control_port}\n",
            comfy.display()
        ),
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_pocketrig"))
        .args(["-f", setup.env_path.to_str().unwrap(), "serve", "--skip-launch"])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start pocketrig");

    assert!(wait_for_port(control_port, Duration::from_secs(10)).await);
    assert!(
        !wait_for_port(comfy_port, Duration::from_secs(2)).await,
        "primary was launched despite --skip-launch"
    );

    let client = no_redirect_client();
    let base = format!("http://127.0.0.1:{control_port}");

    let resp = client.get(format!("{base}/status")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SEE_OTHER);

    let bad = client
        .post(format!("{base}/login"))
        .form(&[("password", "wrong")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::UNAUTHORIZED);

    let (cookie, csrf) = login(&client, &base, PASSWORD).await;
    let resp = client
        .post(format!("{base}/ensure_comfy"))
        .header("cookie", &cookie)
        .header("x-csrf-token", &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "success");
    assert!(
        wait_for_port(comfy_port, Duration::from_secs(15)).await,
        "ensure_comfy did not launch the primary"
    );

    interrupt(child.id().unwrap());
    tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("pocketrig did not exit in time")
        .expect("failed to wait on pocketrig");

    // Ctrl-C leaves supervised processes running; clean up by port.
    Command::new(env!("CARGO_BIN_EXE_pocketrig"))
        .args(["stop", "-f", setup.env_path.to_str().unwrap()])
        .status()
        .await
        .unwrap();
    assert!(wait_for_port_release(comfy_port, Duration::from_secs(10)).await);
}
