use std::path::PathBuf;
#[cfg(unix)]
use std::io::Write;
#[cfg(unix)]
use std::process::{Command, Stdio};

const FIXTURE: &str = "tests/fixtures/mock-app-server.sh";

#[test]
fn fixture_script_exists() {
    assert!(PathBuf::from(FIXTURE).exists());
}

#[cfg(unix)]
#[test]
fn fixture_script_reports_version() {
    let output = Command::new("bash")
        .arg(FIXTURE)
        .arg("--version")
        .output()
        .expect("run app-server fixture");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "mock-app-server 1.0.0");
}

#[cfg(unix)]
#[test]
fn fixture_script_speaks_line_delimited_json_rpc() {
    let mut child = Command::new("bash")
        .arg(FIXTURE)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn app-server fixture");
    {
        let stdin = child.stdin.as_mut().expect("stdin");
        stdin
            .write_all(b"{\"id\":1,\"method\":\"initialize\",\"params\":{}}\n{\"id\":2,\"method\":\"fail\",\"params\":{}}\n")
            .expect("write requests");
    }
    drop(child.stdin.take());
    let output = child.wait_with_output().expect("fixture output");
    assert!(output.status.success());

    let lines = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json line"))
        .collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], 1);
    assert!(lines[0]["result"].is_object());
    assert_eq!(lines[1]["error"]["code"], -32000);
    assert!(String::from_utf8_lossy(&output.stderr).contains("mock app-server starting"));
}
