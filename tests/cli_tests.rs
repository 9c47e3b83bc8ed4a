use anyhow::{Result, bail};
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

fn run_mrt(args: &[&str]) -> Result<String> {
    let output = Command::new(env!("CARGO_BIN_EXE_mrt"))
        .args(args)
        .env_remove("MRT_CONSERVATIVE_STACK")
        .output()?;
    if !output.status.success() {
        bail!(
            "Failed to execute mrt with: {:?}\n{}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8(output.stdout)?)
}

fn frame_names(json: &serde_json::Value) -> Vec<Option<String>> {
    json["frames"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["method"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn walk_blocked_thread() -> Result<()> {
    let stdout = run_mrt(&["walk", "tests/scenarios/pinvoke.toml"])?;
    let run = stdout.find("#0 Run").expect("no `Run` frame");
    let main = stdout.find("#1 Main").expect("no `Main` frame");
    assert!(run < main);
    assert!(stdout.contains("interior"), "{stdout}");
    Ok(())
}

#[test]
fn walk_blocked_thread_as_json() -> Result<()> {
    let stdout = run_mrt(&["walk", "--json", "tests/scenarios/pinvoke.toml"])?;
    let json: serde_json::Value = serde_json::from_str(&stdout)?;
    assert_eq!(json["seed"], "pinvoke");
    assert_eq!(
        frame_names(&json),
        [Some("Run".to_string()), Some("Main".to_string())]
    );
    assert_eq!(json["roots"].as_array().unwrap().len(), 3);
    assert_eq!(json["conservative-ranges"].as_array().unwrap().len(), 0);
    Ok(())
}

#[test]
fn walk_conservatively() -> Result<()> {
    let stdout = run_mrt(&[
        "walk",
        "--json",
        "--conservative",
        "tests/scenarios/pinvoke.toml",
    ])?;
    let json: serde_json::Value = serde_json::from_str(&stdout)?;
    assert_eq!(json["roots"].as_array().unwrap().len(), 0);
    assert_eq!(json["conservative-ranges"].as_array().unwrap().len(), 1);
    Ok(())
}

#[test]
fn gc_walk_passes_through_the_throw_site() -> Result<()> {
    let stdout = run_mrt(&["walk", "--json", "tests/scenarios/throw.toml"])?;
    let json: serde_json::Value = serde_json::from_str(&stdout)?;
    assert_eq!(
        frame_names(&json),
        [
            Some("Dispatch".to_string()),
            Some("Run".to_string()),
            Some("Main".to_string()),
        ]
    );
    assert_eq!(json["frames"][0]["active"], true);
    // Three frame slots and the exception object.
    assert_eq!(json["roots"].as_array().unwrap().len(), 4);
    Ok(())
}

#[test]
fn dispatch_walk_ends_in_native_code() -> Result<()> {
    let stdout = run_mrt(&[
        "walk",
        "--json",
        "--seed",
        "exception",
        "tests/scenarios/throw.toml",
    ])?;
    let json: serde_json::Value = serde_json::from_str(&stdout)?;
    assert_eq!(
        frame_names(&json),
        [Some("Run".to_string()), Some("Main".to_string()), None]
    );
    assert_eq!(json["frames"][2]["unwound-reverse-pinvoke"], true);
    assert!(json["roots"].as_array().unwrap().is_empty());
    Ok(())
}

#[test]
fn walk_rejects_bad_scenarios() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "[[methods]]\nname = \"Empty\"\nstart = 0x1000\nlen = 0")?;
    let path = file.path().to_str().unwrap();
    assert!(run_mrt(&["walk", path]).is_err(), "shall fail");
    Ok(())
}

#[test]
fn classify_thunk_addresses() -> Result<()> {
    let stdout = run_mrt(&[
        "classify",
        "--scenario",
        "tests/scenarios/pinvoke.toml",
        "0x7f000110",
        "0x7f000010",
        "0x2020",
    ])?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("InThrowSiteThunk"), "{stdout}");
    assert!(lines[1].contains("non-EH thunk"), "{stdout}");
    assert!(lines[2].ends_with("in Run+0x20"), "{stdout}");
    Ok(())
}

#[test]
fn config_from_file() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "conservative-stack-reporting = true\nrwlock-spin-count = 7")?;
    let path = file.path().to_str().unwrap();
    let stdout = run_mrt(&["config", "--no-env", "--file", path])?;
    assert!(stdout.contains("conservative-stack-reporting = true"), "{stdout}");
    assert!(stdout.contains("rwlock-spin-count = 7"), "{stdout}");
    Ok(())
}

#[test]
fn config_rejects_unknown_keys() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "spin = 7")?;
    let path = file.path().to_str().unwrap();
    assert!(run_mrt(&["config", "--file", path]).is_err(), "shall fail");
    Ok(())
}
