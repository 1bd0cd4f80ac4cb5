mod common;

use anyhow::{Context, Result};
use reqwest::blocking::Client;

use common::act;

#[test]
fn directory_and_store_survive_a_restart() -> Result<()> {
    let cloud_dir = tempfile::tempdir()?;
    let client = Client::new();

    let file_id = {
        let server = common::spawn_in(cloud_dir.path(), &[])?;

        act(
            &client,
            &server.private_url,
            "user.add",
            &[("executor", "root"), ("resource-name", "alice")],
            Vec::new(),
        )?;

        let response = act(
            &client,
            &server.private_url,
            "file.upload",
            &[("executor", "root"), ("resource-name", "kept.txt")],
            b"survives".to_vec(),
        )?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let info: serde_json::Value = response.json()?;
        info["id"].as_str().context("file id")?.to_string()
        // ServerGuard kills the process on drop; the index and the users
        // file were already written by the mutations above.
    };

    let server = common::spawn_in(cloud_dir.path(), &[])?;

    let response = act(
        &client,
        &server.private_url,
        "user.info",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = act(
        &client,
        &server.private_url,
        "file.download",
        &[("executor", "alice"), ("resource-id", &file_id)],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes()?.as_ref(), b"survives");

    let response = act(
        &client,
        &server.private_url,
        "file.info",
        &[("executor", "root"), ("resource-id", &file_id)],
        Vec::new(),
    )?;
    let info: serde_json::Value = response.json()?;
    assert_eq!(info["path"], "kept.txt");
    assert_eq!(info["size"], 8);
    Ok(())
}

#[test]
fn catalog_policy_changes_survive_a_restart() -> Result<()> {
    let cloud_dir = tempfile::tempdir()?;
    let client = Client::new();

    {
        let server = common::spawn_in(cloud_dir.path(), &[])?;
        let response = act(
            &client,
            &server.private_url,
            "action.update-access-mode",
            &[("executor", "root"), ("resource-name", "test")],
            serde_json::to_vec(&serde_json::json!({"user": 4, "group": 4, "other": 0}))?,
        )?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    let server = common::spawn_in(cloud_dir.path(), &[])?;
    // The tightened policy is still in force: anonymous test is refused.
    let response = act(&client, &server.public_url, "test", &[], Vec::new())?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    Ok(())
}
