mod common;

use anyhow::{Context, Result};
use reqwest::blocking::Client;

use common::{act, error_kind};

#[test]
fn users_can_be_added_updated_and_removed() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();
    let base = &server.private_url;

    let response = act(
        &client,
        base,
        "user.add",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let user: serde_json::Value = response.json()?;
    assert_eq!(user["name"], "alice");
    assert_eq!(user["groupNames"], serde_json::json!(["users"]));

    // Duplicate names are rejected.
    let response = act(
        &client,
        base,
        "user.add",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Grow the account into a second group.
    let response = act(
        &client,
        base,
        "group.add",
        &[("executor", "root"), ("resource-name", "staff")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let updated = serde_json::json!({"name": "alice", "groupNames": ["users", "staff"]});
    let response = act(
        &client,
        base,
        "user.update",
        &[("executor", "root"), ("resource-name", "alice")],
        serde_json::to_vec(&updated)?,
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = act(
        &client,
        base,
        "user.info",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    let user: serde_json::Value = response.json()?;
    assert_eq!(user["groupNames"], serde_json::json!(["users", "staff"]));

    let response = act(
        &client,
        base,
        "user.remove",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text()?, "alice");

    let response = act(
        &client,
        base,
        "user.info",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[test]
fn removing_a_group_cascades_to_its_members() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();
    let base = &server.private_url;

    act(
        &client,
        base,
        "group.add",
        &[("executor", "root"), ("resource-name", "g1")],
        Vec::new(),
    )?;
    let u1 = serde_json::json!({"name": "u1", "groupNames": ["users", "g1"]});
    act(
        &client,
        base,
        "user.add",
        &[("executor", "root"), ("resource-name", "u1")],
        Vec::new(),
    )?;
    let response = act(
        &client,
        base,
        "user.update",
        &[("executor", "root"), ("resource-name", "u1")],
        serde_json::to_vec(&u1)?,
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = act(
        &client,
        base,
        "group.remove",
        &[("executor", "root"), ("resource-name", "g1")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = act(
        &client,
        base,
        "user.info",
        &[("executor", "root"), ("resource-name", "u1")],
        Vec::new(),
    )?;
    let user: serde_json::Value = response.json()?;
    assert_eq!(user["groupNames"], serde_json::json!(["users"]));
    Ok(())
}

#[test]
fn anonymous_callers_can_self_register() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();

    let response = act(
        &client,
        &server.public_url,
        "user.register",
        &[("resource-name", "dave")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = act(
        &client,
        &server.private_url,
        "user.info",
        &[("executor", "root"), ("resource-name", "dave")],
        Vec::new(),
    )?;
    let user: serde_json::Value = response.json()?;
    assert_eq!(user["groupNames"], serde_json::json!(["users"]));
    Ok(())
}

#[test]
fn token_authenticates_exactly_once() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();

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
        "user.token.generate",
        &[("executor", "root"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let token: serde_json::Value = response.json()?;
    let content = token["content"].as_str().context("token content")?;

    // First public use of the bearer token succeeds.
    let response = client
        .post(format!("{}/action/test", server.public_url))
        .query(&[("executor", "alice")])
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {content}"))
        .body("hi")
        .send()?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // The token was consumed: the same credential is now rejected.
    let response = client
        .post(format!("{}/action/test", server.public_url))
        .query(&[("executor", "alice")])
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {content}"))
        .body("hi")
        .send()?;
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    Ok(())
}

#[test]
fn token_operations_are_self_or_root_only() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();
    let base = &server.private_url;

    for name in ["alice", "bob"] {
        act(
            &client,
            base,
            "user.add",
            &[("executor", "root"), ("resource-name", name)],
            Vec::new(),
        )?;
    }

    // Alice may not mint tokens for bob, even though the catalog lets her
    // execute the action for herself.
    let response = act(
        &client,
        base,
        "user.token.generate",
        &[("executor", "alice"), ("resource-name", "bob")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert_eq!(error_kind(&response).as_deref(), Some("unauthorized"));

    let response = act(
        &client,
        base,
        "user.token.generate",
        &[("executor", "alice"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let token: serde_json::Value = response.json()?;
    let token_id = token["id"].as_str().context("token id")?.to_string();

    let response = act(
        &client,
        base,
        "user.tokens.list",
        &[("executor", "alice"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    let listing: serde_json::Value = response.json()?;
    assert_eq!(listing["tokens"].as_array().context("tokens")?.len(), 1);

    let response = act(
        &client,
        base,
        "user.tokens.list",
        &[("executor", "bob"), ("resource-name", "alice")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let response = act(
        &client,
        base,
        "user.token.remove",
        &[("executor", "alice"), ("resource-id", &token_id)],
        Vec::new(),
    )?;
    // The resource name is empty here, so only root may remove by id.
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let response = act(
        &client,
        base,
        "user.token.remove",
        &[
            ("executor", "alice"),
            ("resource-name", "alice"),
            ("resource-id", &token_id),
        ],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    Ok(())
}

#[test]
fn group_listing_and_info() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();
    let base = &server.private_url;

    let response = act(
        &client,
        base,
        "group.list",
        &[("executor", "root")],
        Vec::new(),
    )?;
    let listing: serde_json::Value = response.json()?;
    let names: Vec<&str> = listing["groups"]
        .as_array()
        .context("groups")?
        .iter()
        .filter_map(|group| group["name"].as_str())
        .collect();
    for expected in ["root", "users", "guest"] {
        assert!(names.contains(&expected), "{names:?}");
    }

    let response = act(
        &client,
        base,
        "group.info",
        &[("executor", "root"), ("resource-name", "missing")],
        Vec::new(),
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[test]
fn action_catalog_can_be_listed_and_repoliced() -> Result<()> {
    let server = common::spawn_server()?;
    let client = Client::new();
    let base = &server.private_url;

    let response = act(
        &client,
        base,
        "action.list",
        &[("executor", "root")],
        Vec::new(),
    )?;
    let listing: serde_json::Value = response.json()?;
    let actions = listing["actions"].as_array().context("actions")?;
    assert!(actions.iter().any(|action| action["name"] == "file.upload"));

    // Close `test` down to root only, then verify a guest is refused.
    let response = act(
        &client,
        base,
        "action.update-access-mode",
        &[("executor", "root"), ("resource-name", "test")],
        serde_json::to_vec(&serde_json::json!({"user": 4, "group": 4, "other": 0}))?,
    )?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = act(&client, &server.public_url, "test", &[], Vec::new())?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    Ok(())
}
