//! HTTP-level tests: the router served on an ephemeral port, backed by the
//! scripted calibredb.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use calibre_rest::server::build_router;
use common::{books_json, FakeCalibre};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Serve `fake`'s library and return its base URL.
async fn spawn_server(fake: &FakeCalibre) -> String {
    let app = build_router(Arc::new(fake.library()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health() {
    let fake = FakeCalibre::new();
    let base = spawn_server(&fake).await;

    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["calibre_version"], "7.2.0");
}

#[tokio::test]
async fn test_list_books_paginates() {
    let fake = FakeCalibre::new();
    let books: Vec<(u64, &str)> = vec![(1, "A"), (2, "B"), (3, "C"), (4, "D"), (5, "E")];
    fake.respond("list", &books_json(&books), "", 0);
    let base = spawn_server(&fake).await;

    let resp = reqwest::get(format!("{}/books?start=4&limit=3&sort=title", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();

    let ids: Vec<u64> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![4, 5]);
    assert_eq!(body["metadata"]["count"], 5);
    assert_eq!(body["metadata"]["next"], "");
    assert_eq!(body["metadata"]["prev"], "/books?start=1&limit=3&sort=title");
    assert_eq!(body["metadata"]["self"], "/books?start=4&limit=3&sort=title");
}

#[tokio::test]
async fn test_list_books_empty_and_out_of_range() {
    let fake = FakeCalibre::new();
    fake.respond("list", "[]", "", 0);
    let base = spawn_server(&fake).await;

    let resp = reqwest::get(format!("{}/books", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    fake.respond("list", &books_json(&[(1, "A")]), "", 0);
    let resp = reqwest::get(format!("{}/books?start=5", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = reqwest::get(format!("{}/books?limit=abc", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_book() {
    let fake = FakeCalibre::new();
    fake.respond("list", &books_json(&[(1, "Dune")]), "", 0);
    let base = spawn_server(&fake).await;

    let resp = reqwest::get(format!("{}/books/1", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["books"]["title"], "Dune");

    let resp = reqwest::get(format!("{}/books/0", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    fake.respond("list", "[]", "", 0);
    let resp = reqwest::get(format!("{}/books/2", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_add_empty() {
    let fake = FakeCalibre::new();
    fake.respond("add", "Added book ids: 7\n", "", 0);
    let base = spawn_server(&fake).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/books/empty", base))
        .json(&json!({"title": "Dune", "automerge": "new_record"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["added_ids"], json!([7]));
    assert!(fake.calls()[0].ends_with("add --empty --automerge=new_record --title Dune"));

    let resp = client
        .post(format!("{}/books/empty", base))
        .json(&json!({"title": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = client
        .post(format!("{}/books/empty", base))
        .header("content-type", "application/xml")
        .body("<book/>")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_add_duplicate_is_409() {
    let fake = FakeCalibre::new();
    fake.respond(
        "add",
        "dune.epub\n",
        "The following books were not added as they already exist in the database",
        0,
    );
    let base = spawn_server(&fake).await;

    let form = Form::new().part(
        "file",
        Part::bytes(b"epub bytes".to_vec()).file_name("dune.epub"),
    );
    let resp = reqwest::Client::new()
        .post(format!("{}/books", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn test_add_book_upload() {
    let fake = FakeCalibre::new();
    fake.respond("add", "Added book ids: 12\n", "", 0);
    let base = spawn_server(&fake).await;
    let client = reqwest::Client::new();

    let form = Form::new()
        .part(
            "file",
            Part::bytes(b"epub bytes".to_vec()).file_name("dune.epub"),
        )
        .text("data", r#"{"title": "Dune", "tags": ["scifi"]}"#);
    let resp = client
        .post(format!("{}/books", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let call = &fake.calls()[0];
    assert!(call.contains("dune.epub --automerge=ignore --tags scifi --title Dune"));

    let form = Form::new().text("data", r#"{"title": "Dune"}"#);
    let resp = client
        .post(format!("{}/books", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let form = Form::new().part(
        "file",
        Part::bytes(b"#!/bin/sh".to_vec()).file_name("run.sh"),
    );
    let resp = client
        .post(format!("{}/books", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_and_delete() {
    let fake = FakeCalibre::new();
    fake.respond("list", &books_json(&[(1, "Dune")]), "", 0);
    let base = spawn_server(&fake).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{}/books/1", base))
        .json(&json!({"rating": 8}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(fake
        .calls()
        .iter()
        .any(|c| c.ends_with("set_metadata 1 --field rating:8.0")));

    let resp = client
        .put(format!("{}/books/1", base))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Still listed after remove.
    let resp = client
        .delete(format!("{}/books/1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    fake.respond("list", "[]", "", 0);
    let resp = client
        .delete(format!("{}/books/1?permanent=true", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(fake.calls().iter().any(|c| c.ends_with("remove 1 --permanent")));
}

#[tokio::test]
async fn test_library_busy_is_503() {
    let fake = FakeCalibre::new();
    fake.respond(
        "list",
        "",
        "Another calibre program such as calibre-server is running.",
        1,
    );
    let base = spawn_server(&fake).await;

    let resp = reqwest::get(format!("{}/books", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "library_busy");
}

#[tokio::test]
async fn test_export_download() {
    let fake = FakeCalibre::new();
    let base = spawn_server(&fake).await;

    let resp = reqwest::get(format!("{}/export/1", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let disposition = resp
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("Dune_-_Frank_Herbert.epub"));
    assert_eq!(resp.text().await.unwrap(), "book bytes\n");
}

#[tokio::test]
async fn test_uploads_with_colliding_names_stay_distinct() {
    let fake = FakeCalibre::new();
    fake.respond("add", "Added book ids: 3, 4\n", "", 0);
    let base = spawn_server(&fake).await;

    let form = Form::new()
        .part("file", Part::bytes(b"first".to_vec()).file_name("a b.epub"))
        .part("file", Part::bytes(b"second".to_vec()).file_name("a_b.epub"));
    let resp = reqwest::Client::new()
        .post(format!("{}/books", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let call = &fake.calls()[0];
    let paths: Vec<&str> = call
        .split(' ')
        .filter(|arg| arg.ends_with("a_b.epub"))
        .collect();
    assert_eq!(paths.len(), 2);
    assert_ne!(paths[0], paths[1]);
}
