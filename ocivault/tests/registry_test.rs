//! Distribution v2 protocol tests against a live in-process registry,
//! driven through ociclient and raw reqwest where header-level control is
//! needed. Token auth is disabled here; the token flow has its own suite.

mod common;

use base64::Engine as _;
use ociclient::{media_type, OciDigest, Reference};
use reqwest::StatusCode;

use common::{push_image, start_basic_server};

#[tokio::test]
async fn api_version_check() {
    let server = start_basic_server().await;
    let client = server.client(None);
    assert!(client.check_api().await.unwrap());
    server.stop();
}

#[tokio::test]
async fn push_pull_roundtrip() {
    let server = start_basic_server().await;
    let client = server.alice();
    let image = push_image(&client, "alice/img", "v1", "roundtrip").await;

    // HEAD by tag advertises the manifest digest.
    let mut session = client.new_session("alice/img");
    let head = session
        .head_manifest(&Reference::Tag("v1".to_string()))
        .await
        .unwrap()
        .expect("manifest should exist");
    assert_eq!(head.digest.unwrap(), image.manifest_digest);
    assert_eq!(
        head.media_type.as_deref(),
        Some(media_type::MANIFEST_OCI)
    );

    // GET returns the exact bytes that were pushed.
    let pull = session
        .get_manifest(&Reference::Tag("v1".to_string()))
        .await
        .unwrap();
    assert_eq!(pull.bytes.to_vec(), image.manifest_bytes);
    assert_eq!(pull.digest.unwrap(), image.manifest_digest);
    assert_eq!(
        OciDigest::sha256_of(&pull.bytes),
        image.manifest_digest
    );

    // The layer comes back byte-identical.
    let blob = session.fetch_blob(&image.layer_digest).await.unwrap();
    assert_eq!(blob.to_vec(), image.layer_bytes);

    // Uploading the same blob twice leaves one stored object.
    let descriptor = session
        .upload_bytes(media_type::REGULAR_BLOB_OCI, &image.layer_bytes)
        .await
        .unwrap();
    assert_eq!(descriptor.digest, image.layer_digest);

    server.stop();
}

#[tokio::test]
async fn chunked_upload_finalizes_to_the_declared_digest() {
    let server = start_basic_server().await;
    let client = server.alice();
    let mut session = client.new_session("alice/img");

    let content: Vec<u8> = (0..1000u32).flat_map(|i| i.to_le_bytes()).collect();
    let descriptor = session
        .upload_chunked(media_type::REGULAR_BLOB_OCI, &content, 256)
        .await
        .unwrap();
    assert_eq!(descriptor.digest, OciDigest::sha256_of(&content));

    let fetched = session.fetch_blob(&descriptor.digest).await.unwrap();
    assert_eq!(fetched.to_vec(), content);
    server.stop();
}

#[tokio::test]
async fn discontiguous_chunk_returns_416_with_range_invalid() {
    let server = start_basic_server().await;
    // Open an upload and confirm a contiguous first chunk.
    let http = reqwest::Client::new();
    let authorization = format!("Basic {}", base64_encode("alice:wonderland"));
    let open = http
        .post(format!("{}/v2/alice/img/blobs/uploads/", server.url))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(open.status(), StatusCode::ACCEPTED);
    let location = open.headers()["location"].to_str().unwrap().to_string();
    let upload_url = format!("{}{}", server.url, location);

    let patch = http
        .patch(&upload_url)
        .header("Authorization", &authorization)
        .header("Content-Range", "0-49")
        .header("Content-Length", 50)
        .body(vec![1u8; 50])
        .send()
        .await
        .unwrap();
    assert_eq!(patch.status(), StatusCode::ACCEPTED);
    assert_eq!(patch.headers()["range"].to_str().unwrap(), "0-49");

    // A gap in the range must be refused.
    let gap = http
        .patch(&upload_url)
        .header("Authorization", &authorization)
        .header("Content-Range", "100-199")
        .header("Content-Length", 100)
        .body(vec![2u8; 100])
        .send()
        .await
        .unwrap();
    assert_eq!(gap.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    let body: serde_json::Value = gap.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "RANGE_INVALID");
    server.stop();
}

#[tokio::test]
async fn upload_status_and_cancel() {
    let server = start_basic_server().await;
    let http = reqwest::Client::new();
    let authorization = format!("Basic {}", base64_encode("alice:wonderland"));

    let open = http
        .post(format!("{}/v2/alice/img/blobs/uploads/", server.url))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    let uuid = open.headers()["docker-upload-uuid"].to_str().unwrap().to_string();
    let upload_url = format!(
        "{}{}",
        server.url,
        open.headers()["location"].to_str().unwrap()
    );

    http.patch(&upload_url)
        .header("Authorization", &authorization)
        .header("Content-Range", "0-9")
        .header("Content-Length", 10)
        .body(vec![0u8; 10])
        .send()
        .await
        .unwrap();

    let status = http
        .get(&upload_url)
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::NO_CONTENT);
    assert_eq!(status.headers()["range"].to_str().unwrap(), "0-9");
    assert_eq!(
        status.headers()["docker-upload-uuid"].to_str().unwrap(),
        uuid
    );

    let canceled = http
        .delete(&upload_url)
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(canceled.status(), StatusCode::NO_CONTENT);

    // The upload is gone.
    let gone = http
        .get(&upload_url)
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    server.stop();
}

#[tokio::test]
async fn finalize_with_wrong_digest_is_rejected() {
    let server = start_basic_server().await;
    let http = reqwest::Client::new();
    let authorization = format!("Basic {}", base64_encode("alice:wonderland"));

    let open = http
        .post(format!("{}/v2/alice/img/blobs/uploads/", server.url))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    let upload_url = format!(
        "{}{}",
        server.url,
        open.headers()["location"].to_str().unwrap()
    );

    let bogus = OciDigest::sha256_of(b"something else entirely");
    let finalize = http
        .put(format!("{upload_url}?digest={bogus}"))
        .header("Authorization", &authorization)
        .body(b"actual content".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(finalize.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = finalize.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");
    server.stop();
}

#[tokio::test]
async fn cross_repository_mount() {
    let server = start_basic_server().await;
    let client = server.alice();
    let image = push_image(&client, "alice/img", "v1", "mount").await;

    // Mount into a second repository without re-uploading bytes.
    let mut session = client.new_session("alice/img2");
    let mounted = session
        .mount_blob(&image.layer_digest, "alice/img")
        .await
        .unwrap();
    assert!(mounted, "mount should short-circuit the upload");

    let blob = session.fetch_blob(&image.layer_digest).await.unwrap();
    assert_eq!(blob.to_vec(), image.layer_bytes);

    // The destination repository version references the blob.
    let (_, _, version) = server.state.registry.resolve("alice/img2").await.unwrap();
    assert!(version.contains_blob(&image.layer_digest));

    // A digest the source repository does not hold falls back to a
    // regular upload session.
    let missing = OciDigest::sha256_of(b"never uploaded");
    let fallback = session.mount_blob(&missing, "alice/img").await.unwrap();
    assert!(!fallback, "missing blob must open a normal upload");

    server.stop();
}

#[tokio::test]
async fn manifest_list_push_and_pull() {
    let server = start_basic_server().await;
    let client = server.alice();
    let first = push_image(&client, "alice/multi", "amd64", "list-a").await;
    let second = push_image(&client, "alice/multi", "arm64", "list-b").await;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::INDEX_OCI,
        "manifests": [
            {
                "mediaType": media_type::MANIFEST_OCI,
                "digest": first.manifest_digest.to_string(),
                "size": first.manifest_bytes.len(),
                "platform": {"architecture": "amd64", "os": "linux"},
            },
            {
                "mediaType": media_type::MANIFEST_OCI,
                "digest": second.manifest_digest.to_string(),
                "size": second.manifest_bytes.len(),
                "platform": {"architecture": "arm64", "os": "linux"},
            },
        ],
    })
    .to_string();

    let mut session = client.new_session("alice/multi");
    let list_digest = session
        .put_manifest(
            &Reference::Tag("latest".to_string()),
            media_type::INDEX_OCI,
            bytes::Bytes::from(index.clone()),
        )
        .await
        .unwrap();
    assert_eq!(list_digest, OciDigest::sha256_of(index.as_bytes()));

    let pull = session
        .get_manifest(&Reference::Tag("latest".to_string()))
        .await
        .unwrap();
    assert_eq!(
        pull.media_type.as_deref(),
        Some(media_type::INDEX_OCI)
    );

    // The version holds the closure: list, both images, all blobs.
    let (_, _, version) = server.state.registry.resolve("alice/multi").await.unwrap();
    assert!(version.contains_manifest(&list_digest));
    assert!(version.contains_manifest(&first.manifest_digest));
    assert!(version.contains_blob(&second.layer_digest));

    server.stop();
}

#[tokio::test]
async fn index_listing_unknown_manifests_is_rejected() {
    let server = start_basic_server().await;
    let client = server.alice();
    push_image(&client, "alice/img", "v1", "seed").await;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::INDEX_OCI,
        "manifests": [{
            "mediaType": media_type::MANIFEST_OCI,
            "digest": OciDigest::sha256_of(b"not pushed").to_string(),
            "size": 2,
        }],
    })
    .to_string();

    let mut session = client.new_session("alice/img");
    let err = session
        .put_manifest(
            &Reference::Tag("broken".to_string()),
            media_type::INDEX_OCI,
            bytes::Bytes::from(index),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ociclient::ClientError::Status { status, .. } if status == StatusCode::BAD_REQUEST
    ));
    server.stop();
}

#[tokio::test]
async fn content_negotiation_rejects_unacceptable_schemas() {
    let server = start_basic_server().await;
    let client = server.alice();
    push_image(&client, "alice/img", "v1", "negotiate").await;

    // The stored manifest is OCI; a client that only accepts Docker v2s1
    // gets a 404, no conversion is attempted.
    let http = reqwest::Client::new();
    let response = http
        .get(format!("{}/v2/alice/img/manifests/v1", server.url))
        .header("Accept", media_type::MANIFEST_V1)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");

    // No Accept header serves the stored form.
    let response = http
        .get(format!("{}/v2/alice/img/manifests/v1", server.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        media_type::MANIFEST_OCI
    );
    server.stop();
}

#[tokio::test]
async fn tag_overwrite_replaces_the_binding() {
    let server = start_basic_server().await;
    let client = server.alice();
    let first = push_image(&client, "alice/img", "v1", "one").await;
    let second = push_image(&client, "alice/img", "v1", "two").await;
    assert_ne!(first.manifest_digest, second.manifest_digest);

    let mut session = client.new_session("alice/img");
    let head = session
        .head_manifest(&Reference::Tag("v1".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.digest.unwrap(), second.manifest_digest);

    let tags = session.list_tags().await.unwrap();
    assert_eq!(tags, vec!["v1".to_string()]);
    server.stop();
}

#[tokio::test]
async fn manifest_delete_creates_a_new_version_without_the_tag() {
    let server = start_basic_server().await;
    let client = server.alice();
    push_image(&client, "alice/img", "v1", "keep").await;
    let doomed = push_image(&client, "alice/img", "v2", "doomed").await;

    let mut session = client.new_session("alice/img");
    session
        .delete_manifest(&Reference::Tag("v2".to_string()))
        .await
        .unwrap();

    let tags = session.list_tags().await.unwrap();
    assert_eq!(tags, vec!["v1".to_string()]);
    assert!(session
        .head_manifest(&Reference::Digest(doomed.manifest_digest.clone()))
        .await
        .unwrap()
        .is_none());

    // Version numbers only ever grow.
    let (_, repository, version) = server.state.registry.resolve("alice/img").await.unwrap();
    assert!(version.number >= 2);
    assert_eq!(repository.latest_version, version.number);
    server.stop();
}

#[tokio::test]
async fn catalog_and_tag_pagination() {
    let server = start_basic_server().await;
    let client = server.alice();
    push_image(&client, "alice/img", "a", "pg1").await;
    push_image(&client, "alice/img", "b", "pg2").await;
    push_image(&client, "alice/img", "c", "pg3").await;
    push_image(&client, "alice/other", "x", "pg4").await;

    let repositories = client.list_repositories().await.unwrap();
    assert!(repositories.contains(&"alice/img".to_string()));
    assert!(repositories.contains(&"alice/other".to_string()));

    // Page through tags two at a time; the Link header carries the cursor.
    let http = reqwest::Client::new();
    let page = http
        .get(format!("{}/v2/alice/img/tags/list?n=2", server.url))
        .send()
        .await
        .unwrap();
    let link = page.headers()["link"].to_str().unwrap().to_string();
    assert!(link.contains("last=b"));
    let body: serde_json::Value = page.json().await.unwrap();
    assert_eq!(body["tags"], serde_json::json!(["a", "b"]));

    let page = http
        .get(format!("{}/v2/alice/img/tags/list?n=2&last=b", server.url))
        .send()
        .await
        .unwrap();
    assert!(page.headers().get("link").is_none());
    let body: serde_json::Value = page.json().await.unwrap();
    assert_eq!(body["tags"], serde_json::json!(["c"]));

    server.stop();
}

#[tokio::test]
async fn anonymous_push_is_denied() {
    let server = start_basic_server().await;
    let anonymous = server.client(None);
    let mut session = anonymous.new_session("alice/img");
    let err = session
        .upload_bytes(media_type::REGULAR_BLOB_OCI, b"nope")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ociclient::ClientError::Status { status, .. } if status == StatusCode::FORBIDDEN
    ));
    server.stop();
}

#[tokio::test]
async fn signature_extension_roundtrip() {
    let server = start_basic_server().await;
    let client = server.alice();
    let image = push_image(&client, "alice/img", "v1", "signed").await;

    let payload = serde_json::json!({
        "critical": {
            "type": "atomic container signature",
            "image": {"docker-manifest-digest": image.manifest_digest.to_string()},
            "identity": {"docker-reference": "localhost/alice/img:v1"},
        },
        "optional": {"creator": "tester"},
    })
    .to_string();

    let mut session = client.new_session("alice/img");
    session
        .put_signature(&image.manifest_digest, bytes::Bytes::from(payload.clone()))
        .await
        .unwrap();

    let list = session.get_signatures(&image.manifest_digest).await.unwrap();
    assert_eq!(list.signatures.len(), 1);
    assert_eq!(list.signatures[0].signature_type, "atomic");
    assert_eq!(
        base64_decode(&list.signatures[0].content),
        payload.into_bytes()
    );

    // A payload signing a different digest is rejected.
    let wrong = serde_json::json!({
        "critical": {
            "type": "atomic container signature",
            "image": {"docker-manifest-digest": OciDigest::sha256_of(b"other").to_string()},
            "identity": {"docker-reference": "localhost/alice/img:v1"},
        },
    })
    .to_string();
    let err = session
        .put_signature(&image.manifest_digest, bytes::Bytes::from(wrong))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ociclient::ClientError::Status { status, .. } if status == StatusCode::BAD_REQUEST
    ));
    server.stop();
}

#[tokio::test]
async fn external_signer_attaches_a_signature() {
    let server = start_token_disabled_with_signer().await;
    let client = server.alice();
    let image = push_image(&client, "alice/img", "v1", "ext-sign").await;

    server
        .state
        .sign_tagged_manifest("alice/img", "v1")
        .await
        .unwrap();

    let mut session = client.new_session("alice/img");
    let list = session.get_signatures(&image.manifest_digest).await.unwrap();
    assert_eq!(list.signatures.len(), 1);
    assert_eq!(list.signatures[0].signature_type, "atomic");
    server.stop();
}

async fn start_token_disabled_with_signer() -> common::TestServer {
    common::start_server(|config| {
        config.token.auth_disabled = true;
        config.signing.script_path = Some(common::fixture("test-signer.sh"));
    })
    .await
}

#[tokio::test]
async fn orphan_reclaim_drops_unreferenced_content() {
    let server = start_basic_server().await;
    let client = server.alice();
    let image = push_image(&client, "alice/img", "v1", "reclaim").await;

    // Still referenced by the version chain: nothing to reclaim.
    let removed = server.state.reclaim_orphans().await.unwrap();
    assert_eq!(removed, 0);

    let mut session = client.new_session("alice/img");
    session
        .delete_manifest(&Reference::Tag("v1".to_string()))
        .await
        .unwrap();

    // Older versions still reference the content; nothing is deleted until
    // the history is pruned.
    server
        .state
        .registry
        .update_repository("alice/img", |repo| repo.prune_versions())
        .await
        .unwrap();
    let removed = server.state.reclaim_orphans().await.unwrap();
    assert!(removed > 0);
    assert!(!server.state.store.exists(&image.layer_digest).await.unwrap());
    server.stop();
}

fn base64_encode(input: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(input)
}

fn base64_decode(input: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD.decode(input).unwrap()
}
