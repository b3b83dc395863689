use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lumos_registry::{content_hash, BrowseQuery, NewApp, Registry, COMMUNITY_TAG};
use lumos_types::{AppEntry, AppType, Capability};

fn remote_entry(code: &str) -> AppEntry {
    AppEntry {
        hash: content_hash(code),
        prompt: "a shared clock".into(),
        normalized_prompt: "shared clock".into(),
        title: "Shared Clock".into(),
        app_type: AppType::Iframe,
        code: code.into(),
        dockerfile: None,
        capabilities: vec![Capability::UiWindow],
        model: "remote-model".into(),
        provider: "remote".into(),
        launches: 999,
        created_at: chrono::Utc::now(),
        tags: vec![],
        spec: None,
        rating: None,
    }
}

#[tokio::test]
async fn community_sync_imports_and_tags_entries() {
    let server = MockServer::start().await;
    let entry = remote_entry("<html>shared</html>");
    let hash = entry.hash.clone();

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![hash.clone()]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/apps/{hash}.json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(&entry))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).await;

    let imported = registry.sync_community(&server.uri()).await;
    assert_eq!(imported, 1);

    let local = registry.get(&hash).await.unwrap();
    assert!(local.tags.iter().any(|t| t == COMMUNITY_TAG));
    // Remote launch counts never inflate local accounting.
    assert_eq!(local.launches, 0);
}

#[tokio::test]
async fn community_sync_skips_known_and_mismatched_entries() {
    let server = MockServer::start().await;
    let known = remote_entry("<html>known</html>");
    let mut forged = remote_entry("<html>forged</html>");
    forged.hash = "0000000000000000".into(); // does not match the code

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(vec![known.hash.clone(), forged.hash.clone()]),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/apps/{}.json", forged.hash)))
        .respond_with(ResponseTemplate::new(200).set_body_json(&forged))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).await;
    registry
        .publish(NewApp {
            prompt: "a clock".into(),
            title: "Clock".into(),
            app_type: AppType::Iframe,
            code: "<html>known</html>".into(),
            dockerfile: None,
            capabilities: vec![],
            model: "m".into(),
            provider: "p".into(),
            tags: vec![],
        })
        .await
        .unwrap();

    let imported = registry.sync_community(&server.uri()).await;
    assert_eq!(imported, 0);
    assert_eq!(registry.browse(BrowseQuery::default()).await.total, 1);
}

#[tokio::test]
async fn unreachable_community_endpoint_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).await;
    let imported = registry.sync_community("http://127.0.0.1:1/nope").await;
    assert_eq!(imported, 0);
}
