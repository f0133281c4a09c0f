use std::path::{Path, PathBuf};

use leadm_adapters::{normalize_items, FixtureScrapeClient, ScrapeClient, ScrapeRequest};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn plombier_lyon_dataset_matches_snapshot() {
    let client = FixtureScrapeClient::from_dir(fixtures_root().join("datasets")).unwrap();
    let run = client
        .run_search(&ScrapeRequest::new("Plombier Lyon", 20, "fr"))
        .await
        .unwrap();
    let items = client.dataset_items(&run.dataset_id).await.unwrap();
    let leads = normalize_items(&items);

    let snapshot = std::fs::read_to_string(fixtures_root().join("snapshots/plombier-lyon.json")).unwrap();
    let expected: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(serde_json::to_value(&leads).unwrap(), expected);
}
