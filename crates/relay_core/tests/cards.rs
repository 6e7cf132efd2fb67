use std::sync::Once;

use pretty_assertions::assert_eq;
use relay_core::{
    DownloadItem, OverviewCard, OverviewCardRegistry, ProgressRecord, ProgressStatus,
    ScrapeSessionStore, SessionKey, StoredCard,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(relay_logging::initialize_for_tests);
}

fn ids(registry: &OverviewCardRegistry) -> Vec<&str> {
    registry.cards().iter().map(|card| card.id.as_str()).collect()
}

fn card<'a>(
    registry: &'a OverviewCardRegistry,
    url: &str,
    is_scrape: bool,
) -> Option<&'a OverviewCard> {
    registry
        .cards()
        .iter()
        .find(|card| card.url == url && card.is_scrape == is_scrape)
}

#[test]
fn upsert_replaces_in_place() {
    init_logging();
    let mut registry = OverviewCardRegistry::new();
    assert!(registry.upsert(OverviewCard::download("1", "https://x/a", "/tmp")));
    assert!(registry.upsert(OverviewCard::download("2", "https://x/b", "/tmp")));
    assert!(!registry.upsert(OverviewCard::download("3", "https://x/a", "/data")));

    assert_eq!(ids(&registry), vec!["3", "2"]);
    assert_eq!(card(&registry, "https://x/a", false).unwrap().destination, "/data");
}

#[test]
fn scrape_and_download_cards_share_a_url() {
    init_logging();
    let mut registry = OverviewCardRegistry::new();
    registry.upsert(OverviewCard::download("d", "https://x/page", "/tmp"));
    registry.upsert(OverviewCard::scrape("s", "https://x/page", "gallery"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn load_repairs_legacy_entries_and_collapses_duplicates() {
    init_logging();
    let stored = vec![
        StoredCard {
            id: Some("old".to_string()),
            input_url: Some("https://x/a".to_string()),
            ..StoredCard::default()
        },
        StoredCard {
            url: Some("https://x/b".to_string()),
            script_name: Some("gallery".to_string()),
            ..StoredCard::default()
        },
        StoredCard {
            id: Some("newer".to_string()),
            url: Some("https://x/a".to_string()),
            status: Some("downloading".to_string()),
            progress: Some(7.0),
            ..StoredCard::default()
        },
        StoredCard::default(),
    ];

    let registry = OverviewCardRegistry::load(stored);

    assert_eq!(ids(&registry), vec!["newer", "scrape:https://x/b"]);
    let a = card(&registry, "https://x/a", false).unwrap();
    assert_eq!(a.status, "downloading");
    assert_eq!(a.progress, 1.0);
    assert_eq!(a.filename, "a");
    assert!(card(&registry, "https://x/b", true).is_some());
}

#[test]
fn stored_cards_accept_camel_case_fields() {
    init_logging();
    let stored: StoredCard = serde_json::from_str(
        r#"{"sourceUrl":"https://x/a","sessionId":"s1","isScrape":false}"#,
    )
    .unwrap();
    let registry = OverviewCardRegistry::load(vec![stored]);
    let card = card(&registry, "https://x/a", false).unwrap();
    assert_eq!(card.session_id.as_deref(), Some("s1"));
    assert_eq!(card.id, "download:https://x/a");
}

#[test]
fn completed_download_cards_are_pruned_but_scrape_cards_stay() {
    init_logging();
    let mut registry = OverviewCardRegistry::new();
    registry.upsert(OverviewCard::download("d", "https://x/a", "/tmp"));
    registry.upsert(OverviewCard::scrape("s", "https://x/a", "gallery"));

    let mut record = ProgressRecord::new("https://x/a");
    record.status = ProgressStatus::Completed;
    record.progress = Some(1.0);
    assert!(registry.apply_progress(&record));

    let removed = registry.prune_completed("https://x/a");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].status, "completed");
    assert_eq!(ids(&registry), vec!["s"]);
}

#[test]
fn remove_returns_what_it_took() {
    init_logging();
    let mut registry = OverviewCardRegistry::new();
    registry.upsert(OverviewCard::download("1", "https://x/a", "/tmp"));
    registry.upsert(OverviewCard::download("2", "https://x/b", "/tmp"));
    registry.bind_session("https://x/a", "s1");

    let bound = |card: &OverviewCard| card.session_id.as_deref() == Some("s1");
    assert_eq!(registry.remove(bound).len(), 1);
    assert_eq!(registry.remove(bound).len(), 0);
    assert_eq!(registry.remove(|card| card.url == "https://x/b").len(), 1);
    assert!(registry.is_empty());
}

#[test]
fn scrape_card_follows_store_label() {
    init_logging();
    let key = SessionKey::new("gallery", "https://x/album");
    let mut store = ScrapeSessionStore::new(false);
    store.begin_run(&key);
    store.finalize(&key, vec![DownloadItem::new("https://cdn/1.jpg")], Some("/dl".to_string()));

    let mut registry = OverviewCardRegistry::new();
    registry.upsert(OverviewCard::scrape("s", key.input_url(), key.script_name()));
    assert!(registry.apply_scrape(key.input_url(), &store.hydrate(&key).unwrap()));

    let card = card(&registry, "https://x/album", true).unwrap();
    assert_eq!(card.status, "Done: 1 item(s)");
    assert_eq!(card.progress, 1.0);
    assert_eq!(card.destination, "/dl");
}

#[test]
fn progress_projection_ignores_unknown_urls() {
    init_logging();
    let mut registry = OverviewCardRegistry::new();
    registry.upsert(OverviewCard::scrape("s", "https://x/none", "gallery"));
    let record = ProgressRecord::new("https://x/none");
    assert!(!registry.apply_progress(&record));
    assert_eq!(card(&registry, "https://x/none", true).unwrap().status, "Starting...");
}
