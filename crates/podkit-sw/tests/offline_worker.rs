//! End-to-end behaviour of the podcast offline worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use bytes::Bytes;
use podkit_common::{try_init_logging, LogConfig, RetryConfig};
use podkit_net::{
    Fetcher, LoaderConfig, NetError, Request, ResourceLoader, Response, ResponseType,
};
use podkit_sw::{
    CacheConfig, CacheStorage, FetchDisposition, PodcastWorker, RuntimeEvent, ServiceWorkerError,
    ServiceWorkerState, WorkerConfig, WorkerEventHandler, WorkerRuntime, WorkerScope,
};
use tempfile::tempdir;
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        let _ = try_init_logging(LogConfig::default().with_filter("podkit_sw=debug"));
    });
}

// ==================== Scripted network ====================

#[derive(Clone)]
enum Route {
    Reply {
        status: u16,
        response_type: ResponseType,
        body: &'static str,
    },
    Stream(Vec<&'static str>),
    Fail,
}

/// In-memory network. Unknown URLs answer 200 `basic` with the URL path as
/// body. Every call is recorded.
#[derive(Default)]
struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());
        let route = self.routes.lock().unwrap().get(&url).cloned();

        match route {
            None => Ok(Response::new(request.url.clone(), 200, ResponseType::Basic)
                .with_body(request.url.path().to_string())),
            Some(Route::Reply {
                status,
                response_type,
                body,
            }) => Ok(Response::new(request.url, status, response_type).with_body(body)),
            Some(Route::Stream(chunks)) => {
                let (tx, rx) = mpsc::channel(chunks.len().max(1));
                for chunk in chunks {
                    tx.try_send(Ok(Bytes::from_static(chunk.as_bytes()))).unwrap();
                }
                drop(tx);
                Ok(Response::new(request.url, 200, ResponseType::Cors).with_stream(rx))
            }
            Some(Route::Fail) => Err(NetError::RequestFailed(format!("{url} unreachable"))),
        }
    }
}

// ==================== Harness ====================

const ORIGIN: &str = "https://podcasts.example/";

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config(generation: &str, manifest: &[&str]) -> WorkerConfig {
    WorkerConfig {
        cache: CacheConfig::new(
            generation,
            manifest.iter().map(|s| s.to_string()).collect(),
        ),
        install_retry: RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            jitter: false,
            ..Default::default()
        },
        ..WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
    }
}

struct Harness {
    worker: Arc<PodcastWorker>,
    runtime: WorkerRuntime,
    events: mpsc::UnboundedReceiver<RuntimeEvent>,
}

fn start(config: WorkerConfig, fetcher: Arc<dyn Fetcher>, caches: CacheStorage) -> Harness {
    init_logging();
    let scope = WorkerScope::new(fetcher).with_caches(caches);
    let clients = Arc::clone(&scope.clients);
    let worker = Arc::new(PodcastWorker::new(config.clone(), scope).unwrap());

    let (runtime, events) = WorkerRuntime::new(
        config.scope_url().unwrap(),
        worker.clone(),
        clients,
        config.install_retry.clone(),
    );
    Harness {
        worker,
        runtime,
        events,
    }
}

async fn fetch_via_worker(harness: &Harness, path: &str) -> Response {
    let request = Request::get(url(path));
    let response = harness.worker.policy().handle_fetch(request).await.unwrap();
    harness.worker.policy().flush_pending_writes().await;
    response
}

// ==================== Install ====================

#[tokio::test]
async fn install_precaches_every_manifest_url() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let manifest = ["/pod/", "/pod/index.html", "/pod/manifest.json"];
    let h = start(config("podcast-pwa-v1", &manifest), fetcher.clone(), CacheStorage::new());

    h.runtime.install(url("/pod/sw.js")).await.unwrap();

    let cache = h.worker.policy().caches().open("podcast-pwa-v1").await;
    let mut expected: Vec<String> = manifest.iter().map(|p| url(p).to_string()).collect();
    expected.sort();
    assert_eq!(cache.keys().await, expected);
    assert_eq!(fetcher.total_calls(), 3);
    assert_eq!(h.runtime.state().await, Some(ServiceWorkerState::Activated));
}

#[tokio::test]
async fn install_is_all_or_nothing() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.route(
        url("/pod/landscape.html").as_str(),
        Route::Reply {
            status: 404,
            response_type: ResponseType::Basic,
            body: "missing",
        },
    );
    let h = start(
        config("v1", &["/pod/", "/pod/landscape.html"]),
        fetcher.clone(),
        CacheStorage::new(),
    );

    let result = h.runtime.install(url("/pod/sw.js")).await;

    assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
    assert!(h.worker.policy().caches().open("v1").await.is_empty().await);
    assert!(h.runtime.active_worker_id().await.is_none());
    // One fetch per manifest entry per attempt.
    assert_eq!(fetcher.calls_to(url("/pod/landscape.html").as_str()), 2);
}

#[tokio::test]
async fn install_rejects_opaque_precache() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.route(
        "https://cdn.example/lib.js",
        Route::Reply {
            status: 0,
            response_type: ResponseType::Opaque,
            body: "",
        },
    );
    let h = start(
        config("v1", &["/pod/", "https://cdn.example/lib.js"]),
        fetcher,
        CacheStorage::new(),
    );

    assert!(h.worker.policy().install().await.is_err());
    assert!(h.worker.policy().caches().open("v1").await.is_empty().await);
}

// ==================== Fetch ====================

#[tokio::test]
async fn cached_request_is_answered_without_network() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let h = start(config("v1", &["/pod/index.html"]), fetcher.clone(), CacheStorage::new());
    h.runtime.install(url("/pod/sw.js")).await.unwrap();
    let before = fetcher.total_calls();

    let response = fetch_via_worker(&h, "/pod/index.html").await;

    assert!(response.from_cache);
    assert_eq!(response.text().await.unwrap(), "/pod/index.html");
    assert_eq!(fetcher.total_calls(), before);
}

#[tokio::test]
async fn first_miss_is_cached_and_second_request_hits() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let h = start(config("v1", &[]), fetcher.clone(), CacheStorage::new());

    let first = fetch_via_worker(&h, "/pod/episodes/12.json").await;
    assert!(!first.from_cache);
    assert_eq!(first.status, 200);

    let second = fetch_via_worker(&h, "/pod/episodes/12.json").await;
    assert!(second.from_cache);
    assert_eq!(second.text().await.unwrap(), "/pod/episodes/12.json");
    assert_eq!(fetcher.calls_to(url("/pod/episodes/12.json").as_str()), 1);
}

#[tokio::test]
async fn uncacheable_responses_are_returned_but_never_stored() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let cases = [
        ("https://podcasts.example/pod/gone", 404, ResponseType::Basic),
        ("https://podcasts.example/pod/partial", 206, ResponseType::Basic),
        ("https://cdn.example/art.png", 0, ResponseType::Opaque),
    ];
    for (u, status, response_type) in cases {
        fetcher.route(
            u,
            Route::Reply {
                status,
                response_type,
                body: "x",
            },
        );
    }
    let h = start(config("v1", &[]), fetcher.clone(), CacheStorage::new());

    for (u, status, response_type) in cases {
        let request = Request::parse(u).unwrap();
        let response = h.worker.policy().handle_fetch(request.clone()).await.unwrap();
        assert_eq!(response.status, status);
        assert_eq!(response.response_type, response_type);
        h.worker.policy().flush_pending_writes().await;
        assert!(h.worker.policy().caches().match_request(&request).await.is_none());
    }
}

#[tokio::test]
async fn network_failure_on_miss_propagates() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.route(url("/pod/offline").as_str(), Route::Fail);
    let h = start(config("v1", &[]), fetcher, CacheStorage::new());

    let result = h
        .worker
        .policy()
        .handle_fetch(Request::get(url("/pod/offline")))
        .await;
    assert!(matches!(result, Err(NetError::RequestFailed(_))));
}

#[tokio::test]
async fn streamed_body_reaches_caller_and_cache() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.route(
        url("/pod/feed.xml").as_str(),
        Route::Stream(vec!["<rss>", "<item/>", "</rss>"]),
    );
    let h = start(config("v1", &[]), fetcher, CacheStorage::new());

    let response = fetch_via_worker(&h, "/pod/feed.xml").await;
    assert_eq!(response.text().await.unwrap(), "<rss><item/></rss>");

    let stored = h
        .worker
        .policy()
        .caches()
        .match_request(&Request::get(url("/pod/feed.xml")))
        .await
        .unwrap();
    assert_eq!(stored.body, b"<rss><item/></rss>");
}

#[tokio::test]
async fn uncontrolled_client_bypasses_worker() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let h = start(config("v1", &[]), fetcher, CacheStorage::new());
    h.runtime.install(url("/pod/sw.js")).await.unwrap();

    let blog = h.runtime.open_client(url("/blog/")).await;
    let player = h.runtime.open_client(url("/pod/")).await;

    let passthrough = h
        .runtime
        .dispatch_fetch(Some(blog.id.as_str()), Request::get(url("/pod/a.json")))
        .await;
    assert!(matches!(passthrough, FetchDisposition::Passthrough(_)));

    let handled = h
        .runtime
        .dispatch_fetch(Some(player.id.as_str()), Request::get(url("/pod/a.json")))
        .await;
    assert!(matches!(handled, FetchDisposition::Handled(Ok(_))));
}

// ==================== Generations ====================

#[tokio::test]
async fn version_bump_deletes_previous_generation() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let caches = CacheStorage::new();

    let v1 = start(config("v1", &["/a", "/b"]), fetcher.clone(), caches.clone());
    v1.runtime.install(url("/pod/sw.js")).await.unwrap();
    assert_eq!(
        caches.open("v1").await.keys().await,
        vec![url("/a").to_string(), url("/b").to_string()]
    );

    let v2 = start(config("v2", &[]), fetcher, caches.clone());
    v2.runtime.install(url("/pod/sw.js")).await.unwrap();

    assert_eq!(caches.keys().await, vec!["v2"]);
    assert!(caches.open("v2").await.is_empty().await);

    // Populated again only through cache misses.
    fetch_via_worker(&v2, "/a").await;
    assert_eq!(caches.open("v2").await.len().await, 1);
}

#[tokio::test]
async fn activate_claims_open_clients() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let mut h = start(config("v1", &[]), fetcher, CacheStorage::new());
    let page = h.runtime.open_client(url("/pod/index.html")).await;

    let id = h.runtime.install(url("/pod/sw.js")).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&RuntimeEvent::ControllerChange {
        client_id: page.id,
        worker_id: id,
    }));
}

#[tokio::test]
async fn generations_survive_restart() {
    let dir = tempdir().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());

    {
        let caches = CacheStorage::open_persistent(dir.path()).await.unwrap();
        let h = start(config("v1", &["/pod/"]), fetcher.clone(), caches);
        h.runtime.install(url("/pod/sw.js")).await.unwrap();
    }

    let caches = CacheStorage::open_persistent(dir.path()).await.unwrap();
    let h = start(config("v1", &["/pod/"]), fetcher.clone(), caches);
    let calls = fetcher.total_calls();
    let response = fetch_via_worker(&h, "/pod/").await;
    assert!(response.from_cache);
    assert_eq!(fetcher.total_calls(), calls);
}

#[tokio::test]
async fn undeletable_generation_does_not_block_activation() {
    let dir = tempdir().unwrap();
    let caches = CacheStorage::open_persistent(dir.path()).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());

    let v1 = start(config("v1", &["/a"]), fetcher.clone(), caches.clone());
    v1.runtime.install(url("/pod/sw.js")).await.unwrap();
    caches.open("stuck").await;
    std::fs::create_dir(dir.path().join("stuck.json")).unwrap();

    let v2 = start(config("v2", &["/b"]), fetcher, caches.clone());
    let id = v2.runtime.install(url("/pod/sw.js")).await.unwrap();

    assert_eq!(v2.runtime.active_worker_id().await, Some(id));
    assert_eq!(v2.runtime.state().await, Some(ServiceWorkerState::Activated));
    assert_eq!(caches.keys().await, vec!["stuck", "v2"]);
    assert!(!dir.path().join("v1.json").exists());
}

// ==================== Push, click, sync ====================

#[tokio::test]
async fn push_without_payload_shows_default_text() {
    let h = start(
        config("v1", &[]),
        Arc::new(ScriptedFetcher::default()),
        CacheStorage::new(),
    );
    h.runtime.install(url("/pod/sw.js")).await.unwrap();

    let shown = h.runtime.dispatch_push(None).await.unwrap();
    assert_eq!(shown.body(), Some("New podcast episode available!"));
    assert_eq!(shown.options.icon.as_deref(), Some("icon-192.png"));
}

#[tokio::test]
async fn notification_click_opens_root_page() {
    let h = start(
        config("v1", &[]),
        Arc::new(ScriptedFetcher::default()),
        CacheStorage::new(),
    );
    h.runtime.install(url("/pod/sw.js")).await.unwrap();

    let shown = h
        .runtime
        .dispatch_push(Some(Bytes::from_static(b"Episode 7: Borrowing")))
        .await
        .unwrap();
    assert_eq!(shown.body(), Some("Episode 7: Borrowing"));

    let client = h
        .runtime
        .dispatch_notification_click(shown, None)
        .await
        .unwrap();
    assert_eq!(client.url, url("/"));
    assert!(client.focused);
    assert!(h.worker.scope().notifications.read().await.is_empty());

    // A second click focuses the same window.
    let again = h.runtime.dispatch_push(None).await.unwrap();
    let focused = h
        .runtime
        .dispatch_notification_click(again, None)
        .await
        .unwrap();
    assert_eq!(focused.id, client.id);
}

#[tokio::test]
async fn sync_runs_collaborator_for_registered_tag() {
    struct FailingSync;

    #[async_trait]
    impl podkit_sw::SyncCollaborator for FailingSync {
        async fn sync(&self, tag: &str) -> podkit_sw::Result<()> {
            Err(ServiceWorkerError::Sync(format!("{tag}: offline")))
        }
    }

    let config = config("v1", &[]);
    let scope = WorkerScope::new(Arc::new(ScriptedFetcher::default()));
    let worker = PodcastWorker::new(config, scope)
        .unwrap()
        .with_sync(Arc::new(FailingSync));

    let other = worker.on_sync(podkit_sw::SyncEvent::new("refresh")).await;
    assert!(other.is_ok());

    let registered = worker.on_sync(podkit_sw::SyncEvent::new("sync-podcasts")).await;
    assert!(matches!(registered, Err(ServiceWorkerError::Sync(_))));
}

// ==================== Real HTTP ====================

#[tokio::test]
async fn full_stack_over_http() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pod/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html>player</html>"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pod/episodes.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let origin = Url::parse(&server.uri()).unwrap();
    let loader = ResourceLoader::new(LoaderConfig::default().with_origin(origin.clone())).unwrap();
    let config = WorkerConfig {
        cache: CacheConfig::new("v1", vec!["/pod/".to_string()]),
        ..WorkerConfig::for_origin(origin.clone())
    };
    let h = start(config, Arc::new(loader), CacheStorage::new());
    h.runtime.install(origin.join("/pod/sw.js").unwrap()).await.unwrap();

    // Precached: served from cache, server sees no second request.
    let page = h
        .worker
        .policy()
        .handle_fetch(Request::get(origin.join("/pod/").unwrap()))
        .await
        .unwrap();
    assert!(page.from_cache);
    assert_eq!(page.content_type, Some(mime::TEXT_HTML));

    // Miss then hit.
    for _ in 0..2 {
        h.worker
            .policy()
            .handle_fetch(Request::get(origin.join("/pod/episodes.json").unwrap()))
            .await
            .unwrap();
        h.worker.policy().flush_pending_writes().await;
    }
}
