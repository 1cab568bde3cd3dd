use super::*;
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::BodyExt;
use neopkg_backend::BackendStatus;
use neopkg_core::{PackageCache, PkgError};
use neopkg_registry::{Catalog, RosterSource};
use neopkg_resolver::GithubClient;
use serde_json::{json, Value};
use crate::static_files::{content_type, read_file, safe_relative_path, write_file};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-secret";
const VIEWER_TOKEN: &str = "viewer-secret";

const BACKEND_YML: &str = "start:\n  - run: echo $$ > backend.pid; exec sleep 30\nstop:\n  - run: sleep 1; kill $(cat backend.pid)\n";

#[test]
fn config_defaults_apply_to_empty_file() {
    let config = ServerConfig::from_toml_str("").expect("empty config must parse");
    assert_eq!(config, ServerConfig::default());
    assert_eq!(config.listen, "127.0.0.1:5680");
    assert_eq!(config.request_timeout(), Duration::from_secs(10));
    assert_eq!(config.operation_timeout(), Duration::from_secs(600));
    assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
    assert!(!config.rosters.is_empty());
    assert!(config.auth.tokens.is_empty());
}

#[test]
fn config_parses_rosters_env_and_tokens() {
    let digest = TokenAuth::digest(ADMIN_TOKEN);
    let input = format!(
        r#"
listen = "0.0.0.0:8080"
meta_dir = "/srv/neopkg/meta"
cache_ttl_secs = 60
sync_on_start = true

[env]
NEOPKG_DATA = "/srv/data"

[[rosters]]
name = "central"
url = "https://example.invalid/central.git"

[[rosters]]
name = "extra"
url = "https://example.invalid/extra.git"
branch = "stable"

[[auth.tokens]]
subject = "sys"
sha256 = "{digest}"
"#
    );
    let config = ServerConfig::from_toml_str(&input).expect("config must parse");
    assert_eq!(config.listen, "0.0.0.0:8080");
    assert_eq!(config.meta_dir, PathBuf::from("/srv/neopkg/meta"));
    assert_eq!(config.cache_ttl(), Duration::from_secs(60));
    assert!(config.sync_on_start);
    assert_eq!(config.env["NEOPKG_DATA"], "/srv/data");
    let names: Vec<&str> = config.rosters.iter().map(|roster| roster.name.as_str()).collect();
    assert_eq!(names, vec!["central", "extra"]);
    assert_eq!(config.rosters[0].branch, "main");
    assert_eq!(config.rosters[1].branch, "stable");
    assert_eq!(config.auth.tokens[0].sha256, digest);
}

#[test]
fn config_rejects_invalid_values() {
    let cases = [
        ("rosters = []", "at least one roster"),
        (
            "[[rosters]]\nname = \"a\"\nurl = \"x\"\n[[rosters]]\nname = \"a\"\nurl = \"y\"",
            "configured twice",
        ),
        ("[[rosters]]\nname = \"a\"\nurl = \" \"", "has no url"),
        ("request_timeout_secs = 0", "request_timeout_secs"),
        ("operation_timeout_secs = 0", "operation_timeout_secs"),
        (
            "[[auth.tokens]]\nsubject = \"sys\"\nsha256 = \"abc\"",
            "sha256 hex digest",
        ),
        (
            "[[auth.tokens]]\nsubject = \" \"\nsha256 = \"abc\"",
            "subject must not be empty",
        ),
    ];
    for (input, expected) in cases {
        let err = ServerConfig::from_toml_str(input).expect_err("config must be rejected");
        assert!(
            format!("{err:#}").contains(expected),
            "'{input}' gave '{err:#}', expected '{expected}'"
        );
    }
}

#[test]
fn config_rejects_unknown_fields() {
    let err = ServerConfig::from_toml_str("listen_addr = \"x\"").expect_err("unknown key");
    assert!(format!("{err:#}").contains("failed to parse config"));
}

#[test]
fn config_load_reads_explicit_path() {
    let root = test_server_root();
    let path = root.join("neopkg.toml");
    fs::write(&path, "listen = \"127.0.0.1:9999\"\n").expect("must write config");

    let config = ServerConfig::load(Some(&path)).expect("must load config");
    assert_eq!(config.listen, "127.0.0.1:9999");

    let err = ServerConfig::load(Some(&root.join("missing.toml"))).expect_err("missing file");
    assert!(format!("{err:#}").contains("failed reading config"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn token_auth_maps_digests_to_claims() {
    let auth = TokenAuth::new(&tokens());
    let admin = auth.claim_for(ADMIN_TOKEN).expect("admin token must be known");
    assert!(admin.is_admin());
    let viewer = auth.claim_for(VIEWER_TOKEN).expect("viewer token must be known");
    assert_eq!(viewer.subject, "viewer");
    assert!(!viewer.is_admin());
    assert!(auth.claim_for("guess").is_none());

    assert_eq!(
        TokenAuth::digest("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert!(Claim {
        subject: "SYS".to_string()
    }
    .is_admin());
}

#[test]
fn relative_paths_refuse_traversal_and_hidden_entries() {
    assert_eq!(
        safe_relative_path("/css//site.css", false),
        Some(PathBuf::from("css/site.css"))
    );
    assert_eq!(safe_relative_path("", false), Some(PathBuf::new()));
    assert_eq!(safe_relative_path("a/../../etc/passwd", false), None);
    assert_eq!(safe_relative_path("a\\b", false), None);
    assert_eq!(safe_relative_path(".env", false), None);
    assert_eq!(safe_relative_path("conf/.secret", false), None);
    assert_eq!(safe_relative_path(".env", true), Some(PathBuf::from(".env")));
    assert_eq!(safe_relative_path("../.env", true), None);
}

#[test]
fn content_types_follow_extensions() {
    assert_eq!(content_type(Path::new("index.HTML")), mime::TEXT_HTML_UTF_8);
    assert_eq!(content_type(Path::new("app.js")), mime::APPLICATION_JAVASCRIPT_UTF_8);
    assert_eq!(content_type(Path::new("data.json")), mime::APPLICATION_JSON);
    assert_eq!(content_type(Path::new("logo.png")), mime::IMAGE_PNG);
    assert_eq!(content_type(Path::new("module.wasm")).essence_str(), "application/wasm");
    assert_eq!(content_type(Path::new("blob")), mime::APPLICATION_OCTET_STREAM);
}

#[tokio::test]
async fn static_files_serve_index_and_write_nested_paths() {
    let root = test_server_root();
    fs::create_dir_all(root.join("docs")).expect("must create docs");
    fs::write(root.join("index.html"), "<h1>home</h1>").expect("must write index");
    fs::write(root.join("docs/index.html"), "<h1>docs</h1>").expect("must write docs index");

    let home = read_file(&root, "", false, true)
        .await
        .expect("must read")
        .expect("index must resolve");
    assert_eq!(home.bytes, b"<h1>home</h1>");
    assert_eq!(home.content_type, mime::TEXT_HTML_UTF_8);
    let docs = read_file(&root, "docs", false, true)
        .await
        .expect("must read")
        .expect("docs index must resolve");
    assert_eq!(docs.bytes, b"<h1>docs</h1>");
    assert!(read_file(&root, "docs", false, false)
        .await
        .expect("must read")
        .is_none());
    assert!(read_file(&root, "missing.txt", false, true)
        .await
        .expect("must read")
        .is_none());

    let written = write_file(&root, "data/a/b.json", false, b"{}")
        .await
        .expect("must write")
        .expect("path must be accepted");
    assert_eq!(written, root.join("data/a/b.json"));
    assert!(write_file(&root, ".env", false, b"X=1")
        .await
        .expect("must not fail")
        .is_none());
    assert!(write_file(&root, "", true, b"x")
        .await
        .expect("must not fail")
        .is_none());
    assert!(!root.join(".env").exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn process_actions_parse_known_names_only() {
    assert_eq!("start".parse::<ProcessAction>().expect("start"), ProcessAction::Start);
    assert_eq!("stop".parse::<ProcessAction>().expect("stop"), ProcessAction::Stop);
    assert_eq!("status".parse::<ProcessAction>().expect("status"), ProcessAction::Status);
    let err = "restart".parse::<ProcessAction>().expect_err("unknown action");
    assert!(err.to_string().contains("restart"));
}

#[test]
fn installer_env_carries_config_table_and_host_path() {
    let mut extra = std::collections::BTreeMap::new();
    extra.insert("NEOPKG_DATA".to_string(), "/srv/data".to_string());
    let env = installer_env(&extra);

    assert!(env
        .iter()
        .any(|(key, value)| key == "NEOPKG_DATA" && value == "/srv/data"));
    let host = env
        .iter()
        .find(|(key, _)| key == HOST_ENV)
        .expect("host variable must be set");
    assert!(!host.1.is_empty());
    assert!(env.iter().all(|(key, _)| key != "PATH"));
}

#[tokio::test]
async fn install_downloads_extracts_and_publishes_current() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", Some("echo installing $NEOPKG_MARK"), None);
    let roster = fixture.roster(Duration::from_secs(3600));

    let mut log = Vec::new();
    let env = vec![("NEOPKG_MARK".to_string(), "ok".to_string())];
    let cache = roster
        .install("webx", &env, &mut log)
        .await
        .expect("install must succeed");

    assert_eq!(cache.latest_release, "1.2.3");
    assert_eq!(cache.latest_release_tag, "v1.2.3");
    assert_eq!(cache.installed_version, "1.2.3");
    assert_eq!(
        cache.github.as_ref().map(|github| github.full_name.as_str()),
        Some("acme/webx")
    );
    assert!(cache.url.ends_with("/download/webx-1.2.3.tar.gz"));
    assert_eq!(String::from_utf8_lossy(&log).trim(), "installing ok");

    let layout = roster.layout();
    let index = layout.version_dir("webx", "1.2.3").join("index.html");
    assert_eq!(
        fs::read_to_string(index).expect("index must be extracted"),
        "<h1>webx 1.2.3</h1>"
    );
    let current = roster
        .installed_version("webx")
        .expect("must read current")
        .expect("current must exist");
    assert_eq!(current.version, "1.2.3");
    assert_eq!(cache.installed_path, current.link.display().to_string());

    let stored = roster
        .catalog()
        .cache_store("central")
        .expect("central store")
        .read_cache("webx")
        .expect("must read cache")
        .expect("cache must be written");
    assert_eq!(stored.installed_version, "1.2.3");
}

#[tokio::test]
async fn install_of_newer_release_keeps_previous_version_tree() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    let roster = fixture.roster(Duration::from_secs(3600));

    roster
        .install("webx", &[], &mut Vec::new())
        .await
        .expect("first install must succeed");
    fixture.set_latest("v1.2.4");
    let cache = roster
        .install("webx", &[], &mut Vec::new())
        .await
        .expect("upgrade must succeed");

    assert_eq!(cache.installed_version, "1.2.4");
    let layout = roster.layout();
    assert!(layout.version_dir("webx", "1.2.3").join("index.html").is_file());
    assert!(layout.version_dir("webx", "1.2.4").join("index.html").is_file());
    let current = roster
        .installed_version("webx")
        .expect("must read current")
        .expect("current must exist");
    assert_eq!(current.version, "1.2.4");
}

#[tokio::test]
async fn failing_install_hook_is_reported_but_keeps_new_version() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", Some("echo broken\nexit 3"), None);
    let roster = fixture.roster(Duration::from_secs(3600));

    let mut log = Vec::new();
    let err = roster
        .install("webx", &[], &mut log)
        .await
        .expect_err("hook failure must surface");
    assert!(format!("{err:#}").contains("install script of 'webx' failed"));
    assert!(String::from_utf8_lossy(&log).contains("broken"));
    let current = roster
        .installed_version("webx")
        .expect("must read current")
        .expect("current must stay published");
    assert_eq!(current.version, "1.2.3");
}

#[tokio::test]
async fn install_of_unknown_package_is_not_found() {
    let fixture = Fixture::start().await;
    let roster = fixture.roster(Duration::from_secs(3600));

    let err = roster
        .install("nothing", &[], &mut Vec::new())
        .await
        .expect_err("unknown package");
    assert!(matches!(
        err.downcast_ref::<PkgError>(),
        Some(PkgError::NotFound(name)) if name == "nothing"
    ));

    let err = roster
        .install("Bad Name", &[], &mut Vec::new())
        .await
        .expect_err("invalid name");
    assert!(err.to_string().contains("invalid package name"));
}

#[tokio::test]
async fn uninstall_removes_version_and_keeps_storage() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, Some("echo bye > ../farewell.txt"));
    let roster = fixture.roster(Duration::from_secs(3600));
    roster
        .install("webx", &[], &mut Vec::new())
        .await
        .expect("install must succeed");

    let layout = roster.layout();
    let storage = layout.storage_dir("webx");
    fs::create_dir_all(&storage).expect("must create storage");
    fs::write(storage.join("notes.txt"), "keep me").expect("must write storage file");

    roster
        .uninstall("webx", &[], &mut Vec::new())
        .await
        .expect("uninstall must succeed");

    assert!(!layout.version_dir("webx", "1.2.3").exists());
    assert!(fs::symlink_metadata(layout.current_link("webx")).is_err());
    assert!(roster.installed_version("webx").expect("must read").is_none());
    assert_eq!(
        fs::read_to_string(storage.join("notes.txt")).expect("storage must survive"),
        "keep me"
    );
    assert!(layout.package_dir("webx").join("farewell.txt").is_file());

    let cache = roster
        .catalog()
        .cache_store("central")
        .expect("central store")
        .read_cache("webx")
        .expect("must read cache")
        .expect("cache must remain");
    assert!(!cache.is_installed());
    assert_eq!(cache.latest_release, "1.2.3");

    let err = roster
        .uninstall("webx", &[], &mut Vec::new())
        .await
        .expect_err("second uninstall has nothing to remove");
    assert!(matches!(
        err.downcast_ref::<PkgError>(),
        Some(PkgError::NotInstalled(_))
    ));
}

#[tokio::test]
async fn uninstall_refuses_cache_path_outside_package() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    let roster = fixture.roster(Duration::from_secs(3600));

    let outside = fixture.root.join("outside.txt");
    fs::write(&outside, "precious").expect("must write outside file");
    let cache = PackageCache {
        installed_version: "1.0.0".to_string(),
        installed_path: outside.display().to_string(),
        ..PackageCache::new("webx")
    };
    roster
        .catalog()
        .cache_store("central")
        .expect("central store")
        .write_cache(&cache)
        .expect("must write cache");

    let err = roster
        .uninstall("webx", &[], &mut Vec::new())
        .await
        .expect_err("escaping path must be refused");
    assert!(matches!(
        err.downcast_ref::<PkgError>(),
        Some(PkgError::PathEscape(_))
    ));
    assert_eq!(
        fs::read_to_string(&outside).expect("outside file must survive"),
        "precious"
    );
}

#[tokio::test]
async fn search_returns_exact_entry_and_ranked_possibles() {
    let fixture = Fixture::start().await;
    fixture.write_meta("neo-web", "acme/neo-web", None, None);
    let roster = fixture.roster(Duration::from_secs(3600));
    let store = roster.catalog().cache_store("central").expect("central store");
    for name in ["neo-web", "neo-webx", "neo-weather", "web-app", "zzz"] {
        let mut cache = fresh_cache(name);
        if name == "neo-web" {
            cache.installed_version = "1.0.0".to_string();
            cache.installed_path = "/gone".to_string();
        }
        store.write_cache(&cache).expect("must write cache");
    }

    let result = roster.search("neo-web", 3).await.expect("search must succeed");
    let exact = result.exact.expect("exact entry must be present");
    assert_eq!(exact.name, "neo-web");
    assert_eq!(exact.latest_release, "0.9.0");
    assert!(!exact.is_installed(), "install fields must be healed");
    let names: Vec<&str> = result.possibles.iter().map(|cache| cache.name.as_str()).collect();
    assert_eq!(names, vec!["neo-web", "neo-webx", "neo-weather"]);

    let listing = roster.search("", 2).await.expect("listing must succeed");
    assert!(listing.exact.is_none());
    let names: Vec<&str> = listing.possibles.iter().map(|cache| cache.name.as_str()).collect();
    assert_eq!(names, vec!["neo-weather", "neo-web"]);

    let mixed_case = roster.search("Neo-Web", 2).await.expect("mixed case query must rank");
    assert!(mixed_case.exact.is_none());
    let names: Vec<&str> = mixed_case.possibles.iter().map(|cache| cache.name.as_str()).collect();
    assert_eq!(names, vec!["neo-web", "neo-webx"]);

    let exact_only = roster.search("zzz", 0).await.expect("search must succeed");
    assert!(exact_only.exact.is_none(), "zzz has no package meta");
    assert!(exact_only.possibles.is_empty());
}

#[tokio::test]
async fn search_refreshes_expired_cache_and_falls_back_when_upstream_fails() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    fixture.write_meta("ghost", "acme/missing", None, None);
    let roster = fixture.roster(Duration::ZERO);
    let store = roster.catalog().cache_store("central").expect("central store");
    store.write_cache(&fresh_cache("webx")).expect("must write cache");
    store.write_cache(&fresh_cache("ghost")).expect("must write cache");

    let refreshed = roster.search("webx", 0).await.expect("search must succeed");
    assert_eq!(
        refreshed.exact.expect("exact entry").latest_release,
        "1.2.3",
        "expired entry must be refreshed from upstream"
    );

    let stale = roster.search("ghost", 0).await.expect("stale entry must be served");
    assert_eq!(stale.exact.expect("exact entry").latest_release, "0.9.0");

    fixture.write_meta("phantom", "acme/missing", None, None);
    let err = roster
        .search("phantom", 0)
        .await
        .expect_err("no cache and no upstream");
    assert!(matches!(
        err.downcast_ref::<PkgError>(),
        Some(PkgError::Upstream { status: 404, .. })
    ));
}

#[tokio::test]
async fn admin_routes_require_sys_claim() {
    let fixture = Fixture::start().await;
    let app = fixture.app();

    let (status, body) = send(&app, Method::GET, "/sync", None, Body::empty()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["reason"], json!("unauthorized"));

    let (status, _) = send(&app, Method::GET, "/install/webx", Some(VIEWER_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Method::GET, "/install/webx", Some("wrong"), Body::empty()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        Method::GET,
        "/install/nothing",
        Some(ADMIN_TOKEN),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));

    let (status, _) = send(
        &app,
        Method::GET,
        "/process/nothing/status",
        Some(ADMIN_TOKEN),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::GET,
        "/process/nothing/jump",
        Some(ADMIN_TOKEN),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["reason"].as_str().expect("reason").contains("jump"));
}

#[tokio::test]
async fn search_route_is_public() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    let app = fixture.app();

    let (status, body) = send(
        &app,
        Method::GET,
        "/search?name=webx&possibles=nope",
        None,
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["reason"], json!("success"));
    assert_eq!(body["data"]["exact"]["name"], json!("webx"));
    assert_eq!(body["data"]["possibles"], json!([]));
    assert!(body["elapse"].as_str().is_some());
}

#[tokio::test]
async fn uninstall_route_maps_path_escape_to_bad_request() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    let cache = PackageCache {
        installed_version: "1.0.0".to_string(),
        installed_path: "/etc/passwd".to_string(),
        ..PackageCache::new("webx")
    };
    let app = {
        let roster = fixture.roster(Duration::from_secs(3600));
        roster
            .catalog()
            .cache_store("central")
            .expect("central store")
            .write_cache(&cache)
            .expect("must write cache");
        fixture.app_with(roster)
    };

    let (status, body) = send(
        &app,
        Method::GET,
        "/uninstall/webx",
        Some(ADMIN_TOKEN),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert!(body["data"]["log"].is_string());
}

#[cfg(unix)]
#[tokio::test]
async fn installed_app_is_served_with_storage_and_backend_control() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", Some("echo installed"), None);
    let app = fixture.app();

    let (status, body) = send(&app, Method::GET, "/apps/webx/", None, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], json!("package 'webx' not found"));

    let (status, body) = send(&app, Method::GET, "/install/webx", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["info"]["installed_version"], json!("1.2.3"));
    assert_eq!(body["data"]["log"], json!("installed\n"));

    let (status, page) = send_raw(&app, Method::GET, "/apps/webx/", None, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page, b"<h1>webx 1.2.3</h1>");
    let (status, page) = send_raw(&app, Method::GET, "/apps/webx/index.html", None, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page, b"<h1>webx 1.2.3</h1>");
    let (status, _) = send_raw(&app, Method::GET, "/apps/webx/.backend.yml", None, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send_raw(&app, Method::POST, "/apps/webx/index.html", None, Body::empty()).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, _) = send(
        &app,
        Method::POST,
        "/apps/webx/_storage/notes/a.txt",
        None,
        Body::from("hello"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, stored) = send_raw(&app, Method::GET, "/apps/webx/_storage/notes/a.txt", None, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored, b"hello");

    let (status, _) = send(
        &app,
        Method::POST,
        "/storage/webx/.settings",
        Some(ADMIN_TOKEN),
        Body::from("secret=1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send_raw(&app, Method::GET, "/apps/webx/_storage/.settings", None, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, stored) = send_raw(&app, Method::GET, "/storage/webx/.settings", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored, b"secret=1");

    let (status, body) = send(&app, Method::GET, "/process/webx/status", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("stopped"));
    let (status, body) = send(&app, Method::GET, "/process/webx/start", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("running"));
    let (status, body) = send(&app, Method::GET, "/process/webx/stop", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("stopped"));

    let (status, body) = send(&app, Method::GET, "/uninstall/webx", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    let (status, _) = send(&app, Method::GET, "/apps/webx/", None, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::GET, "/process/webx/status", Some(ADMIN_TOKEN), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[cfg(unix)]
#[tokio::test]
async fn manager_picks_up_backends_of_existing_installs() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    {
        let roster = fixture.roster(Duration::from_secs(3600));
        roster
            .install("webx", &[], &mut Vec::new())
            .await
            .expect("install must succeed");
    }

    let manager = PkgManager::with_roster(fixture.roster(Duration::from_secs(3600)), Vec::new())
        .expect("manager must scan dist");
    let backend = manager.backend("webx").await.expect("backend must be loaded");
    assert!(!backend.auto_start());
    assert_eq!(
        manager
            .process("webx", ProcessAction::Status)
            .await
            .expect("status must succeed"),
        BackendStatus::Stopped
    );
    manager.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn upgrade_restarts_running_backend_without_blocking_lookups() {
    let fixture = Fixture::start().await;
    fixture.write_meta("webx", "acme/webx", None, None);
    let manager = Arc::new(
        PkgManager::with_roster(fixture.roster(Duration::from_secs(3600)), Vec::new())
            .expect("manager must build"),
    );
    manager
        .install("webx", &mut tokio::io::sink())
        .await
        .expect("install must succeed");
    assert_eq!(
        manager
            .process("webx", ProcessAction::Start)
            .await
            .expect("start must succeed"),
        BackendStatus::Running
    );

    fixture.set_latest("v1.2.4");
    let upgrade = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.install("webx", &mut tokio::io::sink()).await }
    });

    // The stop script sleeps, so the backend is out of the map for a while.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let found = tokio::time::timeout(Duration::from_millis(500), manager.backend("webx"))
            .await
            .expect("backend lookup must not wait on the restart");
        if found.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "backend was never taken out during the upgrade"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cache = upgrade
        .await
        .expect("upgrade task must not panic")
        .expect("upgrade must succeed");
    assert_eq!(cache.installed_version, "1.2.4");
    let backend = manager.backend("webx").await.expect("backend must be back");
    assert_eq!(backend.status().await, BackendStatus::Running);
    manager.stop().await;
}

struct Fixture {
    root: PathBuf,
    api: String,
    latest: Arc<Mutex<String>>,
}

impl Fixture {
    async fn start() -> Self {
        let root = test_server_root();
        let latest = Arc::new(Mutex::new("v1.2.3".to_string()));
        let api = spawn_upstream(Arc::clone(&latest)).await;
        Self { root, api, latest }
    }

    fn set_latest(&self, tag: &str) {
        *self.latest.lock().expect("latest tag lock") = tag.to_string();
    }

    fn write_meta(&self, name: &str, github: &str, install: Option<&str>, uninstall: Option<&str>) {
        let dir = self.root.join("meta/central/projects").join(name);
        fs::create_dir_all(&dir).expect("must create package dir");
        let mut yaml = format!(
            "description: {name} test package\ndistributable:\n  github: {github}\n  url: \"{}/download/{name}-{{{{.version}}}}.tar.gz\"\n  strip_components: 1\n",
            self.api
        );
        if let Some(script) = install {
            yaml.push_str(&format!("install:\n  script: {}\n", yaml_block(script)));
        }
        if let Some(script) = uninstall {
            yaml.push_str(&format!("uninstall:\n  script: {}\n", yaml_block(script)));
        }
        fs::write(dir.join("package.yml"), yaml).expect("must write package meta");
    }

    fn roster(&self, cache_ttl: Duration) -> Roster {
        let catalog = Catalog::new(
            self.root.join("meta"),
            vec![RosterSource::new("central", "https://example.invalid/central.git")],
        )
        .expect("catalog must build");
        let github = GithubClient::new(&self.api, None, Duration::from_secs(5))
            .expect("client must build");
        Roster::from_parts(
            catalog,
            &self.root.join("dist"),
            github,
            reqwest::Client::new(),
            cache_ttl,
        )
        .expect("roster must build")
    }

    fn app(&self) -> Router {
        self.app_with(self.roster(Duration::from_secs(3600)))
    }

    fn app_with(&self, roster: Roster) -> Router {
        let manager = PkgManager::with_roster(roster, Vec::new()).expect("manager must build");
        let state = AppState::new(
            Arc::new(manager),
            TokenAuth::new(&tokens()),
            Duration::from_secs(30),
        );
        router(state)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn yaml_block(script: &str) -> String {
    let mut block = "|\n".to_string();
    for line in script.lines() {
        block.push_str("    ");
        block.push_str(line);
        block.push('\n');
    }
    block
}

fn tokens() -> Vec<AuthToken> {
    vec![
        AuthToken {
            subject: "sys".to_string(),
            sha256: TokenAuth::digest(ADMIN_TOKEN),
        },
        AuthToken {
            subject: "viewer".to_string(),
            sha256: TokenAuth::digest(VIEWER_TOKEN),
        },
    ]
}

fn fresh_cache(name: &str) -> PackageCache {
    PackageCache {
        latest_release: "0.9.0".to_string(),
        latest_release_tag: "v0.9.0".to_string(),
        cached_at: Some(OffsetDateTime::now_utc()),
        ..PackageCache::new(name)
    }
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Body,
) -> (StatusCode, Value) {
    let (status, bytes) = send_raw(app, method, uri, token, body).await;
    let value = serde_json::from_slice(&bytes).expect("response must be json");
    (status, value)
}

async fn send_raw(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Body,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("must build request"))
        .await
        .expect("router must respond");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("must read body")
        .to_bytes();
    (status, bytes.to_vec())
}

async fn spawn_upstream(latest: Arc<Mutex<String>>) -> String {
    let app = Router::new()
        .route("/repos/{org}/{repo}", get(upstream_repo))
        .route("/repos/{org}/{repo}/releases/latest", get(upstream_latest))
        .route("/download/{file}", get(upstream_download))
        .with_state(latest);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind upstream");
    let addr = listener.local_addr().expect("must read upstream address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn upstream_repo(UrlPath((org, repo)): UrlPath<(String, String)>) -> Response {
    if repo == "missing" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "name": repo,
        "full_name": format!("{org}/{repo}"),
        "description": "test package",
        "homepage": null,
        "language": "Rust",
        "license": { "spdx_id": "MIT", "name": "MIT License" },
        "default_branch": "main",
        "owner": { "login": org },
    }))
    .into_response()
}

async fn upstream_latest(
    State(latest): State<Arc<Mutex<String>>>,
    UrlPath((_org, repo)): UrlPath<(String, String)>,
) -> Response {
    if repo == "missing" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let tag = latest.lock().expect("latest tag lock").clone();
    Json(json!({
        "tag_name": tag,
        "name": tag,
        "tarball_url": format!("https://example.invalid/{repo}/{tag}.tar.gz"),
        "published_at": "2024-05-01T10:00:00Z",
        "prerelease": false,
    }))
    .into_response()
}

async fn upstream_download(UrlPath(file): UrlPath<String>) -> Response {
    let Some(version) = file
        .strip_prefix("webx-")
        .and_then(|rest| rest.strip_suffix(".tar.gz"))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    release_tarball(version).into_response()
}

fn release_tarball(version: &str) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let entries = [
        ("index.html", format!("<h1>webx {version}</h1>")),
        (".backend.yml", BACKEND_YML.to_string()),
    ];
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("webx-{version}/{path}"), content.as_bytes())
            .expect("must append tar entry");
    }
    builder
        .into_inner()
        .expect("must finish tar")
        .finish()
        .expect("must finish gzip")
}

fn test_server_root() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock must be after unix epoch")
        .as_nanos();
    let sequence = COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!(
        "neopkg-server-tests-{}-{nanos}-{sequence}",
        std::process::id()
    ));
    fs::create_dir_all(&root).expect("must create test root");
    root
}
