mod common;

use std::time::Duration;

use common::*;
use faros_ingress::client::ClientError;
use faros_ingress::config::Database;
use faros_ingress::store::{Connection, SqliteStore, Store};
use http::StatusCode;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A public request reaches the local service through the tunnel, with the
/// original host carried in X-Forwarded-Host and the body returned verbatim.
#[tokio::test]
async fn happy_path_proxy() {
	let h = Harness::start(Database::Memory).await;
	let mock = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/ping"))
		.and(header_exists("x-forwarded-host"))
		.respond_with(ResponseTemplate::new(200).set_body_string("pong"))
		.mount(&mock)
		.await;

	let conn = h.create_connection("a", Some("a"), false, None).await;
	assert_eq!(conn.hostname, format!("https://a.{SUFFIX}"));
	let connector = h.spawn_connector(&conn, &mock.uri());

	let hostname = format!("a.{SUFFIX}");
	let client = h.public_client(&hostname);
	let url = h.public_url(&hostname, "/ping");
	wait_for_status(&client, &url, StatusCode::OK).await;

	let resp = client.get(&url).send().await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.text().await.unwrap(), "pong");

	// The forwarded host header reached the local service.
	let received = mock.received_requests().await.unwrap();
	let forwarded = received
		.last()
		.unwrap()
		.headers
		.get("x-forwarded-host")
		.unwrap()
		.to_str()
		.unwrap();
	assert!(forwarded.starts_with(&hostname), "got {forwarded}");

	// Unknown hostnames are a 401, indistinguishable from auth failures.
	let stranger = format!("nope.{SUFFIX}");
	let resp = h
		.public_client(&stranger)
		.get(h.public_url(&stranger, "/ping"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

	connector.stop().await;
}

/// Secured connections demand basic auth: 401 + challenge without it, 200
/// with the credentials echoed at create time.
#[tokio::test]
async fn basic_auth_gating() {
	let h = Harness::start(Database::Memory).await;
	let mock = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("secret"))
		.mount(&mock)
		.await;

	let conn = h.create_connection("sec", Some("sec"), true, None).await;
	assert!(!conn.username.is_empty());
	assert!(!conn.password.is_empty());
	let _connector = h.spawn_connector(&conn, &mock.uri());

	let hostname = format!("sec.{SUFFIX}");
	let client = h.public_client(&hostname);
	let url = h.public_url(&hostname, "/data");

	// Wait for the tunnel via an authenticated request.
	let mut ready = false;
	for _ in 0..100 {
		let resp = client
			.get(&url)
			.basic_auth(&conn.username, Some(&conn.password))
			.send()
			.await
			.unwrap();
		if resp.status() == StatusCode::OK {
			assert_eq!(resp.text().await.unwrap(), "secret");
			ready = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert!(ready, "tunnel never became ready");

	// No credentials: 401 with the basic-auth challenge.
	let resp = client.get(&url).send().await.unwrap();
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	assert_eq!(
		resp.headers().get("www-authenticate").unwrap(),
		"Basic realm=\"restricted\""
	);

	// Wrong credentials: also 401.
	let resp = client
		.get(&url)
		.basic_auth(&conn.username, Some("wrong"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

/// Idle connections past their ttl are collected; their hostname stops
/// resolving and the API reports them gone.
#[tokio::test]
async fn idle_connections_are_garbage_collected() {
	let h = Harness::start(Database::Memory).await;
	let mock = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&mock)
		.await;

	let conn = h.create_connection("gc", Some("gc"), false, Some("400ms")).await;
	let _connector = h.spawn_connector(&conn, &mock.uri());

	let hostname = format!("gc.{SUFFIX}");
	let client = h.public_client(&hostname);
	let url = h.public_url(&hostname, "/");
	// One successful proxy sets last-used.
	wait_for_status(&client, &url, StatusCode::OK).await;

	// Then stay idle well past the ttl (collector ticks every 100ms).
	tokio::time::sleep(Duration::from_millis(1500)).await;
	let resp = client.get(&url).send().await.unwrap();
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

	match h.api_client().get_connection(&conn.id).await {
		Err(ClientError::Api { status, .. }) => assert_eq!(status, StatusCode::NOT_FOUND),
		other => panic!("expected the connection to be collected, got {other:?}"),
	}

	// Connections without a ttl survive arbitrary idleness.
	let forever = h.create_connection("stay", Some("stay"), false, None).await;
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert!(h.api_client().get_connection(&forever.id).await.is_ok());
}

/// Killing the connector mid-flight yields 5xx during the gap; a reconnecting
/// connector restores service on the same tunnel id.
#[tokio::test]
async fn connector_reconnect_restores_service() {
	let h = Harness::start(Database::Memory).await;
	let mock = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("alive"))
		.mount(&mock)
		.await;

	let conn = h.create_connection("re", Some("re"), false, None).await;
	let first = h.spawn_connector(&conn, &mock.uri());

	let hostname = format!("re.{SUFFIX}");
	let client = h.public_client(&hostname);
	let url = h.public_url(&hostname, "/");
	wait_for_status(&client, &url, StatusCode::OK).await;

	// Kill the connector without any goodbye; the control stream dies.
	first.kill();
	let mut saw_gap = false;
	for _ in 0..100 {
		let status = client.get(&url).send().await.unwrap().status();
		if status != StatusCode::OK {
			assert!(status.is_server_error(), "gap should be a 5xx, got {status}");
			saw_gap = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert!(saw_gap, "requests kept succeeding after the connector died");

	// A fresh connector re-dials and takes over the tunnel id.
	let second = h.spawn_connector(&conn, &mock.uri());
	wait_for_status(&client, &url, StatusCode::OK).await;
	let resp = client.get(&url).send().await.unwrap();
	assert_eq!(resp.text().await.unwrap(), "alive");
	second.stop().await;
}

/// A connection inserted by another process (a second store handle on the
/// same database) becomes routable via the polling change stream.
#[tokio::test]
async fn pool_syncs_across_processes() {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("faros.sqlite3");
	let h = Harness::start(Database::Sqlite(db_path.clone())).await;

	// Simulates the API process: a separate handle on the same database.
	let api_process = SqliteStore::open(db_path).await.unwrap();
	let user = api_process.create_user("other@example.com").await.unwrap();
	let mut conn = Connection::new(user.id.clone(), "ext".to_string());
	conn.hostname = format!("https://ext.{SUFFIX}");
	conn.token = "tok-ext".into();
	conn.gateway_url = h.gateway_url();
	let created = api_process.create_connection(conn).await.unwrap();

	let mock = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("synced"))
		.mount(&mock)
		.await;
	let api_conn = faros_ingress::types::Connection {
		id: created.id.to_string(),
		token: created.token.to_string(),
		..Default::default()
	};
	let _connector = h.spawn_connector(&api_conn, &mock.uri());

	let hostname = format!("ext.{SUFFIX}");
	let client = h.public_client(&hostname);
	let url = h.public_url(&hostname, "/");
	wait_for_status(&client, &url, StatusCode::OK).await;
	let resp = client.get(&url).send().await.unwrap();
	assert_eq!(resp.text().await.unwrap(), "synced");
}

/// Concurrent creates for the same hostname: exactly one wins, through the
/// whole API stack.
#[tokio::test]
async fn hostname_collision_is_a_conflict() {
	let h = Harness::start(Database::Memory).await;
	let api = std::sync::Arc::new(h.api_client());
	let make = |name: &str| faros_ingress::types::Connection {
		name: name.to_string(),
		hostname: format!("dup.{SUFFIX}"),
		..Default::default()
	};
	let (a, b) = tokio::join!(
		{
			let api = api.clone();
			let req = make("left");
			async move { api.create_connection(&req).await }
		},
		{
			let api = api.clone();
			let req = make("right");
			async move { api.create_connection(&req).await }
		},
	);
	let results = [a, b];
	let ok = results.iter().filter(|r| r.is_ok()).count();
	let conflicts = results
		.iter()
		.filter(|r| {
			matches!(r, Err(ClientError::Api { status, .. }) if *status == StatusCode::CONFLICT)
		})
		.count();
	assert_eq!((ok, conflicts), (1, 1), "{results:?}");

	let listed = h.store.list_all_connections().await.unwrap();
	assert_eq!(
		listed
			.iter()
			.filter(|c| c.hostname == format!("https://dup.{SUFFIX}"))
			.count(),
		1
	);
}
