//! HTTP API tests
//!
//! Drive the router with `oneshot` against in-memory storage and an
//! in-memory snapshot source; no database required.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use electric_core::{
    ChangeItem, CacheConfig, Collector, Column, Handle, LogItem, LogOffset, MemorySource,
    MemoryStorage, Reader, ReaderConfig, Relation, RelationColumn, Row, ShapeCache, TableSchema,
    Value, WalMessage,
};
use electricd::ShapeServer;
use http_body_util::BodyExt;
use serde_json::Value as Json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::util::ServiceExt;

const USERS: u32 = 16384;

fn users_schema() -> TableSchema {
    TableSchema::new(
        "public",
        "users",
        vec![
            Column::new("id", "int4").with_pk_index(0),
            Column::new("name", "text"),
            Column::new("email", "text"),
            Column::new("age", "int4"),
            Column::new("active", "bool"),
        ],
    )
}

fn orders_schema() -> TableSchema {
    TableSchema::new(
        "public",
        "orders",
        vec![
            Column::new("id", "int8").with_pk_index(0),
            Column::new("total", "numeric"),
        ],
    )
}

fn user(id: i64, name: &str, active: bool) -> Row {
    Row::from([
        ("id".to_string(), Value::Int(id)),
        ("name".to_string(), Value::from(name)),
        ("email".to_string(), Value::from(format!("{name}@example.com"))),
        ("age".to_string(), Value::Int(30)),
        ("active".to_string(), Value::Bool(active)),
    ])
}

struct TestApp {
    cache: ShapeCache,
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        Self::with(ReaderConfig::default(), None)
    }

    fn with(reader_config: ReaderConfig, secret: Option<&str>) -> Self {
        let source = Arc::new(MemorySource::new());
        source.add_table(users_schema(), vec![user(1, "a", true), user(2, "b", true)]);
        source.add_table(orders_schema(), Vec::new());
        let cache = ShapeCache::new(
            CacheConfig::default(),
            Arc::new(MemoryStorage::new()),
            source.clone(),
            source,
        );
        let mut server = ShapeServer::new(Reader::new(cache.clone(), reader_config));
        if let Some(secret) = secret {
            server = server.with_secret(secret);
        }
        Self {
            router: server.router(),
            cache,
        }
    }

    async fn request(&self, method: Method, uri: &str) -> Response {
        self.router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.request(Method::GET, uri).await
    }

    /// Initial read of a table; returns the handle
    async fn subscribe(&self, table: &str) -> Handle {
        let response = self.get(&format!("/v1/shape?table={table}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        Handle::parse(header(&response, "electric-handle")).unwrap()
    }
}

fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name} header"))
        .to_str()
        .unwrap()
}

async fn json(response: Response) -> Json {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_basic_round_trip() {
    let app = TestApp::new();
    let response = app.get("/v1/shape?table=users").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("electric-schema"));
    assert!(!header(&response, "etag").is_empty());
    assert_eq!(header(&response, "electric-offset"), "0_0");
    assert_eq!(header(&response, "cache-control"), "public, max-age=604800");
    assert_eq!(header(&response, "content-type"), "application/json");

    let schema: Json = serde_json::from_str(header(&response, "electric-schema")).unwrap();
    assert_eq!(schema["id"]["type"], "int4");
    assert_eq!(schema["id"]["pk_index"], 0);

    let body = json(response).await;
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["key"], r#""public"."users"/"1""#);
    assert_eq!(items[1]["key"], r#""public"."users"/"2""#);
    assert_eq!(items[0]["headers"]["operation"], "insert");
}

#[tokio::test]
async fn test_unknown_handle_is_gone() {
    let app = TestApp::new();
    let response = app
        .get("/v1/shape?table=users&handle=0123456789abcdef-1&offset=0_0")
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        header(&response, "cache-control"),
        "no-cache, no-store, must-revalidate"
    );
    for name in ["electric-handle", "electric-offset", "electric-schema"] {
        assert!(!response.headers().contains_key(name), "{name} present");
    }
    let body = json(response).await;
    assert_eq!(body["error"], "shape_gone");
}

#[tokio::test]
async fn test_read_from_offset() {
    let app = TestApp::new();
    let handle = app.subscribe("users").await;

    let item: LogItem = ChangeItem::insert(
        LogOffset::new(1, 0),
        r#""public"."users"/"3""#.to_string(),
        Default::default(),
    )
    .into();
    app.cache
        .storage()
        .append_to_log(&handle, vec![item])
        .await
        .unwrap();
    app.cache.update_offset(&handle, LogOffset::new(1, 0));

    let response = app
        .get(&format!("/v1/shape?table=users&handle={handle}&offset=0_0"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "electric-offset"), "1_0");
    assert!(!response.headers().contains_key("electric-schema"));
    let body = json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_long_poll_timeout() {
    let app = TestApp::with(
        ReaderConfig::default().with_long_poll_timeout(Duration::from_millis(100)),
        None,
    );
    let handle = app.subscribe("users").await;

    let started = Instant::now();
    let response = app
        .get(&format!(
            "/v1/shape?table=users&handle={handle}&offset=0_0&live=true"
        ))
        .await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "electric-up-to-date"), "true");
    assert!(response.headers().contains_key("electric-cursor"));
    assert_eq!(header(&response, "cache-control"), "no-store");
    assert_eq!(json(response).await, Json::Array(Vec::new()));
}

#[tokio::test]
async fn test_primary_key_change_and_column_filter() {
    let app = TestApp::new();
    let response = app
        .get("/v1/shape?table=users&where=active%20%3D%20true&columns=name,email")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let handle = Handle::parse(header(&response, "electric-handle")).unwrap();

    let mut collector = Collector::new(app.cache.dispatcher());
    collector.process(WalMessage::Relation(Relation::new(
        USERS,
        "public",
        "users",
        vec![
            RelationColumn::new("id", "int4").key(),
            RelationColumn::new("name", "text"),
            RelationColumn::new("email", "text"),
            RelationColumn::new("age", "int4"),
            RelationColumn::new("active", "bool"),
        ],
    )));
    collector.process(WalMessage::Begin {
        xid: 900,
        final_lsn: 5000,
    });
    collector.process(WalMessage::Update {
        relation_id: USERS,
        old: Some(user(1, "a", true)),
        new: user(100, "a", true),
    });
    collector.process(WalMessage::Insert {
        relation_id: USERS,
        new: user(7, "g", true),
    });
    assert!(collector
        .process(WalMessage::Commit {
            commit_lsn: 5000,
            end_lsn: 5008,
        })
        .is_empty());

    let response = app
        .get(&format!(
            "/v1/shape?table=users&where=active%20%3D%20true&columns=name,email&handle={handle}&offset=0_0&live=true"
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 3);

    let delete = &items[0];
    let insert = &items[1];
    assert_eq!(delete["headers"]["operation"], "delete");
    assert_eq!(delete["offset"], "5000_0");
    assert_eq!(delete["headers"]["key_change_to"], r#""public"."users"/"100""#);
    assert_eq!(insert["headers"]["operation"], "insert");
    assert_eq!(insert["offset"], "5000_1");
    assert_eq!(insert["headers"]["key_change_from"], r#""public"."users"/"1""#);
    assert_eq!(delete["headers"]["txids"], insert["headers"]["txids"]);

    let inserted = &items[2]["value"];
    let mut keys: Vec<&str> = inserted
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["email", "id", "name"]);
}

#[tokio::test]
async fn test_delete_by_table() {
    let app = TestApp::new();
    let users = app.subscribe("users").await;
    let orders = app.subscribe("orders").await;

    let response = app.request(Method::DELETE, "/v1/shape?table=users").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!app.cache.has_shape(&users));
    assert!(app.cache.has_shape(&orders));

    let response = app.request(Method::DELETE, "/v1/shape?table=users").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_by_handle() {
    let app = TestApp::new();
    let handle = app.subscribe("users").await;

    let response = app
        .request(Method::DELETE, &format!("/v1/shape/{handle}"))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!app.cache.has_shape(&handle));

    let response = app
        .request(Method::DELETE, &format!("/v1/shape?handle={handle}"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["error"], "not_found");

    let response = app.request(Method::DELETE, "/v1/shape").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bad_requests() {
    let app = TestApp::new();
    for uri in [
        "/v1/shape",
        "/v1/shape?table=users&offset=nope",
        "/v1/shape?table=users&replica=partial",
        "/v1/shape?table=users&columns=name,,email",
        "/v1/shape?table=users&columns=nope",
        "/v1/shape?table=users&where=(",
        "/v1/shape?table=missing",
    ] {
        let response = app.get(uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json(response).await["error"], "bad_request", "{uri}");
    }
}

#[tokio::test]
async fn test_table_required_with_handle() {
    let app = TestApp::new();
    let handle = app.subscribe("users").await;

    let response = app
        .get(&format!("/v1/shape?handle={handle}&offset=0_0"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["error"], "bad_request");
    assert_eq!(body["message"], "table is required");
}

#[tokio::test]
async fn test_offset_without_handle() {
    let app = TestApp::new();
    let handle = app.subscribe("users").await;

    let response = app.get("/v1/shape?table=users&offset=0_0").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "electric-handle"), handle.to_string());
    assert!(!response.headers().contains_key("electric-schema"));
    let body = json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_if_none_match() {
    let app = TestApp::new();
    let response = app.get("/v1/shape?table=users").await;
    let etag = header(&response, "etag").to_string();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/shape?table=users")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&response, "etag"), etag);
}

#[tokio::test]
async fn test_preflight() {
    let app = TestApp::with(ReaderConfig::default(), Some("s3cret"));
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/shape")
                .header(header::ORIGIN, "https://example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "access-control-allow-origin"), "*");
    assert_eq!(header(&response, "access-control-max-age"), "86400");
    let methods = header(&response, "access-control-allow-methods");
    for method in ["GET", "DELETE", "OPTIONS"] {
        assert!(methods.contains(method), "{methods}");
    }
}

#[tokio::test]
async fn test_exposed_headers() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/shape?table=users")
                .header(header::ORIGIN, "https://example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(header(&response, "access-control-allow-origin"), "*");
    let exposed = header(&response, "access-control-expose-headers");
    for name in ["electric-handle", "electric-offset", "electric-cursor", "etag"] {
        assert!(exposed.contains(name), "{exposed}");
    }
}

#[tokio::test]
async fn test_secret() {
    let app = TestApp::with(ReaderConfig::default(), Some("s3cret"));

    let response = app.get("/v1/shape?table=users").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/v1/shape?table=users&secret=wrong").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/v1/shape?table=users&secret=s3cret").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.get("/v1/shape?table=users&api_secret=s3cret").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_and_root() {
    let app = TestApp::new();
    for uri in ["/health", "/v1/health"] {
        let response = app.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!({"status": "ok"}));
    }
    let response = app.get("/").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_and_server_headers() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(header(&response, "x-request-id"), "req-42");
    assert_eq!(header(&response, "electric-server"), electricd::SERVER_VERSION);

    let response = app.get("/v1/shape").await;
    assert_eq!(header(&response, "x-request-id").len(), 32);
}
